use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::envelope::MessageEnvelope;
use crate::error::{LinkError, Result};
use crate::recovery::RecoveryController;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    DebugMemoryInterval,
    DebugMemoryDump,
    AudioDump,
    TraceRoute,
    StatPrint,
    Panic,
    HeapInit,
    Handshake,
    TimeSync,
    CustomControlPlane,
}

/// Request/response command. Created by the caller, copied into a transport
/// buffer, consumed exactly once by the remote dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub p1: i64,
    pub p2: i64,
    pub text: Option<String>,
}

impl Command {
    pub fn new(kind: CommandKind, p1: i64, p2: i64) -> Self {
        Self {
            kind,
            p1,
            p2,
            text: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn handshake(sample_rate: u32, frame_period_ms: u32) -> Self {
        Self::new(
            CommandKind::Handshake,
            i64::from(sample_rate),
            i64::from(frame_period_ms),
        )
    }

    pub fn time_sync(epoch_ms: i64) -> Self {
        Self::new(CommandKind::TimeSync, epoch_ms, 0)
    }
}

/// Sample rate and frame period exchanged at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub sample_rate: u32,
    pub frame_period_ms: u32,
}

/// Host-side command channel riding on the transport.
pub struct CommandChannel {
    transport: Arc<Transport>,
    recovery: Arc<RecoveryController>,
    remote_handshake: Mutex<Option<Handshake>>,
    clock_offset_ms: AtomicI64,
}

impl CommandChannel {
    pub fn new(transport: Arc<Transport>, recovery: Arc<RecoveryController>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            recovery,
            remote_handshake: Mutex::new(None),
            clock_offset_ms: AtomicI64::new(0),
        })
    }

    /// Fire-and-forget command send.
    pub fn send(&self, command: Command) -> Result<()> {
        self.recovery.guard_available()?;
        self.transport.enqueue(MessageEnvelope::command(command))
    }

    /// Blocking variant, used when the caller must know the remote applied
    /// the command before proceeding.
    pub fn send_sync(&self, command: Command, timeout: Duration) -> Result<()> {
        self.recovery.guard_available()?;
        self.transport
            .send_sync(MessageEnvelope::command(command), timeout)
    }

    /// Receive-side hook for command replies arriving from the coprocessor.
    pub(crate) fn on_reply(&self, command: &Command) {
        match command.kind {
            CommandKind::Handshake => {
                let handshake = Handshake {
                    sample_rate: command.p1.max(0) as u32,
                    frame_period_ms: command.p2.max(0) as u32,
                };
                info!(
                    "Handshake reply: {} Hz, {} ms frames",
                    handshake.sample_rate, handshake.frame_period_ms
                );
                if let Ok(mut slot) = self.remote_handshake.lock() {
                    *slot = Some(handshake);
                }
            }
            CommandKind::TimeSync => {
                let offset = command.p1.saturating_sub(epoch_ms());
                self.clock_offset_ms.store(offset, Ordering::SeqCst);
                debug!("Time sync reply: remote clock offset {} ms", offset);
            }
            _ => {
                debug!("Command reply: {:?}", command.kind);
            }
        }
    }

    pub fn remote_handshake(&self) -> Option<Handshake> {
        self.remote_handshake.lock().ok().and_then(|h| *h)
    }

    /// Remote-minus-local clock offset from the last time sync, in ms.
    pub fn clock_offset_ms(&self) -> i64 {
        self.clock_offset_ms.load(Ordering::SeqCst)
    }
}

/// UART route for the coprocessor trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceRoute {
    Shared,
    Uart0,
    Uart1,
}

impl TraceRoute {
    fn from_selector(selector: i64) -> Option<Self> {
        match selector {
            0 => Some(TraceRoute::Shared),
            1 => Some(TraceRoute::Uart0),
            2 => Some(TraceRoute::Uart1),
            _ => None,
        }
    }
}

/// Application hook for the opaque control-plane passthrough command.
pub trait ControlPlaneHook: Send + Sync {
    fn handle(&self, command: &Command) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Local stream parameters advertised in the handshake reply.
    pub sample_rate: u32,
    pub frame_period_ms: u32,
    /// Gate for destructive debug instrumentation (the panic command).
    /// Hardened deployments leave this off.
    pub debug_commands: bool,
    pub panic_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            frame_period_ms: 10,
            debug_commands: false,
            panic_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub handled: u64,
    pub rejected: u64,
}

/// Remote-side command dispatch table.
///
/// One instance lives on the coprocessor runtime (or its in-process double).
/// `dispatch` consumes a command and optionally produces a reply command to
/// be carried back to the host.
pub struct CommandDispatcher {
    config: DispatcherConfig,
    heap_ready: Arc<AtomicBool>,
    audio_dump: AtomicBool,
    trace_route: Mutex<TraceRoute>,
    mem_report_interval_ms: AtomicU64,
    host_handshake: Mutex<Option<Handshake>>,
    clock_offset_ms: AtomicI64,
    hook: Option<Arc<dyn ControlPlaneHook>>,
    handled: AtomicU64,
    rejected: AtomicU64,
}

impl CommandDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            heap_ready: Arc::new(AtomicBool::new(false)),
            audio_dump: AtomicBool::new(false),
            trace_route: Mutex::new(TraceRoute::Shared),
            mem_report_interval_ms: AtomicU64::new(0),
            host_handshake: Mutex::new(None),
            clock_offset_ms: AtomicI64::new(0),
            hook: None,
            handled: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn ControlPlaneHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Shared flag consumed by the codec worker: no coprocessor-side
    /// allocation may happen before the one-time heap bootstrap ran.
    pub fn heap_gate(&self) -> Arc<AtomicBool> {
        self.heap_ready.clone()
    }

    pub fn trace_route(&self) -> TraceRoute {
        self.trace_route
            .lock()
            .map(|r| *r)
            .unwrap_or(TraceRoute::Shared)
    }

    pub fn host_handshake(&self) -> Option<Handshake> {
        self.host_handshake.lock().ok().and_then(|h| *h)
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            handled: self.handled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn dispatch(&self, command: &Command) -> Result<Option<Command>> {
        let reply = match command.kind {
            CommandKind::DebugMemoryInterval => {
                let interval = command.p1.max(0) as u64;
                self.mem_report_interval_ms.store(interval, Ordering::SeqCst);
                info!("Memory report interval set to {} ms", interval);
                None
            }
            CommandKind::DebugMemoryDump => {
                info!(
                    "Memory dump requested: addr={:#010x} len={}",
                    command.p1, command.p2
                );
                None
            }
            CommandKind::AudioDump => {
                let enable = command.p1 != 0;
                self.audio_dump.store(enable, Ordering::SeqCst);
                info!("Audio dump {}", if enable { "enabled" } else { "disabled" });
                None
            }
            CommandKind::TraceRoute => match TraceRoute::from_selector(command.p1) {
                Some(route) => {
                    if let Ok(mut current) = self.trace_route.lock() {
                        info!("Trace route switched: {:?} -> {:?}", *current, route);
                        *current = route;
                    }
                    None
                }
                None => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(LinkError::CommandRejected(format!(
                        "unknown trace route selector {}",
                        command.p1
                    )));
                }
            },
            CommandKind::StatPrint => {
                info!(
                    "Dispatcher stats: handled={} rejected={} heap_ready={} trace_route={:?}",
                    self.handled.load(Ordering::Relaxed),
                    self.rejected.load(Ordering::Relaxed),
                    self.heap_ready.load(Ordering::SeqCst),
                    self.trace_route()
                );
                None
            }
            CommandKind::Panic => {
                if !self.config.debug_commands {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    error!("Panic command refused: debug commands disabled");
                    return Err(LinkError::CommandRejected(
                        "panic command disabled".to_string(),
                    ));
                }
                self.arm_panic(command.p1, self.config.panic_delay);
                None
            }
            CommandKind::HeapInit => {
                if self.heap_ready.swap(true, Ordering::SeqCst) {
                    warn!("Heap init requested twice; ignoring");
                } else {
                    info!(
                        "Coprocessor heap initialized: base={:#010x} size={}",
                        command.p1, command.p2
                    );
                }
                None
            }
            CommandKind::Handshake => {
                let host = Handshake {
                    sample_rate: command.p1.max(0) as u32,
                    frame_period_ms: command.p2.max(0) as u32,
                };
                info!(
                    "Handshake from host: {} Hz, {} ms frames",
                    host.sample_rate, host.frame_period_ms
                );
                if let Ok(mut slot) = self.host_handshake.lock() {
                    *slot = Some(host);
                }
                Some(Command::handshake(
                    self.config.sample_rate,
                    self.config.frame_period_ms,
                ))
            }
            CommandKind::TimeSync => {
                let now = epoch_ms();
                let offset = command.p1.saturating_sub(now);
                self.clock_offset_ms.store(offset, Ordering::SeqCst);
                debug!("Time sync: host clock offset {} ms", offset);
                Some(Command::time_sync(now))
            }
            CommandKind::CustomControlPlane => {
                match &self.hook {
                    Some(hook) => {
                        if let Err(e) = hook.handle(command) {
                            self.rejected.fetch_add(1, Ordering::Relaxed);
                            return Err(LinkError::CommandRejected(format!(
                                "control plane hook: {e}"
                            )));
                        }
                    }
                    None => {
                        warn!("Control plane command dropped: no hook installed");
                    }
                }
                None
            }
        };

        self.handled.fetch_add(1, Ordering::Relaxed);
        Ok(reply)
    }

    /// Deliberate debug/test trap: a dedicated low-priority task pinned to
    /// the requested execution unit that panics after a fixed delay. Not a
    /// recoverable error path.
    fn arm_panic(&self, exec_unit: i64, delay: Duration) {
        warn!(
            "Arming panic trap on execution unit {} in {:?}",
            exec_unit, delay
        );
        let builder = thread::Builder::new().name(format!("dsplink-trap-eu{exec_unit}"));
        let spawned = builder.spawn(move || {
            thread::sleep(delay);
            panic!("deliberate trap requested via panic command");
        });
        if spawned.is_err() {
            error!("Failed to spawn panic trap task");
        }
    }
}

pub(crate) fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
