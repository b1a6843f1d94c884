use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{LinkError, Result};
use crate::heartbeat::BeatGate;
use crate::transport::Transport;

/// Authoritative recovery state, single value behind one mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryState {
    /// Coprocessor up, no recovery in progress.
    Done,
    /// Crash declared or boot in progress.
    Recovering,
    /// Operator took the coprocessor down.
    UserDisabled,
    /// Operator brought the coprocessor back up.
    UserEnabled,
}

/// Subscriber callback, invoked synchronously in registration order on every
/// state transition. Callbacks must not block (documented contract, not
/// enforced at runtime).
pub type RecoverySubscriber = Box<dyn Fn(RecoveryState) + Send + Sync>;

/// Bounded boot retry budget, explicit rather than an embedded literal.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub interval: Duration,
}

/// Retry bookkeeping scoped to one boot sequence; discarded on success.
#[derive(Debug)]
pub struct BootAttempt {
    pub retries_used: u8,
    pub max_retries: u8,
}

impl BootAttempt {
    pub fn new(max_retries: u8) -> Self {
        Self {
            retries_used: 0,
            max_retries,
        }
    }

    /// Record a failed attempt; returns true when the budget is exhausted.
    pub fn record_failure(&mut self) -> bool {
        self.retries_used = self.retries_used.saturating_add(1);
        self.retries_used >= self.max_retries
    }
}

/// Firmware loading collaborator: image transfer, boot entry programming and
/// reset release are external to this subsystem.
pub trait FirmwareLoader: Send + Sync {
    fn load_image(&self) -> anyhow::Result<()>;
    fn program_boot_entry(&self) -> anyhow::Result<()>;
    fn release_reset(&self) -> anyhow::Result<()>;
}

/// Coprocessor clock domain gating collaborator.
pub trait ClockControl: Send + Sync {
    fn gate_on(&self) -> anyhow::Result<()>;
    fn gate_off(&self) -> anyhow::Result<()>;
}

/// Persisted boot-mode flag. Written on escalation, read by early boot code
/// (external bootloader collaborator) after the full system reboot.
pub trait BootFlagStore: Send + Sync {
    fn set_boot_failure(&self, record: &BootFailureRecord) -> anyhow::Result<()>;
}

/// Full-system reboot collaborator; the only escalation path out of this
/// subsystem.
pub trait SystemReset: Send + Sync {
    fn reboot_system(&self);
}

/// Diagnostic record surviving a full system reboot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootFailureRecord {
    pub timestamp: u64,
    pub attempts: u8,
    pub reason: String,
}

impl BootFailureRecord {
    pub fn new(attempts: u8, reason: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            attempts,
            reason: reason.into(),
        }
    }
}

/// File-backed boot flag store (JSON record under the platform config dir).
/// Embedded targets supply their own `BootFlagStore` capability instead.
pub struct FileBootFlagStore {
    path: PathBuf,
}

impl FileBootFlagStore {
    pub fn new() -> anyhow::Result<Self> {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".dsplink")))
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;
        Ok(Self::at(base.join("dsplink").join("boot_flag.json")))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn read(&self) -> anyhow::Result<Option<BootFailureRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl BootFlagStore for FileBootFlagStore {
    fn set_boot_failure(&self, record: &BootFailureRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(record)?;
        fs::write(&self.path, raw)?;
        info!("Boot failure flag persisted to {:?}", self.path);
        Ok(())
    }
}

/// Injected recovery capabilities.
pub struct RecoveryDeps {
    pub firmware: Arc<dyn FirmwareLoader>,
    pub clock: Arc<dyn ClockControl>,
    pub boot_flag: Arc<dyn BootFlagStore>,
    pub system: Arc<dyn SystemReset>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    pub boots_completed: u64,
    pub boot_attempts: u64,
    pub escalations: u64,
}

/// Recovery/boot controller.
///
/// Owns the authoritative `RecoveryState`, the bounded subscriber list and
/// the bounded-retry boot sequence. The reboot path is single-instance: a new
/// request while one is in flight is rejected rather than spawning a second
/// concurrent reboot. During coprocessor reset the transport is fenced so
/// nothing writes into memory that is being reinitialized.
pub struct RecoveryController {
    state: Mutex<RecoveryState>,
    subscribers: Mutex<Vec<RecoverySubscriber>>,
    max_subscribers: usize,
    policy: RetryPolicy,
    boot_wait: Duration,
    deps: RecoveryDeps,
    transport: Arc<Transport>,
    gate: Arc<BeatGate>,
    reboot_in_flight: AtomicBool,
    boots_completed: AtomicU64,
    boot_attempts: AtomicU64,
    escalations: AtomicU64,
}

impl RecoveryController {
    pub fn new(
        policy: RetryPolicy,
        boot_wait: Duration,
        max_subscribers: usize,
        deps: RecoveryDeps,
        transport: Arc<Transport>,
        gate: Arc<BeatGate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RecoveryState::Done),
            subscribers: Mutex::new(Vec::new()),
            max_subscribers,
            policy,
            boot_wait,
            deps,
            transport,
            gate,
            reboot_in_flight: AtomicBool::new(false),
            boots_completed: AtomicU64::new(0),
            boot_attempts: AtomicU64::new(0),
            escalations: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> RecoveryState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(RecoveryState::Recovering)
    }

    pub fn is_recovering(&self) -> bool {
        self.state() == RecoveryState::Recovering
    }

    /// True while the supervisor should treat silent windows as misses.
    pub fn is_supervisable(&self) -> bool {
        !self.reboot_in_flight.load(Ordering::SeqCst)
            && matches!(
                self.state(),
                RecoveryState::Done | RecoveryState::UserEnabled
            )
    }

    /// Fail-fast check used by every public entry point: work is only
    /// accepted while the coprocessor is up.
    pub fn guard_available(&self) -> Result<()> {
        match self.state() {
            RecoveryState::Done | RecoveryState::UserEnabled => Ok(()),
            other => Err(LinkError::Unavailable(other)),
        }
    }

    /// Register a recovery-event subscriber. The list is bounded at
    /// configuration time.
    pub fn subscribe(&self, subscriber: RecoverySubscriber) -> Result<()> {
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| LinkError::Internal("subscriber list lock poisoned".into()))?;
        if subscribers.len() >= self.max_subscribers {
            return Err(LinkError::AllocationFailure(format!(
                "subscriber list full ({} entries)",
                self.max_subscribers
            )));
        }
        subscribers.push(subscriber);
        Ok(())
    }

    /// Crash declaration from the heartbeat supervisor. Transitions to
    /// `Recovering` and spawns the (single-instance) reboot sequence; a
    /// declaration while already recovering is a no-op.
    pub fn declare_crash(self: &Arc<Self>) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            match *state {
                RecoveryState::Done | RecoveryState::UserEnabled => {
                    *state = RecoveryState::Recovering;
                }
                other => {
                    debug!("Crash declaration ignored in state {:?}", other);
                    return;
                }
            }
        }
        self.notify(RecoveryState::Recovering);
        self.spawn_reboot();
    }

    /// Explicit operator reboot request; same path as a crash declaration.
    pub fn request_reboot(self: &Arc<Self>) -> Result<()> {
        self.guard_available()?;
        info!("Coprocessor reboot requested");
        self.declare_crash();
        Ok(())
    }

    /// First heartbeat after a boot: recovery is complete. Reports `Done` to
    /// subscribers exactly once per recovery cycle.
    pub fn mark_alive(&self) {
        let transitioned = {
            match self.state.lock() {
                Ok(mut state) if *state == RecoveryState::Recovering => {
                    *state = RecoveryState::Done;
                    true
                }
                _ => false,
            }
        };
        if transitioned {
            info!("Coprocessor alive; recovery complete");
            self.notify(RecoveryState::Done);
        }
    }

    /// Operator enable. Idempotent: already enabled (or `Done`) returns
    /// immediately with no boot side effects; rejected while recovering.
    pub fn enable(self: &Arc<Self>) -> Result<()> {
        {
            let Ok(mut state) = self.state.lock() else {
                return Err(LinkError::Internal("state lock poisoned".into()));
            };
            match *state {
                RecoveryState::Done | RecoveryState::UserEnabled => {
                    debug!("enable(): already up, nothing to do");
                    return Ok(());
                }
                RecoveryState::Recovering => {
                    return Err(LinkError::Unavailable(RecoveryState::Recovering));
                }
                RecoveryState::UserDisabled => {
                    *state = RecoveryState::Recovering;
                }
            }
        }
        self.notify(RecoveryState::Recovering);

        if self.reboot_in_flight.swap(true, Ordering::SeqCst) {
            return Err(LinkError::Unavailable(RecoveryState::Recovering));
        }
        let outcome = self.boot_with_retries();
        self.reboot_in_flight.store(false, Ordering::SeqCst);
        outcome?;

        if let Ok(mut state) = self.state.lock() {
            *state = RecoveryState::UserEnabled;
        }
        self.notify(RecoveryState::UserEnabled);
        Ok(())
    }

    /// Operator disable. Idempotent; rejected while a reboot is in flight.
    pub fn disable(&self) -> Result<()> {
        if self.reboot_in_flight.load(Ordering::SeqCst) {
            return Err(LinkError::Unavailable(RecoveryState::Recovering));
        }
        {
            let Ok(mut state) = self.state.lock() else {
                return Err(LinkError::Internal("state lock poisoned".into()));
            };
            match *state {
                RecoveryState::UserDisabled => {
                    debug!("disable(): already down, nothing to do");
                    return Ok(());
                }
                RecoveryState::Recovering => {
                    return Err(LinkError::Unavailable(RecoveryState::Recovering));
                }
                RecoveryState::Done | RecoveryState::UserEnabled => {
                    *state = RecoveryState::UserDisabled;
                }
            }
        }
        self.transport.set_enabled(false);
        if let Err(e) = self.deps.clock.gate_off() {
            warn!("Clock gate-off during disable failed: {}", e);
        }
        info!("Coprocessor disabled by operator");
        self.notify(RecoveryState::UserDisabled);
        Ok(())
    }

    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            boots_completed: self.boots_completed.load(Ordering::Relaxed),
            boot_attempts: self.boot_attempts.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
        }
    }

    fn notify(&self, state: RecoveryState) {
        if let Ok(subscribers) = self.subscribers.lock() {
            for subscriber in subscribers.iter() {
                subscriber(state);
            }
        }
    }

    fn spawn_reboot(self: &Arc<Self>) {
        if self.reboot_in_flight.swap(true, Ordering::SeqCst) {
            warn!("Reboot already in flight; not spawning another");
            return;
        }
        let controller = Arc::clone(self);
        thread::spawn(move || {
            match controller.boot_with_retries() {
                Ok(()) => controller.mark_alive(),
                Err(e) => error!("Coprocessor reboot failed: {}", e),
            }
            controller.reboot_in_flight.store(false, Ordering::SeqCst);
        });
    }

    /// Bounded-retry boot loop. Fences the transport for the duration of the
    /// reset; on exhausted budget persists the boot-failure flag and triggers
    /// the full system reboot.
    fn boot_with_retries(&self) -> Result<()> {
        self.transport.set_enabled(false);
        let mut attempt = BootAttempt::new(self.policy.max_attempts);

        loop {
            self.boot_attempts.fetch_add(1, Ordering::Relaxed);
            match self.boot_once() {
                Ok(()) => {
                    self.transport.set_enabled(true);
                    self.boots_completed.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Coprocessor boot succeeded after {} retr{}",
                        attempt.retries_used,
                        if attempt.retries_used == 1 { "y" } else { "ies" }
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Boot attempt {}/{} failed: {}",
                        attempt.retries_used + 1,
                        attempt.max_retries,
                        e
                    );
                    if attempt.record_failure() {
                        self.escalate(&attempt);
                        return Err(LinkError::BootFailure { fatal: true });
                    }
                    thread::sleep(self.policy.interval);
                }
            }
        }
    }

    /// One boot sequence: clock gating, firmware transfer, boot entry, reset
    /// release, then a bounded wait for the first heartbeat as the success
    /// signal.
    fn boot_once(&self) -> Result<()> {
        self.deps.clock.gate_off().map_err(boot_step_failed)?;
        self.deps.clock.gate_on().map_err(boot_step_failed)?;
        self.deps.firmware.load_image().map_err(boot_step_failed)?;
        self.deps
            .firmware
            .program_boot_entry()
            .map_err(boot_step_failed)?;
        self.deps.firmware.release_reset().map_err(boot_step_failed)?;

        if self.gate.wait_next(self.boot_wait) {
            Ok(())
        } else {
            warn!("No heartbeat within {:?} after reset release", self.boot_wait);
            Err(LinkError::BootFailure { fatal: false })
        }
    }

    /// Local retries are exhausted: persist the diagnostic flag for the
    /// bootloader and hand the problem to the full-system reboot path. This
    /// is the only error allowed to escalate beyond the subsystem.
    fn escalate(&self, attempt: &BootAttempt) {
        error!(
            "Coprocessor boot retries exhausted ({}); escalating to system reboot",
            attempt.retries_used
        );
        self.escalations.fetch_add(1, Ordering::Relaxed);

        let record = BootFailureRecord::new(attempt.retries_used, "coprocessor boot failure");
        if let Err(e) = self.deps.boot_flag.set_boot_failure(&record) {
            error!("Failed to persist boot failure flag: {}", e);
        }
        self.deps.system.reboot_system();
    }
}

fn boot_step_failed(e: anyhow::Error) -> LinkError {
    error!("Boot step failed: {}", e);
    LinkError::BootFailure { fatal: false }
}
