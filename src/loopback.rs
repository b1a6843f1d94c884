use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::codec_proxy::{CodecEngine, CodecFrame, CodecJob, CodecMailbox, CodecStatus, CodecWorker};
use crate::command::{CommandDispatcher, DispatcherConfig};
use crate::config::LinkConfig;
use crate::envelope::{MessageEnvelope, MessageKind, Payload};
use crate::error::{LinkError, Result};
use crate::heartbeat::HeartbeatSender;
use crate::transport::{LinkPort, Transport};

const RESPONDER_POLL: Duration = Duration::from_millis(50);

/// In-process coprocessor double.
///
/// Implements `LinkPort` so a host transport writes straight into it, runs
/// the remote-side command dispatcher and codec mailbox/worker, and emits
/// heartbeats back to the host. `silence()`/`revive()` simulate a crash and
/// a successful reboot for recovery testing; no hardware is involved.
pub struct LoopbackCoprocessor {
    host: Mutex<Weak<Transport>>,
    dispatcher: CommandDispatcher,
    mailbox: Arc<CodecMailbox>,
    worker: CodecWorker,
    response_tx: Sender<CodecFrame>,
    response_rx: Receiver<CodecFrame>,
    beater: Mutex<Option<HeartbeatSender>>,
    beat_period: Duration,
    silenced: Arc<AtomicBool>,
    responder_running: Arc<AtomicBool>,
    responder: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackCoprocessor {
    pub fn new(config: &LinkConfig, engine: Arc<dyn CodecEngine>) -> Arc<Self> {
        let dispatcher = CommandDispatcher::new(DispatcherConfig {
            sample_rate: config.command.sample_rate,
            frame_period_ms: config.command.frame_period_ms,
            debug_commands: config.command.debug_commands,
            panic_delay: Duration::from_millis(config.command.panic_delay_ms),
        });
        let mailbox = CodecMailbox::new(config.codec.mailbox_capacity);
        let worker = CodecWorker::new(mailbox.clone(), engine, dispatcher.heap_gate());
        let (response_tx, response_rx) = channel::unbounded();

        Arc::new(Self {
            host: Mutex::new(Weak::new()),
            dispatcher,
            mailbox,
            worker,
            response_tx,
            response_rx,
            beater: Mutex::new(None),
            beat_period: config.heartbeat.period(),
            silenced: Arc::new(AtomicBool::new(false)),
            responder_running: Arc::new(AtomicBool::new(false)),
            responder: Mutex::new(None),
        })
    }

    /// Second construction phase: the host transport needs this double as
    /// its port before the double can learn about the transport.
    pub fn connect(self: &Arc<Self>, host: &Arc<Transport>) {
        if let Ok(mut slot) = self.host.lock() {
            *slot = Arc::downgrade(host);
        }
        self.worker.start();
        self.start_responder();
        self.start_beating(host);
    }

    fn start_responder(self: &Arc<Self>) {
        if self.responder_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = thread::spawn(move || {
            while this.responder_running.load(Ordering::SeqCst) {
                let frame = match this.response_rx.recv_timeout(RESPONDER_POLL) {
                    Ok(frame) => frame,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                if this.silenced.load(Ordering::SeqCst) {
                    continue;
                }
                this.dispatch_to_host(MessageEnvelope::codec_response(frame).into_rx());
            }
        });
        if let Ok(mut slot) = self.responder.lock() {
            *slot = Some(handle);
        }
    }

    fn start_beating(self: &Arc<Self>, host: &Arc<Transport>) {
        let silenced = self.silenced.clone();
        let host = Arc::downgrade(host);
        let beater = HeartbeatSender::new(self.beat_period, move |id| {
            if silenced.load(Ordering::SeqCst) {
                return;
            }
            if let Some(host) = host.upgrade() {
                if let Err(e) = host.dispatch(MessageEnvelope::heartbeat(id).into_rx()) {
                    debug!("Heartbeat dispatch failed: {}", e);
                }
            }
        });
        beater.start();
        if let Ok(mut slot) = self.beater.lock() {
            *slot = Some(beater);
        }
    }

    fn dispatch_to_host(&self, envelope: MessageEnvelope) {
        let host = self.host.lock().ok().and_then(|h| h.upgrade());
        match host {
            Some(host) => {
                if let Err(e) = host.dispatch(envelope) {
                    debug!("Loopback dispatch to host failed: {}", e);
                }
            }
            None => debug!("Loopback has no connected host, envelope dropped"),
        }
    }

    /// Simulated crash: heartbeats stop and every delivery is swallowed.
    pub fn silence(&self) {
        self.silenced.store(true, Ordering::SeqCst);
        warn!("Loopback coprocessor silenced");
    }

    /// Simulated successful reboot: heartbeats and handling resume.
    pub fn revive(&self) {
        self.silenced.store(false, Ordering::SeqCst);
        debug!("Loopback coprocessor revived");
    }

    pub fn is_silenced(&self) -> bool {
        self.silenced.load(Ordering::SeqCst)
    }

    /// Emit one heartbeat immediately (deterministic alternative to waiting
    /// out a period).
    pub fn beat_once(&self) {
        if self.silenced.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(slot) = self.beater.lock() {
            if let Some(beater) = slot.as_ref() {
                beater.beat_once();
            }
        }
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn mailbox(&self) -> &Arc<CodecMailbox> {
        &self.mailbox
    }

    pub fn stop(&self) {
        if let Ok(mut slot) = self.beater.lock() {
            if let Some(beater) = slot.take() {
                beater.stop();
            }
        }
        self.worker.stop();
        if self.responder_running.swap(false, Ordering::SeqCst) {
            if let Ok(mut slot) = self.responder.lock() {
                if let Some(handle) = slot.take() {
                    if handle.join().is_err() {
                        error!("Loopback responder panicked");
                    }
                }
            }
        }
    }

    fn handle_command(&self, envelope: &MessageEnvelope) {
        let Payload::Command(ref command) = envelope.payload else {
            warn!("Command envelope with non-command payload, dropping");
            return;
        };
        match self.dispatcher.dispatch(command) {
            Ok(Some(reply)) => {
                self.dispatch_to_host(MessageEnvelope::command(reply).into_rx());
            }
            Ok(None) => {
                // Fire-and-forget commands still need the sync waiter (if
                // any) released; echo an empty-reply envelope for those.
                if envelope.synchronous {
                    self.dispatch_to_host(MessageEnvelope::command(command.clone()).into_rx());
                }
            }
            Err(e) => debug!("Command {:?} rejected: {}", command.kind, e),
        }
    }

    fn handle_codec_job(&self, envelope: &MessageEnvelope) {
        let Payload::Codec(ref frame) = envelope.payload else {
            warn!("Codec job envelope with non-codec payload, dropping");
            return;
        };
        let job = CodecJob {
            command: frame.command,
            input: frame.data.clone(),
            respond: self.response_tx.clone(),
        };
        if let Err(LinkError::QueueFull) = self.mailbox.submit(job) {
            // Refused at capacity: fail the request rather than ghosting it.
            let _ = self.response_tx.try_send(CodecFrame::response(
                frame.command,
                CodecStatus::Fail,
                Vec::new(),
            ));
        }
    }
}

impl LinkPort for LoopbackCoprocessor {
    fn deliver(&self, envelope: MessageEnvelope) -> Result<()> {
        if self.silenced.load(Ordering::SeqCst) {
            // A crashed coprocessor reads nothing.
            return Ok(());
        }
        match envelope.kind {
            MessageKind::Command => self.handle_command(&envelope),
            MessageKind::CodecJob => self.handle_codec_job(&envelope),
            MessageKind::StreamConfig => {
                // Acknowledge the format by echoing it back.
                self.dispatch_to_host(envelope.into_rx());
            }
            MessageKind::StreamBuffer => {
                // Loop audio frames straight back as "decoded" output.
                self.dispatch_to_host(envelope.into_rx());
            }
            MessageKind::UserData | MessageKind::Trace => {
                self.dispatch_to_host(envelope.into_rx());
            }
            other => debug!("Loopback ignoring {:?} envelope", other),
        }
        Ok(())
    }
}

impl Drop for LoopbackCoprocessor {
    fn drop(&mut self) {
        self.responder_running.store(false, Ordering::SeqCst);
    }
}
