use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::envelope::MessageEnvelope;
use crate::error::{LinkError, Result};
use crate::recovery::RecoveryController;
use crate::transport::Transport;

/// Codec operation tag carried across the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecCommand {
    Encode,
    Decode,
    Configure,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecStatus {
    Request,
    Ok,
    Fail,
}

/// Codec payload crossing the transport: command tag, status and buffer.
#[derive(Debug, Clone)]
pub struct CodecFrame {
    pub command: CodecCommand,
    pub status: CodecStatus,
    pub data: Vec<u8>,
}

impl CodecFrame {
    pub fn request(command: CodecCommand, data: Vec<u8>) -> Self {
        Self {
            command,
            status: CodecStatus::Request,
            data,
        }
    }

    pub fn response(command: CodecCommand, status: CodecStatus, data: Vec<u8>) -> Self {
        Self {
            command,
            status,
            data,
        }
    }
}

/// External codec engine collaborator. The actual LC3/Opus math lives behind
/// this trait; the link subsystem never interprets the buffers.
pub trait CodecEngine: Send + Sync {
    fn process(&self, command: CodecCommand, input: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// One codec job. The job exclusively owns its input buffer until the
/// consuming step runs; the worker destroys the buffer after use and produces
/// exactly one response into `respond`.
pub struct CodecJob {
    pub command: CodecCommand,
    pub input: Vec<u8>,
    pub respond: Sender<CodecFrame>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MailboxStats {
    pub depth: usize,
    pub capacity: usize,
    pub submitted: u64,
    pub rejected_full: u64,
    pub processed: u64,
    pub failed: u64,
}

/// Bounded FIFO of codec jobs awaiting remote processing. A submit at
/// capacity is refused immediately (explicit backpressure, never blocking).
pub struct CodecMailbox {
    tx: Sender<CodecJob>,
    rx: Receiver<CodecJob>,
    capacity: usize,
    submitted: AtomicU64,
    rejected_full: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl CodecMailbox {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = bounded(capacity);
        Arc::new(Self {
            tx,
            rx,
            capacity,
            submitted: AtomicU64::new(0),
            rejected_full: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn submit(&self, job: CodecJob) -> Result<()> {
        match self.tx.try_send(job) {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.rejected_full.fetch_add(1, Ordering::Relaxed);
                debug!("Codec mailbox full (capacity {})", self.capacity);
                Err(LinkError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(LinkError::Internal("codec mailbox torn down".into()))
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.tx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<CodecJob> {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => Some(job),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            depth: self.depth(),
            capacity: self.capacity,
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected_full: self.rejected_full.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

const WORKER_POLL: Duration = Duration::from_millis(50);

/// Remote-side consumer loop: dequeues jobs FIFO, invokes the codec engine
/// synchronously, destroys the input buffer and sends exactly one response.
pub struct CodecWorker {
    mailbox: Arc<CodecMailbox>,
    engine: Arc<dyn CodecEngine>,
    heap_ready: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CodecWorker {
    pub fn new(
        mailbox: Arc<CodecMailbox>,
        engine: Arc<dyn CodecEngine>,
        heap_ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            mailbox,
            engine,
            heap_ready,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mailbox = self.mailbox.clone();
        let engine = self.engine.clone();
        let heap_ready = self.heap_ready.clone();
        let running = self.running.clone();

        let handle = thread::spawn(move || {
            debug!("Codec worker started");
            while running.load(Ordering::SeqCst) {
                let Some(job) = mailbox.recv_timeout(WORKER_POLL) else {
                    continue;
                };
                Self::process(&mailbox, &*engine, &heap_ready, job);
            }
            debug!("Codec worker stopped");
        });

        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
    }

    fn process(
        mailbox: &CodecMailbox,
        engine: &dyn CodecEngine,
        heap_ready: &AtomicBool,
        job: CodecJob,
    ) {
        let CodecJob {
            command,
            input,
            respond,
        } = job;

        if !heap_ready.load(Ordering::SeqCst) {
            error!("Codec job before heap init; refusing {:?}", command);
            mailbox.failed.fetch_add(1, Ordering::Relaxed);
            let _ = respond.try_send(CodecFrame::response(command, CodecStatus::Fail, Vec::new()));
            return;
        }

        let outcome = engine.process(command, &input);
        // Ownership of the input ends with the processing step.
        drop(input);

        let frame = match outcome {
            Ok(output) => {
                mailbox.processed.fetch_add(1, Ordering::Relaxed);
                CodecFrame::response(command, CodecStatus::Ok, output)
            }
            Err(e) => {
                warn!("Codec engine failed on {:?}: {}", command, e);
                mailbox.failed.fetch_add(1, Ordering::Relaxed);
                CodecFrame::response(command, CodecStatus::Fail, Vec::new())
            }
        };

        if respond.try_send(frame).is_err() {
            debug!("Codec response dropped: requester gone");
        }
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(handle) = slot.take() {
                if handle.join().is_err() {
                    error!("Codec worker panicked");
                }
            }
        }
    }
}

impl Drop for CodecWorker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProxyStats {
    pub requests: u64,
    pub failures: u64,
    pub timeouts: u64,
}

/// Host-side codec request proxy.
///
/// `request` serializes callers: one outstanding synchronous codec call at a
/// time per direction. The serialization lock is what prevents a response
/// being misattributed to the wrong caller, and it is released on every exit
/// path by guard drop.
pub struct CodecProxy {
    transport: Arc<Transport>,
    recovery: Arc<RecoveryController>,
    call_lock: Mutex<()>,
    pending: Mutex<Option<Sender<CodecFrame>>>,
    requests: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

impl CodecProxy {
    pub fn new(transport: Arc<Transport>, recovery: Arc<RecoveryController>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            recovery,
            call_lock: Mutex::new(()),
            pending: Mutex::new(None),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        })
    }

    /// Fire-and-forget job submission; backpressure surfaces as `QueueFull`
    /// from the transport lane.
    pub fn submit(&self, command: CodecCommand, input: Vec<u8>) -> Result<()> {
        self.recovery.guard_available()?;
        self.transport
            .enqueue(MessageEnvelope::codec_job(CodecFrame::request(command, input)))
    }

    /// Blocking codec request with bounded timeout.
    pub fn request(
        &self,
        command: CodecCommand,
        input: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let _guard = self
            .call_lock
            .lock()
            .map_err(|_| LinkError::Internal("codec call lock poisoned".into()))?;

        self.recovery.guard_available()?;
        self.requests.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = bounded::<CodecFrame>(1);
        self.set_pending(Some(tx))?;

        let envelope = MessageEnvelope::codec_job(CodecFrame::request(command, input));
        if let Err(e) = self.transport.enqueue(envelope) {
            self.set_pending(None)?;
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(frame) => match frame.status {
                CodecStatus::Ok => Ok(frame.data),
                _ => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    Err(LinkError::CodecEngine(format!(
                        "remote engine failed on {command:?}"
                    )))
                }
            },
            Err(_) => {
                self.set_pending(None)?;
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("Codec {:?} request timed out after {:?}", command, timeout);
                Err(LinkError::Timeout)
            }
        }
    }

    /// Receive-side hook for codec response envelopes.
    pub(crate) fn on_response(&self, frame: CodecFrame) {
        let waiter = self.pending.lock().ok().and_then(|mut p| p.take());
        match waiter {
            Some(tx) => {
                if tx.try_send(frame).is_err() {
                    debug!("Codec response arrived after caller gave up");
                }
            }
            None => {
                warn!("Unsolicited codec response dropped ({:?})", frame.command);
            }
        }
    }

    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    fn set_pending(&self, value: Option<Sender<CodecFrame>>) -> Result<()> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| LinkError::Internal("codec pending slot poisoned".into()))?;
        *pending = value;
        Ok(())
    }
}
