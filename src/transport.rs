use crossbeam::channel::{Receiver, Sender, bounded};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::TransportSettings;
use crate::envelope::{Direction, MessageEnvelope, MessageKind, Priority};
use crate::error::{LinkError, Result};
use crate::registry::{EnvelopeHandler, HandlerRegistry};

/// Seam to the shared medium carrying envelopes to the peer core.
///
/// On hardware this writes into the shared-memory channel; the in-process
/// tests wire it to a loopback coprocessor double.
pub trait LinkPort: Send + Sync {
    fn deliver(&self, envelope: MessageEnvelope) -> Result<()>;
}

/// Transport statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub enqueued_high: u64,
    pub enqueued_normal: u64,
    pub delivered: u64,
    pub dropped_disabled: u64,
    pub dispatched: u64,
    pub unmatched: u64,
    pub completions: u64,
    pub sync_timeouts: u64,
    pub rejected_down: u64,
    pub rejected_full: u64,
}

#[derive(Default)]
struct TransportCounters {
    enqueued_high: AtomicU64,
    enqueued_normal: AtomicU64,
    delivered: AtomicU64,
    dropped_disabled: AtomicU64,
    dispatched: AtomicU64,
    unmatched: AtomicU64,
    completions: AtomicU64,
    sync_timeouts: AtomicU64,
    rejected_down: AtomicU64,
    rejected_full: AtomicU64,
}

/// Typed, priority-ordered envelope delivery over the shared-memory channel.
///
/// Two bounded lanes feed a single TX pump thread which always drains the
/// high-priority lane first, so a high-priority send is never starved by
/// in-flight normal-priority traffic. `set_enabled(false)` fences all sends
/// during coprocessor reset; envelopes still sitting in a lane at that point
/// are dropped by the pump rather than written into memory that is about to
/// be reinitialized.
pub struct Transport {
    enabled: Arc<AtomicBool>,
    high_tx: Sender<MessageEnvelope>,
    normal_tx: Sender<MessageEnvelope>,
    shutdown_tx: Sender<()>,
    registry: HandlerRegistry,
    waiters: Mutex<HashMap<MessageKind, Sender<()>>>,
    next_ids: Mutex<HashMap<MessageKind, u32>>,
    counters: Arc<TransportCounters>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(settings: &TransportSettings, port: Arc<dyn LinkPort>) -> Arc<Self> {
        let (high_tx, high_rx) = bounded(settings.queue_depth);
        let (normal_tx, normal_rx) = bounded(settings.queue_depth);
        let (shutdown_tx, shutdown_rx) = bounded(1);

        let enabled = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(TransportCounters::default());

        let pump = Self::spawn_pump(
            port,
            high_rx,
            normal_rx,
            shutdown_rx,
            enabled.clone(),
            counters.clone(),
        );

        info!(
            "Transport created (lane depth: {} envelopes)",
            settings.queue_depth
        );

        Arc::new(Self {
            enabled,
            high_tx,
            normal_tx,
            shutdown_tx,
            registry: HandlerRegistry::new(),
            waiters: Mutex::new(HashMap::new()),
            next_ids: Mutex::new(HashMap::new()),
            counters,
            pump: Mutex::new(Some(pump)),
        })
    }

    fn spawn_pump(
        port: Arc<dyn LinkPort>,
        high_rx: Receiver<MessageEnvelope>,
        normal_rx: Receiver<MessageEnvelope>,
        shutdown_rx: Receiver<()>,
        enabled: Arc<AtomicBool>,
        counters: Arc<TransportCounters>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            debug!("TX pump started");
            loop {
                // The high lane always wins over whatever is queued normal.
                if let Ok(envelope) = high_rx.try_recv() {
                    Self::pump_one(&*port, envelope, &enabled, &counters);
                    continue;
                }

                crossbeam::select! {
                    recv(high_rx) -> msg => match msg {
                        Ok(envelope) => Self::pump_one(&*port, envelope, &enabled, &counters),
                        Err(_) => break,
                    },
                    recv(normal_rx) -> msg => match msg {
                        Ok(envelope) => Self::pump_one(&*port, envelope, &enabled, &counters),
                        Err(_) => break,
                    },
                    recv(shutdown_rx) -> _ => break,
                }
            }
            debug!("TX pump stopped");
        })
    }

    fn pump_one(
        port: &dyn LinkPort,
        envelope: MessageEnvelope,
        enabled: &AtomicBool,
        counters: &TransportCounters,
    ) {
        if !enabled.load(Ordering::SeqCst) {
            counters.dropped_disabled.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Dropping queued {:?} envelope id={}: transport disabled",
                envelope.kind, envelope.id
            );
            return;
        }

        let kind = envelope.kind;
        let id = envelope.id;
        match port.deliver(envelope) {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!("Delivery failed for {:?} envelope id={}: {}", kind, id, e);
            }
        }
    }

    /// Fire-and-forget enqueue. Never blocks: fails with `TransportDown` when
    /// the transport is disabled and `QueueFull` when the lane is at capacity.
    pub fn enqueue(&self, mut envelope: MessageEnvelope) -> Result<()> {
        if !self.is_enabled() {
            self.counters.rejected_down.fetch_add(1, Ordering::Relaxed);
            return Err(LinkError::TransportDown);
        }

        envelope.id = self.next_id(envelope.kind)?;

        let (lane, counter) = match envelope.priority {
            Priority::High => (&self.high_tx, &self.counters.enqueued_high),
            Priority::Normal => (&self.normal_tx, &self.counters.enqueued_normal),
        };

        match lane.try_send(envelope) {
            Ok(()) => {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(crossbeam::channel::TrySendError::Full(_)) => {
                self.counters.rejected_full.fetch_add(1, Ordering::Relaxed);
                Err(LinkError::QueueFull)
            }
            Err(crossbeam::channel::TrySendError::Disconnected(_)) => {
                Err(LinkError::TransportDown)
            }
        }
    }

    /// Blocking send: registers a one-shot completion waiter keyed by the
    /// envelope kind, enqueues, and waits until the matching completion fires
    /// or the timeout elapses. On timeout the waiter is removed so a late
    /// completion cannot corrupt a subsequent call.
    pub fn send_sync(&self, envelope: MessageEnvelope, timeout: Duration) -> Result<()> {
        if !self.is_enabled() {
            self.counters.rejected_down.fetch_add(1, Ordering::Relaxed);
            return Err(LinkError::TransportDown);
        }

        let kind = envelope.kind;
        let (ack_tx, ack_rx) = bounded::<()>(1);
        {
            let mut waiters = self.lock_waiters()?;
            if waiters.insert(kind, ack_tx.clone()).is_some() {
                warn!("Replacing stale completion waiter for {:?}", kind);
            }
        }

        if let Err(e) = self.enqueue(envelope.synchronous()) {
            self.remove_waiter(kind, &ack_tx);
            return Err(e);
        }

        match ack_rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.remove_waiter(kind, &ack_tx);
                self.counters.sync_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("Synchronous {:?} send timed out after {:?}", kind, timeout);
                Err(LinkError::Timeout)
            }
        }
    }

    /// Receive-side dispatch: looks up `(kind, direction)` and invokes the
    /// handler. Unmatched envelopes are counted and reported so callers can
    /// log and drop them. Dispatching a receive-leg envelope also fires any
    /// pending completion waiter for its kind.
    pub fn dispatch(&self, envelope: MessageEnvelope) -> Result<()> {
        let handler: Option<EnvelopeHandler> =
            self.registry.lookup(envelope.kind, envelope.direction);

        let result = match handler {
            Some(handler) => {
                handler(&envelope);
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => {
                self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Dropping unmatched {:?}/{:?} envelope id={}",
                    envelope.kind, envelope.direction, envelope.id
                );
                Err(LinkError::InvalidRoute {
                    kind: envelope.kind,
                    direction: envelope.direction,
                })
            }
        };

        if envelope.direction == Direction::Rx {
            self.complete(envelope.kind);
        }

        result
    }

    /// Fire the pending completion waiter for `kind`, if any.
    pub fn complete(&self, kind: MessageKind) -> bool {
        let waiter = self
            .waiters
            .lock()
            .ok()
            .and_then(|mut waiters| waiters.remove(&kind));

        match waiter {
            Some(ack) => {
                self.counters.completions.fetch_add(1, Ordering::Relaxed);
                // A full/disconnected slot means the waiter already gave up.
                ack.try_send(()).is_ok()
            }
            None => false,
        }
    }

    /// Gate all sends. Disabled during coprocessor reset so nothing is
    /// written into memory that is about to be reinitialized.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!("Transport {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            enqueued_high: c.enqueued_high.load(Ordering::Relaxed),
            enqueued_normal: c.enqueued_normal.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped_disabled: c.dropped_disabled.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            unmatched: c.unmatched.load(Ordering::Relaxed),
            completions: c.completions.load(Ordering::Relaxed),
            sync_timeouts: c.sync_timeouts.load(Ordering::Relaxed),
            rejected_down: c.rejected_down.load(Ordering::Relaxed),
            rejected_full: c.rejected_full.load(Ordering::Relaxed),
        }
    }

    /// Stop the TX pump and join it. Safe to call once at teardown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                if handle.join().is_err() {
                    error!("TX pump panicked");
                }
            }
        }
    }

    fn next_id(&self, kind: MessageKind) -> Result<u32> {
        let mut ids = self
            .next_ids
            .lock()
            .map_err(|_| LinkError::Internal("id counter lock poisoned".into()))?;
        let id = ids.entry(kind).or_insert(0);
        *id = id.wrapping_add(1);
        Ok(*id)
    }

    fn lock_waiters(&self) -> Result<std::sync::MutexGuard<'_, HashMap<MessageKind, Sender<()>>>> {
        self.waiters
            .lock()
            .map_err(|_| LinkError::Internal("waiter table lock poisoned".into()))
    }

    fn remove_waiter(&self, kind: MessageKind, ours: &Sender<()>) {
        if let Ok(mut waiters) = self.waiters.lock() {
            // Only remove our own waiter; a completion may have raced in and
            // a later caller may already have installed a fresh one.
            let is_ours = waiters
                .get(&kind)
                .map(|w| w.same_channel(ours))
                .unwrap_or(false);
            if is_ours {
                waiters.remove(&kind);
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.try_send(());
    }
}
