use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::HeartbeatSettings;
use crate::recovery::RecoveryController;

/// Receive-side beat bookkeeping.
///
/// A gap in beat ids indicates lost beats and is logged, but by itself never
/// counts as a miss; `miss_count` increments only on full-window silence.
#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    pub last_id: u32,
    pub miss_count: u8,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received beat: clear the miss counter and return the number
    /// of beats lost since the previous one.
    pub fn on_beat(&mut self, id: u32) -> u32 {
        let gap = id.wrapping_sub(self.last_id).wrapping_sub(1);
        self.last_id = id;
        self.miss_count = 0;
        gap
    }

    /// Record a fully silent window.
    pub fn on_window_elapsed(&mut self) -> u8 {
        self.miss_count = self.miss_count.saturating_add(1);
        self.miss_count
    }
}

/// Condvar gate pulsed on every received beat. The boot sequence blocks on
/// this (bounded) to learn that the coprocessor came up.
pub struct BeatGate {
    count: Mutex<u64>,
    cv: Condvar,
}

impl BeatGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        })
    }

    pub fn notify(&self) {
        if let Ok(mut count) = self.count.lock() {
            *count += 1;
            self.cv.notify_all();
        }
    }

    /// Wait for the next beat after the call, up to `timeout`. Returns true
    /// if a beat arrived in time.
    pub fn wait_next(&self, timeout: Duration) -> bool {
        let Ok(guard) = self.count.lock() else {
            return false;
        };
        let start = *guard;
        match self
            .cv
            .wait_timeout_while(guard, timeout, |count| *count == start)
        {
            Ok((guard, result)) => !result.timed_out() || *guard > start,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HeartbeatStats {
    pub beats: u64,
    pub lost_beats: u64,
    pub missed_windows: u64,
    pub crashes_declared: u64,
}

#[derive(Default)]
struct HeartbeatCounters {
    beats: AtomicU64,
    lost_beats: AtomicU64,
    missed_windows: AtomicU64,
    crashes_declared: AtomicU64,
}

/// Heartbeat supervisor (receive side).
///
/// A dedicated thread waits on the beat feed with the window as deadline.
/// Three consecutive silent windows declare the coprocessor crashed and
/// invoke the recovery controller exactly once; repeated silent windows while
/// recovery is already in flight are no-ops.
pub struct HeartbeatMonitor {
    beat_tx: Sender<u32>,
    beat_rx: Mutex<Option<Receiver<u32>>>,
    window: Duration,
    max_misses: u8,
    recovery: Arc<RecoveryController>,
    gate: Arc<BeatGate>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<HeartbeatCounters>,
}

impl HeartbeatMonitor {
    pub fn new(
        settings: &HeartbeatSettings,
        recovery: Arc<RecoveryController>,
        gate: Arc<BeatGate>,
    ) -> Arc<Self> {
        let (beat_tx, beat_rx) = unbounded();
        Arc::new(Self {
            beat_tx,
            beat_rx: Mutex::new(Some(beat_rx)),
            window: settings.window(),
            max_misses: settings.max_misses,
            recovery,
            gate,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            counters: Arc::new(HeartbeatCounters::default()),
        })
    }

    /// Feed end for the transport's heartbeat handler.
    pub fn beat_sender(&self) -> Sender<u32> {
        self.beat_tx.clone()
    }

    pub fn gate(&self) -> Arc<BeatGate> {
        self.gate.clone()
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(beat_rx) = self.beat_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            error!("Heartbeat monitor already consumed its beat feed");
            return;
        };

        let window = self.window;
        let max_misses = self.max_misses;
        let recovery = self.recovery.clone();
        let gate = self.gate.clone();
        let running = self.running.clone();
        let counters = self.counters.clone();

        let handle = thread::spawn(move || {
            info!(
                "Heartbeat monitor started (window {:?}, max misses {})",
                window, max_misses
            );
            let mut tracker = HeartbeatTracker::new();

            while running.load(Ordering::SeqCst) {
                match beat_rx.recv_timeout(window) {
                    Ok(id) => {
                        let gap = tracker.on_beat(id);
                        counters.beats.fetch_add(1, Ordering::Relaxed);
                        if gap > 0 {
                            counters.lost_beats.fetch_add(u64::from(gap), Ordering::Relaxed);
                            warn!("Heartbeat gap: {} beat(s) lost before id {}", gap, id);
                        } else {
                            debug!("Heartbeat id {}", id);
                        }
                        gate.notify();
                        recovery.mark_alive();
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if !recovery.is_supervisable() {
                            // Already recovering or operator-disabled; timer
                            // restarts are the only effect.
                            tracker.miss_count = 0;
                            continue;
                        }
                        let misses = tracker.on_window_elapsed();
                        counters.missed_windows.fetch_add(1, Ordering::Relaxed);
                        warn!("Heartbeat window silent ({}/{})", misses, max_misses);
                        if misses >= max_misses {
                            error!(
                                "Coprocessor declared crashed after {} silent windows",
                                misses
                            );
                            counters.crashes_declared.fetch_add(1, Ordering::Relaxed);
                            tracker.miss_count = 0;
                            recovery.declare_crash();
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("Heartbeat monitor stopped");
        });

        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(handle) = slot.take() {
                if handle.join().is_err() {
                    error!("Heartbeat monitor panicked");
                }
            }
        }
    }

    pub fn stats(&self) -> HeartbeatStats {
        let c = &self.counters;
        HeartbeatStats {
            beats: c.beats.load(Ordering::Relaxed),
            lost_beats: c.lost_beats.load(Ordering::Relaxed),
            missed_windows: c.missed_windows.load(Ordering::Relaxed),
            crashes_declared: c.crashes_declared.load(Ordering::Relaxed),
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Send-side beat emitter: fires a strictly incrementing beat id on a fixed
/// period, fire-and-forget. Lives on the coprocessor runtime (or its
/// in-process double).
pub struct HeartbeatSender {
    period: Duration,
    emit: Arc<dyn Fn(u32) + Send + Sync>,
    next_id: Arc<AtomicU32>,
    beating: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatSender {
    pub fn new<F>(period: Duration, emit: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        Self {
            period,
            emit: Arc::new(emit),
            next_id: Arc::new(AtomicU32::new(0)),
            beating: Arc::new(AtomicBool::new(true)),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let period = self.period;
        let emit = self.emit.clone();
        let next_id = self.next_id.clone();
        let beating = self.beating.clone();
        let running = self.running.clone();

        let handle = thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                if beating.load(Ordering::SeqCst) {
                    let id = next_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
                    emit(id);
                }
                thread::sleep(period);
            }
        });

        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
    }

    /// Emit a single beat immediately, off-period.
    pub fn beat_once(&self) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        (self.emit)(id);
    }

    /// Stop emitting without stopping the thread (simulates a dead core).
    pub fn pause(&self) {
        self.beating.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.beating.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(handle) = slot.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for HeartbeatSender {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
