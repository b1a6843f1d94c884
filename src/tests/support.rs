//! Shared stubs and fixtures for the test suite.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::codec_proxy::{CodecCommand, CodecEngine};
use crate::config::TransportSettings;
use crate::envelope::{MessageEnvelope, MessageKind, Priority};
use crate::error::Result;
use crate::heartbeat::BeatGate;
use crate::recovery::{
    BootFailureRecord, BootFlagStore, ClockControl, FirmwareLoader, RecoveryController,
    RecoveryDeps, RetryPolicy, SystemReset,
};
use crate::transport::{LinkPort, Transport};

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Port that records every delivered envelope.
#[derive(Default)]
pub struct RecordingPort {
    pub delivered: Mutex<Vec<MessageEnvelope>>,
}

impl RecordingPort {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kinds(&self) -> Vec<MessageKind> {
        self.delivered
            .lock()
            .map(|d| d.iter().map(|e| e.kind).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.delivered.lock().map(|d| d.len()).unwrap_or(0)
    }
}

impl LinkPort for RecordingPort {
    fn deliver(&self, envelope: MessageEnvelope) -> Result<()> {
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push(envelope);
        }
        Ok(())
    }
}

/// Port that swallows everything (nobody ever answers).
pub struct BlackholePort;

impl LinkPort for BlackholePort {
    fn deliver(&self, _envelope: MessageEnvelope) -> Result<()> {
        Ok(())
    }
}

/// Port whose delivery blocks while `blocked` is set. Records the order in
/// which envelopes leave the pump.
pub struct StallingPort {
    pub order: Mutex<Vec<(MessageKind, Priority)>>,
    blocked: AtomicBool,
}

impl StallingPort {
    pub fn new(blocked: bool) -> Arc<Self> {
        Arc::new(Self {
            order: Mutex::new(Vec::new()),
            blocked: AtomicBool::new(blocked),
        })
    }

    pub fn release(&self) {
        self.blocked.store(false, Ordering::SeqCst);
    }

    pub fn order(&self) -> Vec<(MessageKind, Priority)> {
        self.order.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

impl LinkPort for StallingPort {
    fn deliver(&self, envelope: MessageEnvelope) -> Result<()> {
        if let Ok(mut order) = self.order.lock() {
            order.push((envelope.kind, envelope.priority));
        }
        while self.blocked.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }
}

/// Codec engine that hands the input back unchanged.
pub struct PassThroughEngine;

impl CodecEngine for PassThroughEngine {
    fn process(&self, _command: CodecCommand, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(input.to_vec())
    }
}

/// Codec engine that always fails.
pub struct FailingEngine;

impl CodecEngine for FailingEngine {
    fn process(&self, command: CodecCommand, _input: &[u8]) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("engine rejected {command:?}")
    }
}

/// Codec engine that sleeps before answering, for serialization tests.
pub struct SleepyEngine {
    pub delay: Duration,
}

impl CodecEngine for SleepyEngine {
    fn process(&self, _command: CodecCommand, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        thread::sleep(self.delay);
        Ok(input.to_vec())
    }
}

/// Firmware loader stub. `fail_next` injects that many failing load attempts;
/// `on_release` runs after reset release (e.g. to notify the beat gate).
#[derive(Default)]
pub struct StubFirmware {
    pub loads: AtomicUsize,
    pub fail_next: AtomicUsize,
    pub on_release: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl StubFirmware {
    pub fn set_on_release<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        if let Ok(mut slot) = self.on_release.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl FirmwareLoader for StubFirmware {
    fn load_image(&self) -> anyhow::Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("injected firmware load failure");
        }
        Ok(())
    }

    fn program_boot_entry(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn release_reset(&self) -> anyhow::Result<()> {
        if let Ok(slot) = self.on_release.lock() {
            if let Some(hook) = slot.as_ref() {
                hook();
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct StubClock {
    pub gated_off: AtomicUsize,
}

impl ClockControl for StubClock {
    fn gate_on(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn gate_off(&self) -> anyhow::Result<()> {
        self.gated_off.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemFlagStore {
    pub records: Mutex<Vec<BootFailureRecord>>,
}

impl MemFlagStore {
    pub fn records(&self) -> Vec<BootFailureRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl BootFlagStore for MemFlagStore {
    fn set_boot_failure(&self, record: &BootFailureRecord) -> anyhow::Result<()> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct StubReset {
    pub reboots: AtomicUsize,
}

impl StubReset {
    pub fn reboots(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }
}

impl SystemReset for StubReset {
    fn reboot_system(&self) {
        self.reboots.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct RecoveryFixture {
    pub transport: Arc<Transport>,
    pub gate: Arc<BeatGate>,
    pub controller: Arc<RecoveryController>,
    pub firmware: Arc<StubFirmware>,
    pub clock: Arc<StubClock>,
    pub flags: Arc<MemFlagStore>,
    pub reset: Arc<StubReset>,
}

pub fn stub_deps(
    firmware: &Arc<StubFirmware>,
    clock: &Arc<StubClock>,
    flags: &Arc<MemFlagStore>,
    reset: &Arc<StubReset>,
) -> RecoveryDeps {
    RecoveryDeps {
        firmware: firmware.clone(),
        clock: clock.clone(),
        boot_flag: flags.clone(),
        system: reset.clone(),
    }
}

/// Controller over a blackhole transport, with all capabilities stubbed.
pub fn recovery_fixture(policy: RetryPolicy, boot_wait: Duration) -> RecoveryFixture {
    let transport = Transport::new(&TransportSettings::default(), Arc::new(BlackholePort));
    let gate = BeatGate::new();
    let firmware = Arc::new(StubFirmware::default());
    let clock = Arc::new(StubClock::default());
    let flags = Arc::new(MemFlagStore::default());
    let reset = Arc::new(StubReset::default());

    let controller = RecoveryController::new(
        policy,
        boot_wait,
        8,
        stub_deps(&firmware, &clock, &flags, &reset),
        transport.clone(),
        gate.clone(),
    );

    RecoveryFixture {
        transport,
        gate,
        controller,
        firmware,
        clock,
        flags,
        reset,
    }
}

/// Arrange for boot attempts to succeed: shortly after reset release, a
/// "first heartbeat" hits the gate. The delay matters, the gate only wakes
/// waiters that are already parked.
pub fn notify_gate_after_release(firmware: &Arc<StubFirmware>, gate: &Arc<BeatGate>) {
    let gate = gate.clone();
    firmware.set_on_release(move || {
        let gate = gate.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            gate.notify();
        });
    });
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        interval: Duration::from_millis(10),
    }
}
