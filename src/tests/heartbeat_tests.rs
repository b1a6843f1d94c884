#[cfg(test)]
mod heartbeat_tests {
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use crate::config::HeartbeatSettings;
    use crate::heartbeat::{BeatGate, HeartbeatMonitor, HeartbeatSender, HeartbeatTracker};
    use crate::recovery::RecoveryState;
    use crate::tests::support::{fast_policy, recovery_fixture, wait_until};

    #[test]
    fn test_tracker_reports_gap_in_beat_ids() {
        let mut tracker = HeartbeatTracker::new();
        assert_eq!(tracker.on_beat(1), 0);
        assert_eq!(tracker.on_beat(2), 0);
        assert_eq!(tracker.on_beat(3), 0);
        // Beat 4 lost in transit: a gap, not a miss.
        assert_eq!(tracker.on_beat(5), 1);
    }

    #[test]
    fn test_tracker_beat_resets_miss_count() {
        let mut tracker = HeartbeatTracker::new();
        assert_eq!(tracker.on_window_elapsed(), 1);
        assert_eq!(tracker.on_window_elapsed(), 2);
        tracker.on_beat(1);
        assert_eq!(tracker.on_window_elapsed(), 1);
    }

    #[test]
    fn test_gate_wakes_on_notify() {
        let gate = BeatGate::new();

        let notifier = gate.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            notifier.notify();
        });

        assert!(gate.wait_next(Duration::from_secs(2)));
        handle.join().unwrap();

        // No further beats: the next wait must time out.
        assert!(!gate.wait_next(Duration::from_millis(50)));
    }

    #[test]
    fn test_monitor_declares_crash_after_max_misses() {
        let fixture = recovery_fixture(fast_policy(), Duration::from_millis(50));
        // Boot succeeds: reset release is followed by a first heartbeat.
        crate::tests::support::notify_gate_after_release(&fixture.firmware, &fixture.gate);

        let settings = HeartbeatSettings {
            period_ms: 20,
            window_ms: 50,
            max_misses: 2,
        };
        let monitor = HeartbeatMonitor::new(
            &settings,
            fixture.controller.clone(),
            fixture.gate.clone(),
        );
        monitor.start();

        // Total silence: two windows must elapse, then the crash is
        // declared and the (instantly successful) reboot runs.
        assert!(wait_until(Duration::from_secs(3), || {
            fixture.firmware.loads() >= 1
        }));
        assert!(wait_until(Duration::from_secs(2), || {
            fixture.controller.state() == RecoveryState::Done
        }));
        assert!(monitor.stats().crashes_declared >= 1);

        // Keep the supervisor fed so no second crash fires while we check
        // that exactly one reboot happened.
        let beat_tx = monitor.beat_sender();
        for id in 1..=10u32 {
            let _ = beat_tx.send(id);
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(fixture.firmware.loads(), 1);
        assert_eq!(fixture.reset.reboots(), 0);

        monitor.stop();
        fixture.transport.shutdown();
    }

    #[test]
    fn test_monitor_stays_quiet_while_beats_flow() {
        let fixture = recovery_fixture(fast_policy(), Duration::from_millis(50));
        let settings = HeartbeatSettings {
            period_ms: 20,
            window_ms: 100,
            max_misses: 2,
        };
        let monitor = HeartbeatMonitor::new(
            &settings,
            fixture.controller.clone(),
            fixture.gate.clone(),
        );
        monitor.start();

        let beat_tx = monitor.beat_sender();
        for id in 1..=10u32 {
            let _ = beat_tx.send(id);
            thread::sleep(Duration::from_millis(30));
        }

        assert_eq!(fixture.firmware.loads(), 0);
        assert_eq!(fixture.controller.state(), RecoveryState::Done);
        assert!(monitor.stats().beats >= 10);
        assert_eq!(monitor.stats().crashes_declared, 0);

        monitor.stop();
        fixture.transport.shutdown();
    }

    #[test]
    fn test_sender_emits_monotonic_ids() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sender = HeartbeatSender::new(Duration::from_millis(10), move |id| {
            sink.lock().unwrap().push(id);
        });

        sender.beat_once();
        sender.beat_once();
        sender.beat_once();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_sender_pause_and_resume() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sender = HeartbeatSender::new(Duration::from_millis(10), move |id| {
            sink.lock().unwrap().push(id);
        });
        sender.start();

        assert!(wait_until(Duration::from_secs(2), || {
            !seen.lock().unwrap().is_empty()
        }));

        sender.pause();
        thread::sleep(Duration::from_millis(50));
        let frozen = seen.lock().unwrap().len();
        thread::sleep(Duration::from_millis(100));
        // Allow one in-flight beat around the pause itself.
        assert!(seen.lock().unwrap().len() <= frozen + 1);

        sender.resume();
        assert!(wait_until(Duration::from_secs(2), || {
            seen.lock().unwrap().len() > frozen + 1
        }));

        sender.stop();
    }
}
