#[cfg(test)]
mod transport_tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::config::TransportSettings;
    use crate::envelope::{Direction, MessageEnvelope, MessageKind, Priority};
    use crate::error::LinkError;
    use crate::tests::support::{wait_until, BlackholePort, RecordingPort, StallingPort};
    use crate::transport::Transport;

    fn small_settings() -> TransportSettings {
        TransportSettings {
            queue_depth: 2,
            sync_timeout_ms: 500,
        }
    }

    #[test]
    fn test_enqueue_rejected_while_disabled() {
        let port = RecordingPort::new();
        let transport = Transport::new(&TransportSettings::default(), port.clone());

        transport.set_enabled(false);
        let result = transport.enqueue(MessageEnvelope::user_data(vec![1, 2, 3]));
        assert!(matches!(result, Err(LinkError::TransportDown)));
        assert_eq!(port.len(), 0);

        transport.shutdown();
    }

    #[test]
    fn test_enqueue_assigns_ids_per_kind() {
        let port = RecordingPort::new();
        let transport = Transport::new(&TransportSettings::default(), port.clone());

        transport
            .enqueue(MessageEnvelope::user_data(vec![1]))
            .unwrap();
        transport
            .enqueue(MessageEnvelope::user_data(vec![2]))
            .unwrap();

        assert!(wait_until(Duration::from_secs(1), || port.len() == 2));
        let delivered = port.delivered.lock().unwrap();
        assert_eq!(delivered[0].id, 1);
        assert_eq!(delivered[1].id, 2);
        drop(delivered);

        transport.shutdown();
    }

    #[test]
    fn test_queue_full_when_port_stalls() {
        let port = StallingPort::new(true);
        let transport = Transport::new(&small_settings(), port.clone());

        // One envelope blocks inside the port, two fit in the lane; a
        // bounded number of sends must hit the full lane.
        let mut outcome = None;
        for i in 0..10 {
            if let Err(e) = transport.enqueue(MessageEnvelope::user_data(vec![i])) {
                outcome = Some(e);
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(matches!(outcome, Some(LinkError::QueueFull)));

        port.release();
        transport.shutdown();
    }

    #[test]
    fn test_high_priority_lane_preempts_normal() {
        let port = StallingPort::new(true);
        let transport = Transport::new(&small_settings(), port.clone());

        // First normal envelope gets stuck in the port; more traffic piles
        // up behind it in both lanes.
        transport
            .enqueue(MessageEnvelope::user_data(vec![0]))
            .unwrap();
        assert!(wait_until(Duration::from_secs(1), || port.order().len() == 1));

        transport
            .enqueue(MessageEnvelope::user_data(vec![1]))
            .unwrap();
        transport
            .enqueue(
                MessageEnvelope::user_data(vec![2]).with_priority(Priority::High),
            )
            .unwrap();

        port.release();
        assert!(wait_until(Duration::from_secs(1), || port.order().len() == 3));

        // The high-priority envelope must leave before the queued normal one.
        let order = port.order();
        assert_eq!(order[1].1, Priority::High);
        assert_eq!(order[2].1, Priority::Normal);

        transport.shutdown();
    }

    #[test]
    fn test_send_sync_times_out_without_reply() {
        let transport = Transport::new(&TransportSettings::default(), Arc::new(BlackholePort));

        let result = transport.send_sync(
            MessageEnvelope::user_data(vec![1]),
            Duration::from_millis(50),
        );
        assert!(matches!(result, Err(LinkError::Timeout)));

        transport.shutdown();
    }

    #[test]
    fn test_send_sync_completes_on_rx_dispatch() {
        let transport = Transport::new(&TransportSettings::default(), Arc::new(BlackholePort));
        transport.registry().register(
            MessageKind::UserData,
            Direction::Rx,
            |_envelope| {},
        );

        let responder = transport.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            responder
                .dispatch(MessageEnvelope::user_data(vec![9]).into_rx())
                .unwrap();
        });

        let result = transport.send_sync(
            MessageEnvelope::user_data(vec![1]),
            Duration::from_secs(2),
        );
        assert!(result.is_ok());

        handle.join().unwrap();
        transport.shutdown();
    }

    #[test]
    fn test_late_completion_after_timeout_is_harmless() {
        let transport = Transport::new(&TransportSettings::default(), Arc::new(BlackholePort));

        let result = transport.send_sync(
            MessageEnvelope::user_data(vec![1]),
            Duration::from_millis(30),
        );
        assert!(matches!(result, Err(LinkError::Timeout)));

        // The waiter is gone; a late completion finds nobody.
        assert!(!transport.complete(MessageKind::UserData));

        transport.shutdown();
    }

    #[test]
    fn test_dispatch_unmatched_envelope_is_an_error() {
        let transport = Transport::new(&TransportSettings::default(), Arc::new(BlackholePort));

        let result = transport.dispatch(MessageEnvelope::user_data(vec![1]).into_rx());
        assert!(matches!(result, Err(LinkError::InvalidRoute { .. })));
        assert_eq!(transport.stats().unmatched, 1);

        transport.shutdown();
    }

    #[test]
    fn test_disabled_transport_drops_queued_envelopes() {
        let port = StallingPort::new(true);
        let transport = Transport::new(&small_settings(), port.clone());

        transport
            .enqueue(MessageEnvelope::user_data(vec![0]))
            .unwrap();
        assert!(wait_until(Duration::from_secs(1), || port.order().len() == 1));
        transport
            .enqueue(MessageEnvelope::user_data(vec![1]))
            .unwrap();

        // Fence, then let the pump drain: the queued envelope must be
        // dropped, not delivered.
        transport.set_enabled(false);
        port.release();

        assert!(wait_until(Duration::from_secs(1), || {
            transport.stats().dropped_disabled >= 1
        }));
        assert_eq!(port.order().len(), 1);

        transport.shutdown();
    }

    #[test]
    fn test_stats_reflect_traffic() {
        let port = RecordingPort::new();
        let transport = Transport::new(&TransportSettings::default(), port.clone());

        transport
            .enqueue(MessageEnvelope::user_data(vec![1]))
            .unwrap();
        assert!(wait_until(Duration::from_secs(1), || port.len() == 1));

        let stats = transport.stats();
        assert_eq!(stats.enqueued_normal, 1);
        assert_eq!(stats.delivered, 1);

        transport.shutdown();
    }
}
