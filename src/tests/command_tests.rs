#[cfg(test)]
mod command_tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::command::{
        Command, CommandChannel, CommandDispatcher, CommandKind, ControlPlaneHook,
        DispatcherConfig, TraceRoute,
    };
    use crate::config::TransportSettings;
    use crate::envelope::MessageKind;
    use crate::error::LinkError;
    use crate::recovery::RecoveryState;
    use crate::tests::support::{fast_policy, recovery_fixture, wait_until, RecordingPort};
    use crate::transport::Transport;

    fn dispatcher() -> CommandDispatcher {
        CommandDispatcher::new(DispatcherConfig::default())
    }

    #[test]
    fn test_handshake_produces_reply_with_local_parameters() {
        let d = dispatcher();
        let reply = d
            .dispatch(&Command::handshake(44100, 20))
            .unwrap()
            .expect("handshake must reply");

        assert_eq!(reply.kind, CommandKind::Handshake);
        assert_eq!(reply.p1, 48000);
        assert_eq!(reply.p2, 10);

        // The host's side of the exchange is retained.
        let host = d.host_handshake().expect("host handshake recorded");
        assert_eq!(host.sample_rate, 44100);
        assert_eq!(host.frame_period_ms, 20);
    }

    #[test]
    fn test_time_sync_produces_reply() {
        let d = dispatcher();
        let reply = d
            .dispatch(&Command::time_sync(1_000))
            .unwrap()
            .expect("time sync must reply");
        assert_eq!(reply.kind, CommandKind::TimeSync);
        assert!(reply.p1 > 0);
    }

    #[test]
    fn test_panic_rejected_without_debug_commands() {
        let d = dispatcher();
        let result = d.dispatch(&Command::new(CommandKind::Panic, 0, 0));
        assert!(matches!(result, Err(LinkError::CommandRejected(_))));
        assert_eq!(d.stats().rejected, 1);
    }

    #[test]
    fn test_heap_init_opens_gate_once() {
        let d = dispatcher();
        let gate = d.heap_gate();
        assert!(!gate.load(Ordering::SeqCst));

        d.dispatch(&Command::new(CommandKind::HeapInit, 0x2000_0000, 65536))
            .unwrap();
        assert!(gate.load(Ordering::SeqCst));

        // A second init is tolerated and leaves the gate open.
        d.dispatch(&Command::new(CommandKind::HeapInit, 0x2000_0000, 65536))
            .unwrap();
        assert!(gate.load(Ordering::SeqCst));
    }

    #[test]
    fn test_trace_route_selector_validation() {
        let d = dispatcher();
        assert_eq!(d.trace_route(), TraceRoute::Shared);

        d.dispatch(&Command::new(CommandKind::TraceRoute, 1, 0))
            .unwrap();
        assert_ne!(d.trace_route(), TraceRoute::Shared);

        let result = d.dispatch(&Command::new(CommandKind::TraceRoute, 99, 0));
        assert!(matches!(result, Err(LinkError::CommandRejected(_))));
    }

    #[test]
    fn test_control_plane_hook_invoked() {
        struct Recorder(std::sync::Mutex<Vec<i64>>);
        impl ControlPlaneHook for Recorder {
            fn handle(&self, command: &Command) -> anyhow::Result<()> {
                self.0.lock().unwrap().push(command.p1);
                Ok(())
            }
        }

        let recorder = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        let d = CommandDispatcher::new(DispatcherConfig::default()).with_hook(recorder.clone());

        d.dispatch(&Command::new(CommandKind::CustomControlPlane, 42, 0))
            .unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![42]);
    }

    #[test]
    fn test_channel_send_reaches_port() {
        let fixture = recovery_fixture(fast_policy(), Duration::from_millis(50));
        let port = RecordingPort::new();
        let transport = Transport::new(&TransportSettings::default(), port.clone());
        let channel = CommandChannel::new(transport.clone(), fixture.controller.clone());

        channel
            .send(Command::new(CommandKind::StatPrint, 0, 0))
            .unwrap();
        assert!(wait_until(Duration::from_secs(1), || port.len() == 1));
        assert_eq!(port.kinds(), vec![MessageKind::Command]);

        transport.shutdown();
        fixture.transport.shutdown();
    }

    #[test]
    fn test_channel_rejected_while_disabled() {
        let fixture = recovery_fixture(fast_policy(), Duration::from_millis(50));
        let port = RecordingPort::new();
        let transport = Transport::new(&TransportSettings::default(), port.clone());
        let channel = CommandChannel::new(transport.clone(), fixture.controller.clone());

        fixture.controller.disable().unwrap();
        let result = channel.send(Command::new(CommandKind::StatPrint, 0, 0));
        assert!(matches!(
            result,
            Err(LinkError::Unavailable(RecoveryState::UserDisabled))
        ));
        assert_eq!(port.len(), 0);

        transport.shutdown();
        fixture.transport.shutdown();
    }

    #[test]
    fn test_reply_hook_records_handshake_and_offset() {
        let fixture = recovery_fixture(fast_policy(), Duration::from_millis(50));
        let channel =
            CommandChannel::new(fixture.transport.clone(), fixture.controller.clone());

        assert!(channel.remote_handshake().is_none());
        channel.on_reply(&Command::handshake(16000, 7));
        let handshake = channel.remote_handshake().expect("handshake stored");
        assert_eq!(handshake.sample_rate, 16000);
        assert_eq!(handshake.frame_period_ms, 7);

        channel.on_reply(&Command::time_sync(0));
        // Remote clock at epoch zero puts the offset deep in the past.
        assert!(channel.clock_offset_ms() < 0);

        fixture.transport.shutdown();
    }
}
