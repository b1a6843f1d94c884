use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

use crate::codec_proxy::{CodecProxy, ProxyStats};
use crate::command::{CommandChannel, Handshake};
use crate::config::LinkConfig;
use crate::envelope::{Direction, MessageKind, Payload};
use crate::error::Result;
use crate::heartbeat::{BeatGate, HeartbeatMonitor, HeartbeatStats};
use crate::recovery::{RecoveryController, RecoveryDeps, RecoveryState, RecoveryStats};
use crate::stream_bridge::{AudioStreamBridge, BridgeStats};
use crate::transport::{LinkPort, Transport, TransportStats};

/// Everything the link needs from the platform: the shared-memory port and
/// the recovery capabilities.
pub struct LinkDeps {
    pub port: Arc<dyn LinkPort>,
    pub recovery: RecoveryDeps,
}

/// One status snapshot across all link components.
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub state: RecoveryState,
    pub transport: TransportStats,
    pub heartbeat: HeartbeatStats,
    pub recovery: RecoveryStats,
    pub codec: ProxyStats,
    pub stream: BridgeStats,
}

/// Host-side coprocessor link facade.
///
/// Wires the transport, heartbeat supervisor, recovery controller, command
/// channel, codec proxy and audio stream bridge together and registers the
/// receive-side handlers. Construction starts the heartbeat supervisor;
/// `shutdown()` (or drop) stops the background threads.
pub struct CoprocessorLink {
    config: LinkConfig,
    transport: Arc<Transport>,
    recovery: Arc<RecoveryController>,
    monitor: Arc<HeartbeatMonitor>,
    command: Arc<CommandChannel>,
    codec: Arc<CodecProxy>,
    bridge: Arc<AudioStreamBridge>,
}

impl CoprocessorLink {
    pub fn new(config: LinkConfig, deps: LinkDeps) -> anyhow::Result<Arc<Self>> {
        // Initialize logging
        if env_logger::try_init().is_ok() {
            info!("Logging initialized");
        }

        config.validate()?;

        let transport = Transport::new(&config.transport, deps.port);
        let gate = BeatGate::new();
        let recovery = RecoveryController::new(
            config.recovery.retry_policy(),
            config.recovery.boot_wait(),
            config.recovery.max_subscribers,
            deps.recovery,
            transport.clone(),
            gate.clone(),
        );
        let monitor = HeartbeatMonitor::new(&config.heartbeat, recovery.clone(), gate);
        let command = CommandChannel::new(transport.clone(), recovery.clone());
        let codec = CodecProxy::new(transport.clone(), recovery.clone());
        let bridge = AudioStreamBridge::new(&config.stream, transport.clone(), recovery.clone());

        Self::register_handlers(&transport, &monitor, &command, &codec, &bridge);

        {
            let bridge = bridge.clone();
            recovery.subscribe(Box::new(move |state| bridge.on_recovery_event(state)))?;
        }

        monitor.start();
        info!("Coprocessor link up");

        Ok(Arc::new(Self {
            config,
            transport,
            recovery,
            monitor,
            command,
            codec,
            bridge,
        }))
    }

    /// Receive-side routing: each inbound envelope kind feeds the component
    /// that owns it.
    fn register_handlers(
        transport: &Arc<Transport>,
        monitor: &Arc<HeartbeatMonitor>,
        command: &Arc<CommandChannel>,
        codec: &Arc<CodecProxy>,
        bridge: &Arc<AudioStreamBridge>,
    ) {
        let beat_tx = monitor.beat_sender();
        transport.registry().register(
            MessageKind::Heartbeat,
            Direction::Rx,
            move |envelope| {
                if beat_tx.send(envelope.id).is_err() {
                    warn!("Heartbeat supervisor gone, beat dropped");
                }
            },
        );

        let command = command.clone();
        transport.registry().register(
            MessageKind::Command,
            Direction::Rx,
            move |envelope| {
                if let Payload::Command(ref reply) = envelope.payload {
                    command.on_reply(reply);
                } else {
                    warn!("Command envelope with non-command payload, dropping");
                }
            },
        );

        let codec = codec.clone();
        transport.registry().register(
            MessageKind::CodecResponse,
            Direction::Rx,
            move |envelope| {
                if let Payload::Codec(ref frame) = envelope.payload {
                    codec.on_response(frame.clone());
                } else {
                    warn!("Codec response envelope with non-codec payload, dropping");
                }
            },
        );

        let bridge_rx = bridge.clone();
        transport.registry().register(
            MessageKind::StreamBuffer,
            Direction::Rx,
            move |envelope| bridge_rx.on_inbound(envelope),
        );

        transport.registry().register(
            MessageKind::StreamConfig,
            Direction::Rx,
            |envelope| {
                debug!("Stream config acknowledged (id={})", envelope.id);
            },
        );

        transport.registry().register(
            MessageKind::Trace,
            Direction::Rx,
            |envelope| {
                if let Payload::Trace(ref record) = envelope.payload {
                    debug!("coprocessor trace: {}", record.text);
                }
            },
        );
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn recovery(&self) -> &Arc<RecoveryController> {
        &self.recovery
    }

    pub fn command(&self) -> &Arc<CommandChannel> {
        &self.command
    }

    pub fn codec(&self) -> &Arc<CodecProxy> {
        &self.codec
    }

    pub fn stream(&self) -> &Arc<AudioStreamBridge> {
        &self.bridge
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    /// Synchronous session handshake with the coprocessor.
    pub fn handshake(&self) -> Result<()> {
        let cmd = crate::command::Command::handshake(
            self.config.command.sample_rate,
            self.config.command.frame_period_ms,
        );
        self.command
            .send_sync(cmd, self.config.transport.sync_timeout())
    }

    pub fn remote_handshake(&self) -> Option<Handshake> {
        self.command.remote_handshake()
    }

    pub fn enable(self: &Arc<Self>) -> Result<()> {
        self.recovery.enable()
    }

    pub fn disable(&self) -> Result<()> {
        self.recovery.disable()
    }

    pub fn request_reboot(&self) -> Result<()> {
        self.recovery.request_reboot()
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            state: self.recovery.state(),
            transport: self.transport.stats(),
            heartbeat: self.monitor.stats(),
            recovery: self.recovery.stats(),
            codec: self.codec.stats(),
            stream: self.bridge.stats(),
        }
    }

    pub fn shutdown(&self) {
        info!("Coprocessor link shutting down");
        self.bridge.stop_stream();
        self.monitor.stop();
        self.transport.shutdown();
    }
}
