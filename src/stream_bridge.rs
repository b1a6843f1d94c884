use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::StreamSettings;
use crate::envelope::{MessageEnvelope, Payload, StreamBuffer, StreamConfig};
use crate::error::{LinkError, Result};
use crate::recovery::{RecoveryController, RecoveryState};
use crate::transport::Transport;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BridgeStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub active: bool,
    pub suspended: bool,
}

/// Audio streaming bridge between host audio and the coprocessor codec path.
///
/// Stream setup is synchronous (the coprocessor must acknowledge the format
/// before frames flow); frames themselves are fire-and-forget. While recovery
/// is in progress the bridge suspends itself and drops frames with a counter
/// rather than stalling the audio path.
pub struct AudioStreamBridge {
    transport: Arc<Transport>,
    recovery: Arc<RecoveryController>,
    start_timeout: Duration,
    config: Mutex<StreamConfig>,
    active: AtomicBool,
    suspended: AtomicBool,
    playback_tx: Sender<StreamBuffer>,
    playback_rx: Receiver<StreamBuffer>,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AudioStreamBridge {
    pub fn new(
        settings: &StreamSettings,
        transport: Arc<Transport>,
        recovery: Arc<RecoveryController>,
    ) -> Arc<Self> {
        let (playback_tx, playback_rx) = channel::bounded(settings.playback_queue_depth);
        Arc::new(Self {
            transport,
            recovery,
            start_timeout: settings.start_timeout(),
            config: Mutex::new(StreamConfig::default()),
            active: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            playback_tx,
            playback_rx,
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        })
    }

    /// Negotiate the stream format with the coprocessor, then open the
    /// frame path. Blocks until the coprocessor acknowledges or the
    /// configured start timeout elapses.
    pub fn start_stream(&self, config: StreamConfig) -> Result<()> {
        self.recovery.guard_available()?;
        self.transport
            .send_sync(MessageEnvelope::stream_config(config.clone()), self.start_timeout)?;
        if let Ok(mut current) = self.config.lock() {
            *current = config;
        }
        self.active.store(true, Ordering::SeqCst);
        info!("Audio stream started");
        Ok(())
    }

    pub fn stop_stream(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("Audio stream stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Push one captured frame toward the coprocessor. Frames offered while
    /// the stream is inactive or suspended are dropped and counted, never
    /// queued for later.
    pub fn push_capture(&self, stream_id: u32, data: Vec<u8>) -> Result<()> {
        if !self.active.load(Ordering::SeqCst) || self.suspended.load(Ordering::SeqCst) {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let buffer = StreamBuffer { stream_id, data };
        match self.transport.enqueue(MessageEnvelope::stream_buffer(buffer)) {
            Ok(()) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(LinkError::QueueFull) | Err(LinkError::TransportDown) => {
                // Real-time path: dropping beats blocking.
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Blocking poll for the next decoded frame from the coprocessor.
    pub fn poll_playback(&self, timeout: Duration) -> Option<StreamBuffer> {
        self.playback_rx.recv_timeout(timeout).ok()
    }

    /// Inbound frame delivery from the transport dispatch path.
    pub(crate) fn on_inbound(&self, envelope: &MessageEnvelope) {
        let Payload::StreamBuffer(ref buffer) = envelope.payload else {
            warn!("Stream buffer envelope with non-buffer payload, dropping");
            return;
        };
        if !self.active.load(Ordering::SeqCst) {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.playback_tx.try_send(buffer.clone()) {
            Ok(()) => {
                self.frames_received.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Recovery subscriber hook: suspend the frame path while the
    /// coprocessor is down, resume once it is back.
    pub(crate) fn on_recovery_event(&self, state: RecoveryState) {
        match state {
            RecoveryState::Recovering | RecoveryState::UserDisabled => {
                if !self.suspended.swap(true, Ordering::SeqCst) {
                    debug!("Audio stream suspended ({:?})", state);
                }
            }
            RecoveryState::Done | RecoveryState::UserEnabled => {
                if self.suspended.swap(false, Ordering::SeqCst) {
                    debug!("Audio stream resumed ({:?})", state);
                }
            }
        }
    }

    pub fn config(&self) -> StreamConfig {
        self.config
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            active: self.active.load(Ordering::SeqCst),
            suspended: self.suspended.load(Ordering::SeqCst),
        }
    }
}
