use serde::{Deserialize, Serialize};

use crate::codec_proxy::CodecFrame;
use crate::command::Command;

/// Message kind tag. Determines how the payload is interpreted; the envelope
/// id is monotonic per kind and is used only for gap detection, never for
/// ordering guarantees across kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Heartbeat,
    Command,
    CodecJob,
    CodecResponse,
    StreamConfig,
    StreamBuffer,
    Trace,
    UserData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    High,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Tx,
    Rx,
}

/// Trace record forwarded from the coprocessor UART/trace path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub level: u8,
    pub module: String,
    pub text: String,
}

/// Stream parameters handed to the external audio HAL collaborator. The link
/// only forwards this record; it does not interpret audio semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub channels: u16,
    pub channel_map: u32,
    pub device_id: u32,
    pub volume: u8,
    pub buffer_frames: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            bit_depth: 16,
            channels: 2,
            channel_map: 0b11,
            device_id: 0,
            volume: 80,
            buffer_frames: 480,
        }
    }
}

/// One capture/playback buffer crossing the link.
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    pub stream_id: u32,
    pub data: Vec<u8>,
}

/// Closed payload variant set. Interpretation is fully determined by the
/// envelope kind; exhaustive matching is enforced at compile time.
#[derive(Debug, Clone)]
pub enum Payload {
    Trace(TraceRecord),
    StreamConfig(StreamConfig),
    StreamBuffer(StreamBuffer),
    UserData(Vec<u8>),
    Command(Command),
    Codec(CodecFrame),
}

/// Typed envelope delivered over the shared-memory channel.
///
/// Envelopes are created per call and destroyed after dispatch; they carry no
/// persistent identity. The transport assigns `id` at enqueue time.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub kind: MessageKind,
    pub priority: Priority,
    pub id: u32,
    pub direction: Direction,
    pub payload: Payload,
    pub synchronous: bool,
}

impl MessageEnvelope {
    pub fn new(kind: MessageKind, payload: Payload) -> Self {
        Self {
            kind,
            priority: Priority::Normal,
            id: 0,
            direction: Direction::Tx,
            payload,
            synchronous: false,
        }
    }

    /// Liveness beat. The beat counter rides in the envelope id; the payload
    /// set stays closed with an empty user-data blob.
    pub fn heartbeat(id: u32) -> Self {
        let mut env = Self::new(MessageKind::Heartbeat, Payload::UserData(Vec::new()))
            .with_priority(Priority::High);
        env.id = id;
        env
    }

    pub fn command(command: Command) -> Self {
        Self::new(MessageKind::Command, Payload::Command(command))
    }

    pub fn codec_job(frame: CodecFrame) -> Self {
        Self::new(MessageKind::CodecJob, Payload::Codec(frame))
    }

    pub fn codec_response(frame: CodecFrame) -> Self {
        Self::new(MessageKind::CodecResponse, Payload::Codec(frame))
    }

    pub fn stream_config(config: StreamConfig) -> Self {
        Self::new(MessageKind::StreamConfig, Payload::StreamConfig(config))
            .with_priority(Priority::High)
    }

    pub fn stream_buffer(buffer: StreamBuffer) -> Self {
        Self::new(MessageKind::StreamBuffer, Payload::StreamBuffer(buffer))
    }

    pub fn trace(record: TraceRecord) -> Self {
        Self::new(MessageKind::Trace, Payload::Trace(record))
    }

    pub fn user_data(data: Vec<u8>) -> Self {
        Self::new(MessageKind::UserData, Payload::UserData(data))
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Mark the envelope as the receive leg of the link.
    pub fn into_rx(mut self) -> Self {
        self.direction = Direction::Rx;
        self
    }

    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }

    /// Payload length in bytes where the payload carries a raw buffer.
    pub fn payload_len(&self) -> usize {
        match &self.payload {
            Payload::UserData(data) => data.len(),
            Payload::StreamBuffer(buffer) => buffer.data.len(),
            Payload::Codec(frame) => frame.data.len(),
            _ => 0,
        }
    }
}
