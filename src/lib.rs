//! # Dsplink Coprocessor Link
//!
//! Host-side link subsystem for an audio DSP coprocessor reached over
//! shared memory.
//!
//! ## Overview
//!
//! Dsplink carries typed messages between a host core and a coprocessor:
//! commands, codec jobs, audio stream frames and heartbeats, each on a
//! priority lane so control traffic is never starved by bulk audio. A
//! heartbeat supervisor watches the remote core and a bounded-retry
//! recovery controller reboots it when it goes silent, escalating to a
//! full system reboot only after the local budget is exhausted.
//!
//! ## Core Features
//!
//! - **Typed transport**: Priority lanes with fire-and-forget and
//!   synchronous (acknowledged) sends
//! - **Command channel**: Handshake, time sync, trace routing and debug
//!   controls with a remote-side dispatch table
//! - **Codec proxy**: One-outstanding-request RPC over a bounded job
//!   mailbox with explicit backpressure
//! - **Heartbeat supervision**: Gap detection and crash declaration after
//!   a bounded run of silent windows
//! - **Recovery**: Bounded-retry coprocessor reboot with a persisted
//!   failure flag on escalation
//! - **Audio streaming**: Format negotiation plus drop-not-block frame
//!   forwarding in both directions
//! - **Configuration**: Persistent TOML configuration with validation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dsplink::config::LinkConfig;
//! use dsplink::link::{CoprocessorLink, LinkDeps};
//! use dsplink::loopback::LoopbackCoprocessor;
//! # use dsplink::codec_proxy::{CodecCommand, CodecEngine};
//! # struct PassThrough;
//! # impl CodecEngine for PassThrough {
//! #     fn process(&self, _c: CodecCommand, input: &[u8]) -> anyhow::Result<Vec<u8>> {
//! #         Ok(input.to_vec())
//! #     }
//! # }
//! # fn recovery_deps() -> dsplink::recovery::RecoveryDeps { unimplemented!() }
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LinkConfig::default();
//!     let coprocessor = LoopbackCoprocessor::new(&config, Arc::new(PassThrough));
//!
//!     let link = CoprocessorLink::new(
//!         config,
//!         LinkDeps {
//!             port: coprocessor.clone(),
//!             recovery: recovery_deps(),
//!         },
//!     )?;
//!     coprocessor.connect(link.transport());
//!
//!     link.handshake()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`link`]: Top-level facade wiring all components together
//! - [`transport`]: Priority-lane message transport over a `LinkPort`
//! - [`envelope`]: Typed message envelopes and payloads
//! - [`registry`]: Handler routing keyed by message kind and direction
//! - [`command`]: Command channel and remote-side dispatch table
//! - [`codec_proxy`]: Codec RPC proxy, bounded mailbox and worker loop
//! - [`heartbeat`]: Heartbeat supervision and emission
//! - [`recovery`]: Crash recovery and bounded-retry boot control
//! - [`stream_bridge`]: Audio frame bridging with suspend-on-recovery
//! - [`config`]: Configuration management with persistence and validation
//! - [`loopback`]: In-process coprocessor double for tests and development

/// Typed message envelopes, payloads and priorities
pub mod envelope;

/// Link error type shared across all components
pub mod error;

/// Handler registry keyed by message kind and direction
pub mod registry;

/// Priority-lane transport with synchronous send support
pub mod transport;

/// Command channel, dispatch table and control-plane hooks
pub mod command;

/// Codec RPC proxy with bounded job mailbox and worker loop
pub mod codec_proxy;

/// Heartbeat supervision, emission and the boot wait gate
pub mod heartbeat;

/// Crash recovery, bounded-retry boot and escalation
pub mod recovery;

/// Audio stream bridging between host audio and the coprocessor
pub mod stream_bridge;

/// Configuration management with persistence and validation
pub mod config;

/// Top-level link facade
pub mod link;

/// In-process coprocessor double for tests and development
pub mod loopback;

#[cfg(test)]
pub mod tests;

// Re-export main types for convenience
pub use config::{ConfigManager, LinkConfig};
pub use envelope::{MessageEnvelope, MessageKind, Priority};
pub use error::{LinkError, Result};
pub use link::{CoprocessorLink, LinkDeps, LinkStatus};
pub use recovery::{RecoveryController, RecoveryState};
pub use transport::{LinkPort, Transport};
