use thiserror::Error;

use crate::envelope::{Direction, MessageKind};
use crate::recovery::RecoveryState;

/// Shared result type for the link subsystem.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Unified error taxonomy for the coprocessor link.
///
/// Transport-level failures are returned synchronously to the immediate
/// caller and never retried by the transport itself. Remote-side processing
/// failures come back as a status in the response envelope and are translated
/// into `CodecEngine`/`CommandRejected` by the blocking wrapper that issued
/// the request.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Transport is globally disabled (coprocessor reset in progress).
    #[error("transport is down")]
    TransportDown,

    /// The target queue or mailbox has no remaining capacity.
    #[error("queue full")]
    QueueFull,

    /// A bounded wait elapsed without the matching completion arriving.
    #[error("timed out waiting for completion")]
    Timeout,

    /// No handler is registered for this kind/direction pair.
    #[error("no handler registered for {kind:?}/{direction:?}")]
    InvalidRoute {
        kind: MessageKind,
        direction: Direction,
    },

    /// A bounded resource (e.g. the subscriber list) is exhausted.
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    /// The remote codec engine reported a processing failure.
    #[error("codec engine error: {0}")]
    CodecEngine(String),

    /// A command was refused by the remote dispatcher.
    #[error("command rejected: {0}")]
    CommandRejected(String),

    /// The coprocessor boot sequence failed. Retryable failures consume the
    /// retry budget; a fatal failure means the budget is exhausted.
    #[error("coprocessor boot failure (fatal: {fatal})")]
    BootFailure { fatal: bool },

    /// Fail-fast rejection: the coprocessor cannot service work right now.
    #[error("coprocessor unavailable (state: {0:?})")]
    Unavailable(RecoveryState),

    /// Internal invariant violation (poisoned lock, torn-down channel).
    #[error("internal: {0}")]
    Internal(String),
}
