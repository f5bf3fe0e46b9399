//! Error types for the transfer engine.
//!
//! Only setup and protocol failures are errors. Lost connectivity and an
//! expired access grant are reported as events so the orchestrator can
//! restart instead of giving up.

use std::time::Duration;

use otafetch_protocol::{ProtocolError, TransferState};
use otafetch_transport::{ConnectError, TransportError};

/// Failure of a block transfer, carried by [`EngineEvent::Fatal`](crate::EngineEvent::Fatal).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("request setup failed: {0}")]
    Setup(String),

    #[error("unexpected response status {0}")]
    UnexpectedStatus(u16),

    #[error("response carries no usable Content-Length")]
    MissingContentLength,

    #[error("response length {actual} does not match requested length {expected}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("failed to read response body: {0}")]
    Body(#[source] TransportError),

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("engine task has stopped")]
    Stopped,
}

/// Errors from the one-shot size probe.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe request failed: {0}")]
    Transport(#[from] TransportError),

    #[error("probe did not complete within {0:?}")]
    Timeout(Duration),

    #[error("probe answered with status {0}, expected 206")]
    UnexpectedStatus(u16),

    #[error("probe response has no Content-Range header")]
    MissingContentRange,

    #[error("invalid Content-Range: {0}")]
    Range(#[from] ProtocolError),
}

/// Errors from starting a transfer. The session is left reset.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("invalid orchestrator view: {0}")]
    InvalidView(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("size probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("remote object is {remote} bytes but the job expects {expected}")]
    SizeMismatch { remote: u64, expected: u64 },

    #[error("engine task has stopped")]
    Stopped,
}

impl StartError {
    /// Returns `true` if the store refused the probe with 403, meaning the
    /// access grant in the locator has already expired.
    pub fn is_authorization_denied(&self) -> bool {
        matches!(
            self,
            Self::Probe(ProbeError::UnexpectedStatus(status))
                if *status == otafetch_protocol::constants::STATUS_FORBIDDEN
        )
    }
}

/// Errors from scheduling a block request.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("no transfer has been started")]
    NotStarted,

    #[error("session is {0}, not ready")]
    NotReady(TransferState),

    #[error("cannot format range header: {0}")]
    Format(#[from] ProtocolError),

    #[error("block {index} is out of range ({num_blocks} blocks)")]
    BlockOutOfRange { index: u32, num_blocks: u32 },

    #[error("engine task has stopped")]
    Stopped,
}
