//! Events flowing out of and into the engine task.

use otafetch_transport::{ResponseHead, TransportError};

use crate::delivery::PooledBuffer;
use crate::error::EngineError;

/// Notifications from the engine to the orchestrator.
#[derive(Debug)]
pub enum EngineEvent {
    /// A block arrived intact. Dropping `payload` frees its pool slot.
    BlockReceived { index: u32, payload: PooledBuffer },
    /// Connectivity was lost. Restart with
    /// [`start_transfer`](crate::EngineHandle::start_transfer).
    ReconnectRequired,
    /// The access grant expired. Fetch a fresh locator, then restart.
    AuthorizationExpired,
    /// The transfer failed for good and the session was torn down.
    Fatal(EngineError),
}

/// Posted by request tasks to the engine task. `request` is the id the
/// scheduler assigned at dispatch; events for any other id are stale.
pub(crate) enum NetEvent<B> {
    SetupFailed {
        request: u64,
        reason: String,
    },
    ResponseReady {
        request: u64,
        head: ResponseHead,
        body: B,
    },
    ConnectionClosed {
        request: u64,
        reason: String,
    },
    TransportFailed {
        request: u64,
        error: TransportError,
    },
    ResponseComplete {
        request: u64,
    },
}

impl<B> NetEvent<B> {
    pub(crate) fn request(&self) -> u64 {
        match self {
            Self::SetupFailed { request, .. }
            | Self::ResponseReady { request, .. }
            | Self::ConnectionClosed { request, .. }
            | Self::TransportFailed { request, .. }
            | Self::ResponseComplete { request } => *request,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::SetupFailed { .. } => "setup_failed",
            Self::ResponseReady { .. } => "response_ready",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::TransportFailed { .. } => "transport_failed",
            Self::ResponseComplete { .. } => "response_complete",
        }
    }
}
