use serde::{Deserialize, Serialize};

use crate::constants::{STATUS_FORBIDDEN, STATUS_PARTIAL_CONTENT};

/// State of a download session as seen by the transfer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Idle; the next block may be requested.
    Ready,
    /// A block request is outstanding.
    RequestInFlight,
    /// Unrecoverable failure; the session has been torn down.
    Fatal,
    /// Connectivity was lost; the orchestrator must restart the transfer.
    NeedsReconnect,
    /// The access grant expired; the orchestrator must fetch a new one.
    NeedsFreshAuthorization,
}

impl TransferState {
    /// Returns `true` for states that only a fresh transfer start can leave.
    pub fn requires_restart(self) -> bool {
        matches!(
            self,
            Self::Fatal | Self::NeedsReconnect | Self::NeedsFreshAuthorization
        )
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::RequestInFlight => "request_in_flight",
            Self::Fatal => "fatal",
            Self::NeedsReconnect => "needs_reconnect",
            Self::NeedsFreshAuthorization => "needs_fresh_authorization",
        };
        f.write_str(s)
    }
}

/// Read-only job facts the orchestrator hands over at transfer start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorView {
    /// File size from the job document.
    pub total_file_size: u64,
    /// Blocks the orchestrator still needs.
    pub remaining_blocks: u32,
    /// Source URL, possibly carrying a time-limited access grant.
    pub source_locator: String,
}

/// Coarse classification of a response status for block requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 206, the only acceptable answer to a range request.
    PartialContent,
    /// 403, the access grant has expired.
    AuthorizationDenied,
    /// Anything else.
    Unexpected(u16),
}

/// Classifies a response status. Authorization denial wins over the
/// generic error bucket.
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        STATUS_PARTIAL_CONTENT => StatusClass::PartialContent,
        STATUS_FORBIDDEN => StatusClass::AuthorizationDenied,
        other => StatusClass::Unexpected(other),
    }
}
