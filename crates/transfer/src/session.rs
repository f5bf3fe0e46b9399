//! The single live download session.

use std::sync::Arc;

use otafetch_protocol::TransferState;
use otafetch_transport::Target;

use crate::error::EngineError;

/// Mutable state of one transfer. Owned by the engine task; nothing else
/// touches it, so every transition is linearized by the task's event loop.
pub(crate) struct DownloadSession<Conn> {
    pub(crate) connection: Option<Arc<Conn>>,
    pub(crate) target: Option<Target>,
    pub(crate) total_size: u64,
    pub(crate) num_blocks: u32,
    pub(crate) block_size: u32,
    /// Index of the block the next request will fetch.
    pub(crate) current_block: u32,
    /// Byte length of the block currently requested.
    pub(crate) block_length: u32,
    /// Single-flight flag.
    pub(crate) in_flight: bool,
    pub(crate) state: TransferState,
    /// Id of the outstanding request, if any.
    pub(crate) request: Option<u64>,
    /// Body of the current response once validated.
    pub(crate) payload: Option<Vec<u8>>,
    /// Reason recorded when the current request went fatal.
    pub(crate) failure: Option<EngineError>,
}

impl<Conn> Default for DownloadSession<Conn> {
    fn default() -> Self {
        Self {
            connection: None,
            target: None,
            total_size: 0,
            num_blocks: 0,
            block_size: 0,
            current_block: 0,
            block_length: 0,
            in_flight: false,
            state: TransferState::Ready,
            request: None,
            payload: None,
            failure: None,
        }
    }
}

impl<Conn> DownloadSession<Conn> {
    /// Installs a freshly connected and probed transfer.
    pub(crate) fn begin(
        connection: Conn,
        target: Target,
        total_size: u64,
        num_blocks: u32,
        block_size: u32,
        first_block: u32,
    ) -> Self {
        Self {
            connection: Some(Arc::new(connection)),
            target: Some(target),
            total_size,
            num_blocks,
            block_size,
            current_block: first_block,
            ..Self::default()
        }
    }

    /// Drops the connection after a fatal failure, keeping the state
    /// observable until the next start or reset.
    pub(crate) fn teardown(&mut self) {
        *self = Self {
            state: self.state,
            ..Self::default()
        };
    }

    /// Records a fatal failure. The first one wins.
    pub(crate) fn fail(&mut self, err: EngineError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
        self.state = TransferState::Fatal;
        self.payload = None;
    }

    /// Moves to a recoverable restart state unless something more severe
    /// was already recorded.
    pub(crate) fn escalate(&mut self, state: TransferState) {
        let rank = |s: TransferState| match s {
            TransferState::Fatal => 3,
            TransferState::NeedsFreshAuthorization => 2,
            TransferState::NeedsReconnect => 1,
            TransferState::Ready | TransferState::RequestInFlight => 0,
        };
        if rank(state) > rank(self.state) {
            self.state = state;
            self.payload = None;
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            next_block: self.current_block,
            in_flight: self.in_flight,
            block_length: self.block_length,
            num_blocks: self.num_blocks,
            host: self.target.as_ref().map(|t| t.host().to_string()),
        }
    }
}

/// Read-only view of the session for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: TransferState,
    /// Index the next request will fetch.
    pub next_block: u32,
    pub in_flight: bool,
    /// Length of the most recently requested block.
    pub block_length: u32,
    pub num_blocks: u32,
    /// Host of the connected store, `None` when no transfer is active.
    pub host: Option<String>,
}
