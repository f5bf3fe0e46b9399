//! Chunked block-transfer engine.
//!
//! Turns one large download into a strictly ordered sequence of ranged
//! requests, one outstanding at a time, and hands each validated block to
//! the orchestrator through a bounded buffer pool.
//!
//! The engine runs as a single task that owns the download session.
//! Orchestrator calls arrive through an [`EngineHandle`]
//! as commands; network callbacks arrive from per-request tasks as tagged
//! events. Both are consumed by the same loop, so every state transition
//! is linearized without locks around session fields.

mod delivery;
mod engine;
mod error;
mod events;
mod probe;
mod response;
mod scheduler;
mod session;

#[cfg(test)]
mod mock;

use std::time::Duration;

use otafetch_protocol::MAX_BLOCK_SIZE;
use otafetch_protocol::constants::{PROBE_TIMEOUT, REQUEST_TIMEOUT};

pub use delivery::{
    BlockPool, CompletedBlock, DeliveryOutcome, DeliverySink, DropReason, EngineStats,
    PooledBuffer, TransferStats,
};
pub use engine::EngineHandle;
pub use error::{EngineError, ProbeError, ScheduleError, StartError};
pub use events::EngineEvent;
pub use probe::probe_size;
pub use scheduler::Dispatch;
pub use session::SessionSnapshot;

/// Default depth of the orchestrator event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 32;

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes per block. At most [`MAX_BLOCK_SIZE`].
    pub block_size: u32,
    /// Upper bound on the size probe at transfer start.
    pub probe_timeout: Duration,
    /// Upper bound on one block request, and separately on reading its body.
    pub request_timeout: Duration,
    /// Depth of the orchestrator event channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: MAX_BLOCK_SIZE,
            probe_timeout: PROBE_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Checks the configuration against the fixed limits and `pool`.
    pub fn validate(&self, pool: &BlockPool) -> Result<(), EngineError> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(EngineError::InvalidConfig(format!(
                "block size {} outside 1..={MAX_BLOCK_SIZE}",
                self.block_size
            )));
        }
        if pool.slot_size() < self.block_size as usize {
            return Err(EngineError::InvalidConfig(format!(
                "pool slots hold {} bytes, blocks need {}",
                pool.slot_size(),
                self.block_size
            )));
        }
        if self.event_capacity <= delivery::CONTROL_HEADROOM {
            return Err(EngineError::InvalidConfig(format!(
                "event capacity {} leaves no room for blocks",
                self.event_capacity
            )));
        }
        Ok(())
    }
}
