//! Wire-level types shared by the otafetch transport and transfer engine.
//!
//! Everything here is pure: block arithmetic, `Range` / `Content-Range`
//! header handling, and the small state and view types exchanged with the
//! update orchestrator.

pub mod constants;
pub mod range;
pub mod types;

pub use constants::MAX_BLOCK_SIZE;
pub use range::{
    BlockRange, ProtocolError, block_count, connection_will_close, format_range_header,
    parse_content_range_total,
};
pub use types::{OrchestratorView, StatusClass, TransferState, classify_status};
