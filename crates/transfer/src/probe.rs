//! One-shot size probe.

use std::time::Duration;

use otafetch_protocol::constants::{PROBE_RANGE, STATUS_PARTIAL_CONTENT};
use otafetch_protocol::parse_content_range_total;
use otafetch_transport::{Connection, ResponseBody};
use tracing::{debug, info};

use crate::error::ProbeError;

/// Learns the total object size with a `bytes=0-0` request.
///
/// Bounded by `timeout`; a store that never answers fails the probe rather
/// than stalling transfer start.
pub async fn probe_size<C: Connection>(conn: &C, timeout: Duration) -> Result<u64, ProbeError> {
    let probe = async {
        let (head, body) = conn.get_range(PROBE_RANGE).await?;
        debug!(status = head.status, content_range = ?head.content_range, "probe answered");
        if head.status != STATUS_PARTIAL_CONTENT {
            return Err(ProbeError::UnexpectedStatus(head.status));
        }
        let value = head
            .content_range
            .as_deref()
            .ok_or(ProbeError::MissingContentRange)?;
        let total = parse_content_range_total(value)?;

        // The size is already known. A failed drain only costs the pooled
        // socket, which the transport replaces on the next request.
        if let Err(e) = body.read_bounded(1).await {
            debug!(error = %e, "probe body not drained");
        }
        Ok::<_, ProbeError>(total)
    };

    let total = tokio::time::timeout(timeout, probe)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;
    info!(total, "remote object size probed");
    Ok(total)
}
