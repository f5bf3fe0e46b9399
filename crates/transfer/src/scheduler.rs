//! Block scheduling: range computation, single-flight, dispatch.

use std::sync::Arc;
use std::time::Duration;

use otafetch_protocol::{BlockRange, TransferState, format_range_header};
use otafetch_transport::{Connection, Connector, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::{Engine, install_token};
use crate::error::ScheduleError;
use crate::events::NetEvent;

/// Result of asking for the next block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A request for this range is now outstanding.
    Sent(BlockRange),
    /// A request is already outstanding. Nothing was sent.
    InFlight,
    /// The current index is past the last block.
    Complete,
}

impl<C: Connector> Engine<C> {
    pub(crate) fn request_next_block(&mut self) -> Result<Dispatch, ScheduleError> {
        let block = self.session.current_block;
        if self.session.in_flight {
            debug!(block, "block request already in flight");
            return Ok(Dispatch::InFlight);
        }
        if self.session.state != TransferState::Ready {
            return Err(ScheduleError::NotReady(self.session.state));
        }
        let Some(connection) = self.session.connection.clone() else {
            return Err(ScheduleError::NotStarted);
        };
        let Some(range) =
            BlockRange::for_block(block, self.session.block_size, self.session.total_size)
        else {
            debug!(block, num_blocks = self.session.num_blocks, "no blocks left");
            return Ok(Dispatch::Complete);
        };
        let header = format_range_header(&range).inspect_err(|e| {
            error!(block, error = %e, "cannot build block request");
        })?;

        self.next_request += 1;
        let request = self.next_request;
        let cancel = CancellationToken::new();
        install_token(&self.inflight_cancel, cancel.clone());

        let session = &mut self.session;
        session.block_length = range.length;
        session.in_flight = true;
        session.state = TransferState::RequestInFlight;
        session.request = Some(request);
        session.payload = None;
        session.failure = None;

        info!(block, request, range = %header, "block requested");
        tokio::spawn(run_request(
            connection,
            header,
            request,
            self.net_tx.clone(),
            cancel,
            self.config.request_timeout,
        ));
        self.stats.record_requested();
        Ok(Dispatch::Sent(range))
    }

    /// Points the scheduler at `index` so a dropped block can be fetched again.
    pub(crate) fn set_next_block(&mut self, index: u32) -> Result<(), ScheduleError> {
        if self.session.in_flight || self.session.state != TransferState::Ready {
            return Err(ScheduleError::NotReady(self.session.state));
        }
        if self.session.connection.is_none() {
            return Err(ScheduleError::NotStarted);
        }
        if index >= self.session.num_blocks {
            return Err(ScheduleError::BlockOutOfRange {
                index,
                num_blocks: self.session.num_blocks,
            });
        }
        debug!(from = self.session.current_block, to = index, "next block moved");
        self.session.current_block = index;
        Ok(())
    }
}

/// Sends one ranged request and reports back to the engine task.
///
/// Every outcome is followed by a `ResponseComplete` for the same request,
/// unless the request was cancelled.
async fn run_request<Conn: Connection>(
    connection: Arc<Conn>,
    header: String,
    request: u64,
    net: mpsc::Sender<NetEvent<Conn::Body>>,
    cancel: CancellationToken,
    timeout: Duration,
) {
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(request, "block request cancelled");
            return;
        }
        outcome = tokio::time::timeout(timeout, connection.get_range(&header)) => outcome,
    };

    let event = match outcome {
        Ok(Ok((head, body))) => NetEvent::ResponseReady {
            request,
            head,
            body,
        },
        Ok(Err(TransportError::Setup(reason))) => NetEvent::SetupFailed { request, reason },
        Ok(Err(error)) if error.is_connection_closed() => NetEvent::ConnectionClosed {
            request,
            reason: error.to_string(),
        },
        Ok(Err(error)) => NetEvent::TransportFailed { request, error },
        Err(_) => NetEvent::TransportFailed {
            request,
            error: TransportError::Timeout,
        },
    };

    // A closed channel means the engine task is gone.
    if net.send(event).await.is_ok() {
        let _ = net.send(NetEvent::ResponseComplete { request }).await;
    }
}
