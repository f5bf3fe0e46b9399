//! Response handling: one transition per network callback.

use otafetch_protocol::{StatusClass, TransferState, classify_status, connection_will_close};
use otafetch_transport::{Connection, Connector, ResponseBody, ResponseHead, TransportError};
use tracing::{debug, error, info, warn};

use crate::delivery::CompletedBlock;
use crate::engine::{BodyOf, Engine, clear_token};
use crate::error::EngineError;
use crate::events::{EngineEvent, NetEvent};

impl<C: Connector> Engine<C> {
    pub(crate) async fn on_net_event(&mut self, event: NetEvent<BodyOf<C>>) {
        let request = event.request();
        if self.session.request != Some(request) || self.active_token().is_none() {
            debug!(request, kind = event.kind(), "discarding stale network event");
            return;
        }
        debug!(
            request,
            kind = event.kind(),
            block = self.session.current_block,
            "network event"
        );

        match event {
            NetEvent::SetupFailed { reason, .. } => self.on_setup_failed(reason),
            NetEvent::ResponseReady { head, body, .. } => self.on_response_ready(head, body).await,
            NetEvent::ConnectionClosed { reason, .. } => self.on_connection_closed(&reason).await,
            NetEvent::TransportFailed { error, .. } => self.on_transport_failed(&error),
            NetEvent::ResponseComplete { .. } => self.on_response_complete(),
        }
    }

    fn on_setup_failed(&mut self, reason: String) {
        error!(block = self.session.current_block, %reason, "request setup failed");
        self.session.fail(EngineError::Setup(reason));
    }

    async fn on_response_ready(&mut self, head: ResponseHead, body: BodyOf<C>) {
        let block = self.session.current_block;
        match classify_status(head.status) {
            StatusClass::PartialContent => {}
            // Checked before anything else, so a 403 that also announces
            // a close is still reported as an expired grant.
            StatusClass::AuthorizationDenied => {
                warn!(block, "object store denied access, grant expired");
                self.session
                    .escalate(TransferState::NeedsFreshAuthorization);
                return;
            }
            StatusClass::Unexpected(status) => {
                self.session.fail(EngineError::UnexpectedStatus(status));
                return;
            }
        }

        let expected = u64::from(self.session.block_length);
        match head.content_length {
            None | Some(0) => {
                self.session.fail(EngineError::MissingContentLength);
                return;
            }
            Some(actual) if actual != expected => {
                self.session
                    .fail(EngineError::LengthMismatch { expected, actual });
                return;
            }
            Some(_) => {}
        }

        let Some(cancel) = self.active_token() else {
            return;
        };
        let limit = self.config.block_size as usize;
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            read = tokio::time::timeout(self.config.request_timeout, body.read_bounded(limit)) => read,
        };

        match read {
            Ok(Ok(payload)) if payload.len() as u64 == expected => {
                self.session.payload = Some(payload);
            }
            Ok(Ok(payload)) => {
                self.session.fail(EngineError::LengthMismatch {
                    expected,
                    actual: payload.len() as u64,
                });
                return;
            }
            Ok(Err(e)) if e.is_connection_closed() => {
                self.on_connection_closed(&e.to_string()).await;
                return;
            }
            Ok(Err(e @ TransportError::BodyTooLarge { .. })) => {
                self.session.fail(EngineError::Body(e));
                return;
            }
            Ok(Err(e)) => {
                self.on_transport_failed(&e);
                return;
            }
            Err(_) => {
                self.on_transport_failed(&TransportError::Timeout);
                return;
            }
        }

        if connection_will_close(head.connection.as_deref()) {
            debug!(block, "peer will close the connection, reconnecting ahead of next block");
            self.reconnect().await;
        }
    }

    async fn on_connection_closed(&mut self, reason: &str) {
        warn!(block = self.session.current_block, reason, "connection closed by peer");
        self.reconnect().await;
    }

    fn on_transport_failed(&mut self, error: &TransportError) {
        warn!(block = self.session.current_block, %error, "block request failed");
        self.session.escalate(TransferState::NeedsReconnect);
    }

    /// Re-establishes the connection in place. Failure leaves the session
    /// needing a full restart.
    async fn reconnect(&mut self) {
        let Some(connection) = self.session.connection.clone() else {
            return;
        };
        match connection.reconnect().await {
            Ok(()) => {
                self.stats.record_reconnect();
                info!(block = self.session.current_block, "reconnected");
            }
            Err(e) => {
                warn!(error = %e, "reconnect failed");
                self.session.escalate(TransferState::NeedsReconnect);
            }
        }
    }

    fn on_response_complete(&mut self) {
        clear_token(&self.inflight_cancel);
        let block = self.session.current_block;
        self.session.in_flight = false;
        self.session.request = None;

        if let Some(err) = self.session.failure.take() {
            error!(block, error = %err, "block transfer failed");
            self.session.teardown();
            self.emit_control(EngineEvent::Fatal(err));
            return;
        }

        let restart = match self.session.state {
            TransferState::NeedsReconnect => Some(EngineEvent::ReconnectRequired),
            TransferState::NeedsFreshAuthorization => Some(EngineEvent::AuthorizationExpired),
            _ => None,
        };
        if let Some(event) = restart {
            warn!(block, state = %self.session.state, "transfer must be restarted");
            self.emit_control(event);
            return;
        }

        match self.session.payload.take() {
            Some(payload) => {
                self.sink.deliver(CompletedBlock {
                    index: block,
                    length: self.session.block_length,
                    payload,
                });
                self.session.current_block += 1;
                if self.session.current_block == self.session.num_blocks {
                    info!(num_blocks = self.session.num_blocks, "all blocks fetched");
                }
            }
            None => {
                // Connection dropped and came back before any body arrived.
                warn!(block, "request finished without a body, block will be requested again");
            }
        }
        self.session.state = TransferState::Ready;
    }
}
