//! Error types for the transport.

/// Errors raised while establishing or re-establishing a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid locator: {0}")]
    InvalidLocator(String),

    #[error("invalid credentials: {0}")]
    Credentials(String),

    #[error("failed to build HTTPS client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("failed to reach {authority}: {reason}")]
    Unreachable { authority: String, reason: String },

    /// TCP reached the peer but the secure session could not be set up:
    /// bad certificate, untrusted CA, or a peer that does not speak TLS.
    #[error("secure handshake with {authority} failed: {reason}")]
    Handshake { authority: String, reason: String },

    #[error("connection attempt timed out")]
    Timeout,
}

/// Errors raised by a single ranged request.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request could not be prepared; nothing was sent.
    #[error("request setup failed: {0}")]
    Setup(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("request timed out")]
    Timeout,

    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TransportError {
    /// Classifies a `reqwest` failure.
    pub(crate) fn from_send(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() || err.is_request() {
            Self::Closed(err.to_string())
        } else {
            Self::Http(err)
        }
    }

    /// Returns `true` if the peer tore the connection down.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}
