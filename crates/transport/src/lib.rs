//! Connection management and ranged GET transport.
//!
//! The transfer engine talks to the object store only through the
//! [`Connector`], [`Connection`] and [`ResponseBody`] traits defined here.
//! [`HttpsConnector`] is the production binding on top of `reqwest` with
//! rustls; tests substitute scripted in-memory implementations.

pub mod error;
pub mod https;
pub mod target;

use std::future::Future;

pub use error::{ConnectError, TransportError};
pub use https::{HttpsBody, HttpsConnection, HttpsConnector};
pub use target::{Credentials, Target};

/// Response status line and the headers the engine cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    /// Parsed `Content-Length`, `None` if absent or malformed.
    pub content_length: Option<u64>,
    /// Raw `Content-Range` value.
    pub content_range: Option<String>,
    /// Raw `Connection` value.
    pub connection: Option<String>,
}

/// Establishes connections to a resolved [`Target`].
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    /// Opens a secure connection using the supplied trust material.
    fn connect(
        &self,
        target: &Target,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Self::Connection, ConnectError>> + Send;
}

/// A live connection to the object store.
pub trait Connection: Send + Sync + 'static {
    type Body: ResponseBody;

    /// Sends a GET for the target resource carrying `range` as its `Range`
    /// header. Resolves once the response head has arrived.
    fn get_range(
        &self,
        range: &str,
    ) -> impl Future<Output = Result<(ResponseHead, Self::Body), TransportError>> + Send;

    /// Tears down and re-establishes the connection in place.
    ///
    /// Takes `&self` so it can run while a request task still holds the
    /// connection.
    fn reconnect(&self) -> impl Future<Output = Result<(), ConnectError>> + Send;
}

/// The not-yet-read body of a response.
pub trait ResponseBody: Send + 'static {
    /// Reads the whole body, failing if it exceeds `limit` bytes.
    fn read_bounded(
        self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}
