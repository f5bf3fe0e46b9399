//! HTTPS binding over `reqwest` with rustls.
//!
//! `reqwest` pools connections lazily, so "connecting" here means building
//! a client from the trust material, proving the authority accepts TCP, and
//! completing one `HEAD` exchange so the TLS handshake and certificate
//! checks run before any block is requested. Reconnecting swaps in a freshly
//! built client, which drops whatever pooled socket the peer announced it
//! would close.

use std::sync::RwLock;
use std::time::Duration;

use otafetch_protocol::constants::CONNECT_TIMEOUT;
use reqwest::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, HeaderName, HeaderValue, RANGE,
};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{ConnectError, TransportError};
use crate::target::{Credentials, Target};
use crate::{Connection, Connector, ResponseBody, ResponseHead};

/// Production [`Connector`].
#[derive(Debug, Clone)]
pub struct HttpsConnector {
    connect_timeout: Duration,
}

impl HttpsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for HttpsConnector {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

impl Connector for HttpsConnector {
    type Connection = HttpsConnection;

    async fn connect(
        &self,
        target: &Target,
        credentials: &Credentials,
    ) -> Result<HttpsConnection, ConnectError> {
        credentials.validate()?;
        let client = build_client(target, credentials, self.connect_timeout).await?;
        info!(authority = %target.authority(), "connected to object store");

        Ok(HttpsConnection {
            target: target.clone(),
            credentials: credentials.clone(),
            connect_timeout: self.connect_timeout,
            client: RwLock::new(client),
        })
    }
}

/// A connection to one object-store authority.
pub struct HttpsConnection {
    target: Target,
    credentials: Credentials,
    connect_timeout: Duration,
    client: RwLock<reqwest::Client>,
}

impl HttpsConnection {
    pub fn target(&self) -> &Target {
        &self.target
    }

    fn client(&self) -> reqwest::Client {
        // reqwest::Client is a cheap handle; never hold the lock across await.
        match self.client.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Connection for HttpsConnection {
    type Body = HttpsBody;

    async fn get_range(&self, range: &str) -> Result<(ResponseHead, HttpsBody), TransportError> {
        let value = HeaderValue::from_str(range)
            .map_err(|e| TransportError::Setup(format!("invalid Range value {range:?}: {e}")))?;

        let response = self
            .client()
            .get(self.target.url().clone())
            .header(RANGE, value)
            .send()
            .await
            .map_err(TransportError::from_send)?;

        let head = head_from_headers(response.status().as_u16(), response.headers());
        debug!(
            status = head.status,
            content_length = ?head.content_length,
            range,
            "response head received"
        );
        Ok((head, HttpsBody(response)))
    }

    async fn reconnect(&self) -> Result<(), ConnectError> {
        let client = build_client(&self.target, &self.credentials, self.connect_timeout).await?;
        match self.client.write() {
            Ok(mut guard) => *guard = client,
            Err(poisoned) => *poisoned.into_inner() = client,
        }
        info!(authority = %self.target.authority(), "reconnected to object store");
        Ok(())
    }
}

/// Streaming body of an HTTPS response.
pub struct HttpsBody(reqwest::Response);

impl ResponseBody for HttpsBody {
    async fn read_bounded(self, limit: usize) -> Result<Vec<u8>, TransportError> {
        let mut response = self.0;
        let mut body = Vec::with_capacity(limit);
        while let Some(chunk) = response.chunk().await.map_err(TransportError::from_send)? {
            if body.len() + chunk.len() > limit {
                return Err(TransportError::BodyTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Builds a client for `target` and checks the authority accepts TCP.
async fn build_client(
    target: &Target,
    credentials: &Credentials,
    connect_timeout: Duration,
) -> Result<reqwest::Client, ConnectError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(1);

    if let Some(ca) = &credentials.root_ca_pem {
        let cert = reqwest::Certificate::from_pem(ca)
            .map_err(|e| ConnectError::Credentials(format!("root CA: {e}")))?;
        builder = builder
            .tls_built_in_root_certs(false)
            .add_root_certificate(cert);
    }
    if let Some(pem) = credentials.identity_pem() {
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| ConnectError::Credentials(format!("client identity: {e}")))?;
        builder = builder.identity(identity);
    }

    let client = builder.build()?;
    check_reachable(target, connect_timeout).await?;
    handshake(&client, target, connect_timeout).await?;
    Ok(client)
}

async fn check_reachable(target: &Target, connect_timeout: Duration) -> Result<(), ConnectError> {
    let authority = target.authority();
    match tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((target.host(), target.port())),
    )
    .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(ConnectError::Unreachable {
            authority,
            reason: e.to_string(),
        }),
        Err(_) => Err(ConnectError::Timeout),
    }
}

/// Any HTTP status proves the secure session; a pre-signed grant for `GET`
/// is allowed to refuse the `HEAD`. The socket stays pooled for the first
/// range request.
async fn handshake(
    client: &reqwest::Client,
    target: &Target,
    timeout: Duration,
) -> Result<(), ConnectError> {
    match client
        .head(target.url().clone())
        .timeout(timeout)
        .send()
        .await
    {
        Ok(response) => {
            debug!(status = response.status().as_u16(), "handshake complete");
            Ok(())
        }
        Err(e) if e.is_timeout() => Err(ConnectError::Timeout),
        // TCP was reachable a moment ago, so a connector failure is TLS.
        Err(e) if e.is_connect() => Err(ConnectError::Handshake {
            authority: target.authority(),
            reason: error_chain(&e),
        }),
        Err(e) => Err(ConnectError::Unreachable {
            authority: target.authority(),
            reason: error_chain(&e),
        }),
    }
}

/// `reqwest` keeps the interesting part (the rustls alert) in the sources.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut reason = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        reason.push_str(": ");
        reason.push_str(&cause.to_string());
        source = cause.source();
    }
    reason
}

fn head_from_headers(status: u16, headers: &HeaderMap) -> ResponseHead {
    ResponseHead {
        status,
        content_length: header_text(headers, CONTENT_LENGTH).and_then(|v| v.parse().ok()),
        content_range: header_text(headers, CONTENT_RANGE),
        connection: header_text(headers, CONNECTION),
    }
}

fn header_text(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}
