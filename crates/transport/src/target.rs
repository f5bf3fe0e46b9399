//! Locator resolution and connection credentials.

use otafetch_protocol::constants::{HTTP_PORT, HTTPS_PORT};
use reqwest::Url;

use crate::error::ConnectError;

/// A source locator resolved into the pieces a connection needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    url: Url,
    host: String,
    port: u16,
    path: String,
}

impl Target {
    /// Resolves `locator` into host, port, and resource path.
    ///
    /// The path keeps the query string: pre-signed grants live there.
    pub fn resolve(locator: &str) -> Result<Self, ConnectError> {
        let url = Url::parse(locator)
            .map_err(|e| ConnectError::InvalidLocator(format!("{e}: {locator}")))?;

        let default_port = match url.scheme() {
            "https" => HTTPS_PORT,
            "http" => HTTP_PORT,
            other => {
                return Err(ConnectError::InvalidLocator(format!(
                    "unsupported scheme {other:?}"
                )));
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConnectError::InvalidLocator("locator has no host".into()))?
            .to_string();
        let port = url.port().unwrap_or(default_port);

        let path = match url.query() {
            Some(q) => format!("{}?{q}", url.path()),
            None => url.path().to_string(),
        };

        Ok(Self {
            url,
            host,
            port,
            path,
        })
    }

    /// Full URL requests are sent to.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resource path including any query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "https"
    }
}

/// Trust material for the secure connection.
#[derive(Clone, Default)]
pub struct Credentials {
    /// PEM root CA. Replaces the built-in roots when set.
    pub root_ca_pem: Option<Vec<u8>>,
    /// PEM client certificate for mutual TLS.
    pub client_cert_pem: Option<Vec<u8>>,
    /// PEM private key matching `client_cert_pem`.
    pub client_key_pem: Option<Vec<u8>>,
}

impl Credentials {
    /// Checks that the client certificate and key come as a pair.
    pub fn validate(&self) -> Result<(), ConnectError> {
        match (&self.client_cert_pem, &self.client_key_pem) {
            (Some(_), None) => Err(ConnectError::Credentials(
                "client certificate given without a private key".into(),
            )),
            (None, Some(_)) => Err(ConnectError::Credentials(
                "private key given without a client certificate".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Certificate followed by key, the shape `reqwest::Identity` expects.
    pub(crate) fn identity_pem(&self) -> Option<Vec<u8>> {
        let cert = self.client_cert_pem.as_ref()?;
        let key = self.client_key_pem.as_ref()?;
        let mut pem = Vec::with_capacity(cert.len() + key.len() + 1);
        pem.extend_from_slice(cert);
        if !cert.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(key);
        Some(pem)
    }
}

// Key material must never end up in logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("root_ca", &self.root_ca_pem.is_some())
            .field("client_cert", &self.client_cert_pem.is_some())
            .field("client_key", &self.client_key_pem.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
