use std::time::Duration;

/// Largest block the engine will ever request, in bytes.
///
/// Bounds every `Range` request and every receive buffer. Transfers may use
/// a smaller block size but never a larger one.
pub const MAX_BLOCK_SIZE: u32 = 4096;

/// Default port for `https` locators.
pub const HTTPS_PORT: u16 = 443;

/// Default port for `http` locators.
pub const HTTP_PORT: u16 = 80;

/// `Range` value used by the one-shot size probe.
pub const PROBE_RANGE: &str = "bytes=0-0";

/// Upper bound on the synchronous size probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Time allowed for a single block request, headers and body included.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed to (re-)establish the connection to the object store.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP 206 Partial Content.
pub const STATUS_PARTIAL_CONTENT: u16 = 206;

/// HTTP 403 Forbidden. The object store's only signal that a time-limited
/// access grant has expired.
pub const STATUS_FORBIDDEN: u16 = 403;

/// Longest `Range` value we ever emit: `bytes=` plus two `u64` decimals and
/// the separating dash.
pub const RANGE_HEADER_MAX_LEN: usize = "bytes=".len() + 2 * U64_MAX_DIGITS + 1;

/// Longest `Connection` value inspected. Longer values are treated as
/// "not close".
pub const CONNECTION_VALUE_MAX_LEN: usize = "keep-alive".len();

const U64_MAX_DIGITS: usize = 20;
