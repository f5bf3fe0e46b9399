//! Scripted in-memory object store for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use otafetch_transport::{
    ConnectError, Connection, Connector, Credentials, ResponseBody, ResponseHead, Target,
    TransportError,
};

/// A scripted deviation from the normal 206 answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Script {
    /// Answer with this status and no body.
    Status(u16),
    /// Answer 403 and announce `Connection: close`.
    ForbiddenClose,
    /// Normal answer plus `Connection: close`.
    Close,
    /// Normal body but a `Content-Length` one byte short.
    WrongLength,
    /// Correct head, but the body carries one byte too many.
    LongBody,
    /// The peer resets the connection before answering.
    Drop,
    /// The request cannot be built.
    SetupFail,
    /// Transient failure that is not a close.
    Timeout,
    /// Never answers.
    Hang,
}

#[derive(Default)]
struct Inner {
    data: Vec<u8>,
    reported_size: Mutex<Option<u64>>,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    log: Mutex<Vec<String>>,
    fail_reconnect: AtomicBool,
    fail_connect: AtomicBool,
}

/// Serves `data` by range and records everything it is asked to do.
#[derive(Clone)]
pub(crate) struct MockConnector {
    inner: Arc<Inner>,
}

impl MockConnector {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Inner {
                data,
                ..Inner::default()
            }),
        }
    }

    /// An object of `len` bytes where byte `i` is `i % 251`.
    pub(crate) fn patterned(len: usize) -> Self {
        Self::new((0..len).map(|i| (i % 251) as u8).collect())
    }

    /// Makes the `Content-Range` total disagree with the data length.
    pub(crate) fn report_size(&self, size: u64) {
        *self.inner.reported_size.lock().unwrap() = Some(size);
    }

    /// Queues `script` for the next request carrying `range`.
    pub(crate) fn script(&self, range: &str, script: Script) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .entry(range.to_string())
            .or_default()
            .push_back(script);
    }

    pub(crate) fn fail_reconnect(&self, fail: bool) {
        self.inner.fail_reconnect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_connect(&self, fail: bool) {
        self.inner.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Everything that happened, in order: `connect`, `reconnect`, and one
    /// entry per request holding its `Range` value.
    pub(crate) fn log(&self) -> Vec<String> {
        self.inner.log.lock().unwrap().clone()
    }

    /// Only the `Range` values requested, in order.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|entry| entry.starts_with("bytes="))
            .collect()
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.inner.data
    }

    fn record(&self, entry: &str) {
        self.inner.log.lock().unwrap().push(entry.to_string());
    }
}

impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(
        &self,
        _target: &Target,
        credentials: &Credentials,
    ) -> Result<MockConnection, ConnectError> {
        credentials.validate()?;
        self.record("connect");
        if self.inner.fail_connect.load(Ordering::SeqCst) {
            return Err(ConnectError::Timeout);
        }
        Ok(MockConnection { store: self.clone() })
    }
}

pub(crate) struct MockConnection {
    store: MockConnector,
}

impl MockConnection {
    fn answer(&self, range: &str) -> (ResponseHead, MockBody) {
        let data = self.store.data();
        let total = self
            .store
            .inner
            .reported_size
            .lock()
            .unwrap()
            .unwrap_or(data.len() as u64);

        let Some((start, end)) = parse_range(range) else {
            return (
                ResponseHead {
                    status: 416,
                    ..ResponseHead::default()
                },
                MockBody(Vec::new()),
            );
        };
        let end = end.min(data.len().saturating_sub(1));
        let body = data.get(start..=end).unwrap_or_default().to_vec();
        (
            ResponseHead {
                status: 206,
                content_length: Some(body.len() as u64),
                content_range: Some(format!("bytes {start}-{end}/{total}")),
                connection: None,
            },
            MockBody(body),
        )
    }
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

impl Connection for MockConnection {
    type Body = MockBody;

    async fn get_range(&self, range: &str) -> Result<(ResponseHead, MockBody), TransportError> {
        self.store.record(range);
        let script = self
            .store
            .inner
            .scripts
            .lock()
            .unwrap()
            .get_mut(range)
            .and_then(|queue| queue.pop_front());

        let (mut head, mut body) = self.answer(range);
        match script {
            None => {}
            Some(Script::Status(status)) => {
                return Ok((
                    ResponseHead {
                        status,
                        ..ResponseHead::default()
                    },
                    MockBody(Vec::new()),
                ));
            }
            Some(Script::ForbiddenClose) => {
                return Ok((
                    ResponseHead {
                        status: 403,
                        connection: Some("close".into()),
                        ..ResponseHead::default()
                    },
                    MockBody(Vec::new()),
                ));
            }
            Some(Script::Close) => head.connection = Some("close".into()),
            Some(Script::WrongLength) => {
                head.content_length = head.content_length.map(|n| n - 1);
            }
            Some(Script::LongBody) => body.0.push(0),
            Some(Script::Drop) => {
                return Err(TransportError::Closed("connection reset by peer".into()));
            }
            Some(Script::SetupFail) => {
                return Err(TransportError::Setup("no room for header".into()));
            }
            Some(Script::Timeout) => return Err(TransportError::Timeout),
            Some(Script::Hang) => return std::future::pending().await,
        }
        Ok((head, body))
    }

    async fn reconnect(&self) -> Result<(), ConnectError> {
        self.store.record("reconnect");
        if self.store.inner.fail_reconnect.load(Ordering::SeqCst) {
            return Err(ConnectError::Unreachable {
                authority: "mock:443".into(),
                reason: "refused".into(),
            });
        }
        Ok(())
    }
}

pub(crate) struct MockBody(Vec<u8>);

impl ResponseBody for MockBody {
    async fn read_bounded(self, limit: usize) -> Result<Vec<u8>, TransportError> {
        if self.0.len() > limit {
            return Err(TransportError::BodyTooLarge { limit });
        }
        Ok(self.0)
    }
}
