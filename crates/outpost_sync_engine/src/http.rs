//! HTTP transport.
//!
//! Each request is a CBOR-encoded [`SyncMessage`] posted to a session-scoped
//! route under `{base_url}/sync`:
//!
//! | Message          | Route                          |
//! |------------------|--------------------------------|
//! | `StartSession`   | `/sync`                        |
//! | `AdvanceSession` | `/sync/{session}/advance`      |
//! | `Push`           | `/sync/{session}/push`         |
//! | `InitiatePull`   | `/sync/{session}/pull/initiate`|
//! | `Pull`           | `/sync/{session}/pull`         |
//! | `EndSession`     | `/sync/{session}/end`          |
//! | `AbortSession`   | `/sync/{session}/abort`        |
//!
//! The client library is pluggable through [`HttpClient`]. Every request
//! carries the configured timeout; the client enforces it.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use outpost_sync_protocol::SyncMessage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Consecutive unreachable-host failures before the transport goes offline.
pub const DEFAULT_OFFLINE_AFTER: u32 = 3;

/// Request timeout used unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Status and body of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A response with the given status.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    /// A `200 OK` response.
    pub fn ok(body: Vec<u8>) -> Self {
        Self::new(200, body)
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Statuses worth retrying: timeouts, throttling and server-side faults.
    fn is_retryable(&self) -> bool {
        matches!(self.status, 408 | 429) || self.status >= 500
    }
}

/// Why an exchange produced no answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpFailure {
    /// The host could not be reached.
    Unreachable(String),
    /// No answer arrived within the timeout.
    TimedOut,
}

/// Carries bytes to the authority.
pub trait HttpClient: Send + Sync {
    /// POSTs `body` to `url`, giving up after `timeout`.
    ///
    /// `Err` means no answer arrived; any answer, including an error status,
    /// is `Ok`.
    fn post(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<HttpResponse, HttpFailure>;
}

/// Sync transport over HTTP.
pub struct HttpTransport<C: HttpClient> {
    base_url: String,
    client: C,
    timeout: Duration,
    offline_after: u32,
    failures: AtomicU32,
    closed: AtomicBool,
    last_failure: Mutex<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            offline_after: DEFAULT_OFFLINE_AFTER,
            failures: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            last_failure: Mutex::new(None),
        }
    }

    /// Creates a transport for the configured authority URL and timeout.
    pub fn from_config(config: &SyncConfig, client: C) -> Self {
        Self::new(config.server_url.clone(), client).with_timeout(config.timeout)
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets how many consecutive unreachable-host failures take the transport offline.
    pub fn with_offline_after(mut self, failures: u32) -> Self {
        self.offline_after = failures.max(1);
        self
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Description of the most recent failed exchange, cleared on success.
    pub fn last_failure(&self) -> Option<String> {
        self.last_failure.lock().clone()
    }

    /// Brings an offline or closed transport back.
    pub fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        *self.last_failure.lock() = None;
    }

    /// Full URL for a request message.
    pub fn url_for(&self, message: &SyncMessage) -> SyncResult<String> {
        Ok(format!("{}{}", self.base_url, route(message)?))
    }

    fn fail(&self, url: &str, reason: String, retryable: bool) -> SyncError {
        warn!(url = %url, reason = %reason, retryable, "sync request failed");
        *self.last_failure.lock() = Some(reason.clone());
        if retryable {
            SyncError::transport_retryable(reason)
        } else {
            SyncError::transport_fatal(reason)
        }
    }
}

fn route(message: &SyncMessage) -> SyncResult<String> {
    let path = match message {
        SyncMessage::StartSession(_) => "/sync".to_owned(),
        SyncMessage::AdvanceSession(r) => format!("/sync/{}/advance", r.session_id),
        SyncMessage::Push(r) => format!("/sync/{}/push", r.session_id),
        SyncMessage::InitiatePull(r) => format!("/sync/{}/pull/initiate", r.session_id),
        SyncMessage::Pull(r) => format!("/sync/{}/pull", r.session_id),
        SyncMessage::EndSession(r) => format!("/sync/{}/end", r.session_id),
        SyncMessage::AbortSession(r) => format!("/sync/{}/abort", r.session_id),
        other => return Err(other.unexpected("a request message").into()),
    };
    Ok(path)
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    fn send(&self, request: SyncMessage) -> SyncResult<SyncMessage> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let url = self.url_for(&request)?;
        let body = request.encode()?;

        let response = match self.client.post(&url, body, self.timeout) {
            Ok(response) => response,
            Err(failure) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.offline_after {
                    debug!(url = %url, failures, "transport offline");
                }
                return Err(match failure {
                    HttpFailure::Unreachable(reason) => self.fail(&url, reason, true),
                    HttpFailure::TimedOut => {
                        warn!(url = %url, timeout_ms = self.timeout.as_millis() as u64, "sync request timed out");
                        *self.last_failure.lock() = Some(format!("timed out after {:?}", self.timeout));
                        SyncError::Timeout
                    }
                });
            }
        };
        self.failures.store(0, Ordering::SeqCst);

        if !response.is_success() {
            let reason = format!("HTTP {} from {url}", response.status);
            return Err(self.fail(&url, reason, response.is_retryable()));
        }
        *self.last_failure.lock() = None;
        Ok(SyncMessage::decode(&response.body)?)
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.failures.load(Ordering::SeqCst) < self.offline_after
    }

    fn close(&self) -> SyncResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// An in-process authority reachable through [`LoopbackClient`].
pub trait LoopbackServer {
    /// Answers a POST to `path` (the URL without scheme and host).
    fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse;
}

/// Hands requests straight to an in-process server.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a client bound to `server`.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, body: Vec<u8>, _timeout: Duration) -> Result<HttpResponse, HttpFailure> {
        let after_scheme = url.find("://").map_or(url, |i| &url[i + 3..]);
        let path = after_scheme.find('/').map_or("/", |i| &after_scheme[i..]);
        Ok(self.server.handle_post(path, &body))
    }
}
