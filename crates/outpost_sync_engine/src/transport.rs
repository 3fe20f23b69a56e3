//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use outpost_sync_protocol::{
    AbortSessionRequest, AdvanceSessionRequest, AdvanceSessionResponse, EndSessionRequest, InitiatePullRequest,
    PullPlan, PullRequest, PullResponse, PushRequest, PushResponse, SessionClosed, StartSessionRequest,
    StartSessionResponse, SyncMessage,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// A sync transport carries request/response pairs to the authority.
///
/// Implementations only move messages; the typed calls are provided on top
/// of [`send`](Self::send) and turn an error reply into
/// [`SyncError::Server`]. Calls may come from several threads at once while
/// pull pages for different types are fetched in parallel.
pub trait SyncTransport: Send + Sync {
    /// Sends one request and returns the authority's reply.
    fn send(&self, request: SyncMessage) -> SyncResult<SyncMessage>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> SyncResult<()>;

    /// Opens a session.
    fn start_session(&self, request: StartSessionRequest) -> SyncResult<StartSessionResponse> {
        match self.send(SyncMessage::StartSession(request))? {
            SyncMessage::SessionStarted(response) => Ok(response),
            other => Err(unexpected(other, "session_started")),
        }
    }

    /// Reports a phase change.
    fn advance_session(&self, request: AdvanceSessionRequest) -> SyncResult<AdvanceSessionResponse> {
        match self.send(SyncMessage::AdvanceSession(request))? {
            SyncMessage::SessionAdvanced(response) => Ok(response),
            other => Err(unexpected(other, "session_advanced")),
        }
    }

    /// Sends a push batch.
    fn push(&self, request: PushRequest) -> SyncResult<PushResponse> {
        match self.send(SyncMessage::Push(request))? {
            SyncMessage::PushAck(response) => Ok(response),
            other => Err(unexpected(other, "push_ack")),
        }
    }

    /// Asks the authority to stage the pull snapshot.
    fn initiate_pull(&self, request: InitiatePullRequest) -> SyncResult<PullPlan> {
        match self.send(SyncMessage::InitiatePull(request))? {
            SyncMessage::PullPlanned(plan) => Ok(plan),
            other => Err(unexpected(other, "pull_planned")),
        }
    }

    /// Fetches one pull page.
    fn pull(&self, request: PullRequest) -> SyncResult<PullResponse> {
        match self.send(SyncMessage::Pull(request))? {
            SyncMessage::PullPage(page) => Ok(page),
            other => Err(unexpected(other, "pull_page")),
        }
    }

    /// Completes the session.
    fn end_session(&self, request: EndSessionRequest) -> SyncResult<SessionClosed> {
        match self.send(SyncMessage::EndSession(request))? {
            SyncMessage::SessionClosed(closed) => Ok(closed),
            other => Err(unexpected(other, "session_closed")),
        }
    }

    /// Abandons the session.
    fn abort_session(&self, request: AbortSessionRequest) -> SyncResult<SessionClosed> {
        match self.send(SyncMessage::AbortSession(request))? {
            SyncMessage::SessionClosed(closed) => Ok(closed),
            other => Err(unexpected(other, "session_closed")),
        }
    }
}

fn unexpected(reply: SyncMessage, expected: &'static str) -> SyncError {
    match reply {
        SyncMessage::Error(err) => SyncError::Server {
            code: err.code,
            message: err.message,
        },
        other => SyncError::Protocol(other.unexpected(expected)),
    }
}

/// A scripted transport for testing.
///
/// Replies are handed out in the order they were queued; every request is
/// recorded.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    replies: Mutex<VecDeque<SyncMessage>>,
    requests: Mutex<Vec<SyncMessage>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues the next reply.
    pub fn queue_reply(&self, reply: SyncMessage) {
        self.replies.lock().push_back(reply);
    }

    /// Requests sent so far.
    pub fn requests(&self) -> Vec<SyncMessage> {
        self.requests.lock().clone()
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTransport for MockTransport {
    fn send(&self, request: SyncMessage) -> SyncResult<SyncMessage> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let name = request.name();
        self.requests.lock().push(request);
        self.replies
            .lock()
            .pop_front()
            .ok_or_else(|| SyncError::transport_fatal(format!("no mock reply queued for {name}")))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_core::SessionId;
    use outpost_sync_protocol::{ErrorCode, ErrorResponse, StartStatus};

    #[test]
    fn mock_transport_not_connected() {
        let transport = MockTransport::new();
        transport.set_connected(false);
        let result = transport.start_session(StartSessionRequest::new("n1".into(), vec![], -1));
        assert!(matches!(result, Err(SyncError::NotConnected)));
    }

    #[test]
    fn typed_calls_unwrap_the_reply() {
        let transport = MockTransport::new();
        let id = SessionId::generate();
        transport.queue_reply(SyncMessage::SessionStarted(StartSessionResponse::started(id, 4, 5)));

        let response = transport
            .start_session(StartSessionRequest::new("n1".into(), vec!["f1".into()], -1))
            .unwrap();
        assert_eq!(response.status, StartStatus::Started);
        assert_eq!(response.session_id, Some(id));
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(transport.requests()[0].name(), "start_session");
    }

    #[test]
    fn error_reply_becomes_server_error() {
        let transport = MockTransport::new();
        transport.queue_reply(SyncMessage::Error(ErrorResponse::new(ErrorCode::SessionLapsed, "gone")));
        let err = transport
            .end_session(EndSessionRequest {
                session_id: SessionId::generate(),
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::Server { code: ErrorCode::SessionLapsed, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn wrong_reply_is_a_protocol_error() {
        let transport = MockTransport::new();
        transport.queue_reply(SyncMessage::PushAck(PushResponse::staged(1)));
        let err = transport
            .end_session(EndSessionRequest {
                session_id: SessionId::generate(),
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert!(err.to_string().contains("push_ack"));
    }

    #[test]
    fn close_disconnects() {
        let transport = MockTransport::new();
        assert!(transport.is_connected());
        transport.close().unwrap();
        assert!(!transport.is_connected());
    }
}
