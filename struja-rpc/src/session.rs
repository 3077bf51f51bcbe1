//! RPC session
//!
//! One session owns one transport connection. A single receive loop is
//! the sole reader: it decodes inbound frames, dispatches inbound calls
//! through the role's router on their own tasks, and resolves inbound
//! results against the pending-call table. Issuing code drives
//! [`Session::call`], which suspends the calling task until the matched
//! reply, a timeout, or session termination — whichever comes first.
//!
//! Frame ingestion is serialized (wire order); handler completion order
//! is not. A slow inbound handler never blocks result delivery to other
//! outstanding outbound calls.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::frame::{Envelope, ProtocolError, WireError};
use crate::pending::{CallOutcome, DuplicateId, PendingTable};
use crate::router::{RoleRegistry, Router};
use crate::transport::MessageTransport;

/// Session lifecycle: Open (receive loop running) → Closing (draining) →
/// Closed (terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// Errors surfaced to issuing code by [`Session::call`].
#[derive(Debug, Error)]
pub enum RpcError {
    /// This role does not issue the named action; caught before any
    /// envelope is constructed.
    #[error("role cannot issue action {0}")]
    UnsupportedAction(String),

    /// The caller supplied a unique id that is already in flight.
    #[error(transparent)]
    DuplicateId(#[from] DuplicateId),

    /// The peer answered with a CALLERROR.
    #[error("call rejected by peer: {0}")]
    CallError(WireError),

    /// No reply within the caller's deadline. The engine never retries;
    /// a retry is the caller's decision, with a fresh unique id.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The session closed before the call resolved.
    #[error("session closed")]
    SessionClosed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Default deadline for [`Session::call`].
    pub call_timeout: Duration,
    /// Capacity of the outgoing envelope queue.
    pub outgoing_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            outgoing_capacity: 64,
        }
    }
}

struct Inner {
    label: String,
    outgoing: mpsc::Sender<Envelope>,
    pending: PendingTable,
    router: Router,
    state: Mutex<SessionState>,
    shutdown: Notify,
    config: SessionConfig,
}

/// Handle to a running session. Cheap to clone; any number of tasks may
/// issue calls concurrently, multiplexed by unique id.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Start a session over `transport` for the given role.
    ///
    /// Spawns the receive loop and returns the issuing handle plus the
    /// loop's join handle. The loop runs until the peer closes, the
    /// transport faults, or [`Session::close`] is called.
    pub fn spawn<T>(
        transport: T,
        registry: Arc<dyn RoleRegistry>,
        label: impl Into<String>,
        config: SessionConfig,
    ) -> (Session, JoinHandle<()>)
    where
        T: MessageTransport + 'static,
    {
        let label = label.into();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.outgoing_capacity);
        let router = Router::new(registry);

        let inner = Arc::new(Inner {
            label: label.clone(),
            outgoing: outgoing_tx,
            pending: PendingTable::new(),
            router: router.clone(),
            state: Mutex::new(SessionState::Open),
            shutdown: Notify::new(),
            config,
        });

        let span = info_span!("session", label = %label, role = router.role());
        let loop_inner = inner.clone();
        let handle = tokio::spawn(
            async move {
                run_loop(transport, loop_inner, outgoing_rx).await;
            }
            .instrument(span),
        );

        (Session { inner }, handle)
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Issue `action` with the session's default deadline.
    pub async fn call(&self, action: &str, payload: Value) -> Result<Value, RpcError> {
        self.call_with_timeout(action, payload, self.inner.config.call_timeout)
            .await
    }

    /// Issue `action` and suspend until the matched reply, `timeout`, or
    /// session termination.
    pub async fn call_with_timeout(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if self.state() != SessionState::Open {
            return Err(RpcError::SessionClosed);
        }
        if !self.inner.router.can_issue(action) {
            return Err(RpcError::UnsupportedAction(action.to_string()));
        }

        let unique_id = Uuid::new_v4().to_string();
        let slot = self.inner.pending.register(&unique_id, action)?;

        let envelope = Envelope::Call {
            unique_id: unique_id.clone(),
            action: action.to_string(),
            payload,
        };
        if self.inner.outgoing.send(envelope).await.is_err() {
            self.inner.pending.expire(&unique_id);
            return Err(RpcError::SessionClosed);
        }

        match tokio::time::timeout(timeout, slot).await {
            Ok(Ok(CallOutcome::Result(payload))) => Ok(payload),
            Ok(Ok(CallOutcome::Error(error))) => Err(RpcError::CallError(error)),
            Ok(Ok(CallOutcome::Closed)) => Err(RpcError::SessionClosed),
            Ok(Err(_)) => Err(RpcError::SessionClosed),
            Err(_) => {
                if self.inner.pending.expire(&unique_id) {
                    debug!(%unique_id, action, "call expired, any late reply will be dropped");
                }
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Request shutdown: outstanding calls fail with `SessionClosed`
    /// once the loop has drained.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if *state == SessionState::Open {
            *state = SessionState::Closing;
            self.inner.shutdown.notify_one();
        }
    }
}

async fn run_loop<T>(mut transport: T, inner: Arc<Inner>, mut outgoing_rx: mpsc::Receiver<Envelope>)
where
    T: MessageTransport,
{
    info!("session open");

    loop {
        tokio::select! {
            _ = inner.shutdown.notified() => {
                info!("close requested");
                break;
            }

            queued = outgoing_rx.recv() => match queued {
                Some(envelope) => {
                    if let Err(e) = transport.send(envelope.encode()).await {
                        warn!(error = %e, "transport send failed");
                        break;
                    }
                }
                None => break,
            },

            frame = transport.receive() => match frame {
                Some(Ok(text)) => ingest(&inner, &text),
                Some(Err(e)) => {
                    warn!(error = %e, "transport fault");
                    break;
                }
                None => {
                    info!("peer closed the connection");
                    break;
                }
            },
        }
    }

    *inner.state.lock() = SessionState::Closing;

    // Drain replies already queued by finished handlers, best-effort.
    while let Ok(envelope) = outgoing_rx.try_recv() {
        if transport.send(envelope.encode()).await.is_err() {
            break;
        }
    }

    let flushed = inner.pending.flush();
    if flushed > 0 {
        warn!(flushed, "session closed with calls outstanding");
    }

    let _ = transport.close().await;
    *inner.state.lock() = SessionState::Closed;
    info!("session closed");
}

/// Handle one inbound frame. Ingestion order equals wire order; inbound
/// call handlers are spawned so their completion order is independent.
fn ingest(inner: &Arc<Inner>, text: &str) {
    match Envelope::decode(text) {
        Ok(Envelope::Call {
            unique_id,
            action,
            payload,
        }) => {
            debug!(%unique_id, %action, "inbound call");
            let router = inner.router.clone();
            let outgoing = inner.outgoing.clone();
            let span = info_span!("dispatch", %unique_id, %action);
            tokio::spawn(
                async move {
                    let reply = match router.dispatch(&action, payload).await {
                        Ok(payload) => Envelope::CallResult { unique_id, payload },
                        Err(error) => Envelope::CallError { unique_id, error },
                    };
                    // The loop may be gone; the peer will never see a
                    // reply either way.
                    let _ = outgoing.send(reply).await;
                }
                .instrument(span),
            );
        }

        Ok(Envelope::CallResult { unique_id, payload }) => {
            if !inner
                .pending
                .resolve(&unique_id, CallOutcome::Result(payload))
            {
                debug!(%unique_id, "dropping unmatched CallResult");
            }
        }

        Ok(Envelope::CallError { unique_id, error }) => {
            if !inner.pending.resolve(&unique_id, CallOutcome::Error(error)) {
                debug!(%unique_id, "dropping unmatched CallError");
            }
        }

        // Wire noise must not kill a live charging session: the frame is
        // dropped and the loop keeps reading.
        Err(e @ ProtocolError::UnsupportedMessageType(_)) => {
            warn!(error = %e, "dropping frame with unsupported message type");
        }
        Err(e) => {
            warn!(error = %e, "dropping malformed frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ErrorCode;
    use crate::router::HandlerError;
    use crate::transport::mem;
    use async_trait::async_trait;

    /// Test peer role: echoes, stalls, or fails on demand.
    struct TestPeer;

    #[async_trait]
    impl RoleRegistry for TestPeer {
        fn role(&self) -> &'static str {
            "test-peer"
        }

        fn issues(&self, action: &str) -> bool {
            action != "Forbidden"
        }

        fn receives(&self, action: &str) -> bool {
            matches!(action, "Echo" | "Slow" | "Fail")
        }

        async fn handle(&self, action: &str, payload: Value) -> Result<Value, HandlerError> {
            match action {
                "Echo" => Ok(payload),
                "Slow" => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(payload)
                }
                "Fail" => Err(HandlerError::Internal("simulated fault".into())),
                _ => Err(HandlerError::Internal("unreachable".into())),
            }
        }
    }

    fn wired_pair() -> (Session, Session) {
        let (a, b) = mem::pair(16);
        let (left, _) = Session::spawn(a, Arc::new(TestPeer), "left", SessionConfig::default());
        let (right, _) = Session::spawn(b, Arc::new(TestPeer), "right", SessionConfig::default());
        (left, right)
    }

    #[tokio::test]
    async fn test_call_resolves_with_matched_result() {
        let (left, _right) = wired_pair();
        let out = left
            .call("Echo", serde_json::json!({"n": 42}))
            .await
            .unwrap();
        assert_eq!(out["n"], 42);
    }

    #[tokio::test]
    async fn test_call_error_carries_code_and_description() {
        let (left, _right) = wired_pair();
        match left.call("Fail", serde_json::json!({})).await {
            Err(RpcError::CallError(e)) => {
                assert_eq!(e.code, ErrorCode::InternalError);
                assert_eq!(e.description, "simulated fault");
            }
            other => panic!("expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_answered_not_implemented() {
        let (left, right) = wired_pair();
        match left.call("NoSuchAction", serde_json::json!({})).await {
            Err(RpcError::CallError(e)) => assert_eq!(e.code, ErrorCode::NotImplemented),
            other => panic!("expected CallError, got {:?}", other),
        }
        // The responding session survived the failed dispatch.
        assert!(right.is_open());
        let out = left.call("Echo", serde_json::json!({"ok": 1})).await.unwrap();
        assert_eq!(out["ok"], 1);
    }

    #[tokio::test]
    async fn test_unsupported_action_caught_before_send() {
        let (left, _right) = wired_pair();
        match left.call("Forbidden", serde_json::json!({})).await {
            Err(RpcError::UnsupportedAction(a)) => assert_eq!(a, "Forbidden"),
            other => panic!("expected UnsupportedAction, got {:?}", other),
        }
        assert_eq!(left.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_resolve_independently() {
        let (left, _right) = wired_pair();

        let slow = {
            let s = left.clone();
            tokio::spawn(async move { s.call("Slow", serde_json::json!({"which": "slow"})).await })
        };
        let fast = {
            let s = left.clone();
            tokio::spawn(async move { s.call("Echo", serde_json::json!({"which": "fast"})).await })
        };

        // The fast reply lands first; each call still gets its own
        // payload, correlated by unique id rather than arrival order.
        let fast_out = fast.await.unwrap().unwrap();
        assert_eq!(fast_out["which"], "fast");
        let slow_out = slow.await.unwrap().unwrap();
        assert_eq!(slow_out["which"], "slow");
    }

    #[tokio::test]
    async fn test_timeout_then_late_reply_is_dropped() {
        let (a, mut peer) = mem::pair(16);
        let (session, _) = Session::spawn(a, Arc::new(TestPeer), "cp", SessionConfig::default());

        let err = session
            .call_with_timeout("Echo", serde_json::json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));

        // Reply late, by hand, to the id the session used.
        let raw = peer.receive().await.unwrap().unwrap();
        let unique_id = match Envelope::decode(&raw).unwrap() {
            Envelope::Call { unique_id, .. } => unique_id,
            other => panic!("expected Call, got {:?}", other),
        };
        peer.send(
            Envelope::CallResult {
                unique_id,
                payload: serde_json::json!({"late": true}),
            }
            .encode(),
        )
        .await
        .unwrap();

        // The late reply is dropped; the session keeps working.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.is_open());
        assert_eq!(session.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_result_dropped_without_affecting_others() {
        let (a, mut peer) = mem::pair(16);
        let (session, _) = Session::spawn(a, Arc::new(TestPeer), "cp", SessionConfig::default());

        peer.send(
            Envelope::CallResult {
                unique_id: "never-issued".into(),
                payload: serde_json::json!({}),
            }
            .encode(),
        )
        .await
        .unwrap();

        // Issue a call and answer it manually; the stray result above
        // must not have disturbed anything.
        let caller = {
            let s = session.clone();
            tokio::spawn(async move { s.call("Echo", serde_json::json!({"v": 7})).await })
        };
        let raw = peer.receive().await.unwrap().unwrap();
        let unique_id = match Envelope::decode(&raw).unwrap() {
            Envelope::Call { unique_id, .. } => unique_id,
            other => panic!("expected Call, got {:?}", other),
        };
        peer.send(
            Envelope::CallResult {
                unique_id,
                payload: serde_json::json!({"v": 7}),
            }
            .encode(),
        )
        .await
        .unwrap();

        assert_eq!(caller.await.unwrap().unwrap()["v"], 7);
    }

    #[tokio::test]
    async fn test_malformed_frames_do_not_terminate_session() {
        let (a, mut peer) = mem::pair(16);
        let (session, _) = Session::spawn(a, Arc::new(TestPeer), "cp", SessionConfig::default());

        peer.send("this is not json".into()).await.unwrap();
        peer.send(r#"[9,"x"]"#.into()).await.unwrap();
        peer.send(r#"{"not":"an array"}"#.into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.is_open());

        // Next valid frame is processed normally.
        let caller = {
            let s = session.clone();
            tokio::spawn(async move { s.call("Echo", serde_json::json!({"alive": true})).await })
        };
        let raw = peer.receive().await.unwrap().unwrap();
        let unique_id = match Envelope::decode(&raw).unwrap() {
            Envelope::Call { unique_id, .. } => unique_id,
            other => panic!("expected Call, got {:?}", other),
        };
        peer.send(
            Envelope::CallResult {
                unique_id,
                payload: serde_json::json!({"alive": true}),
            }
            .encode(),
        )
        .await
        .unwrap();
        assert_eq!(caller.await.unwrap().unwrap()["alive"], true);
    }

    #[tokio::test]
    async fn test_close_flushes_outstanding_calls() {
        let (a, _peer) = mem::pair(16);
        let (session, loop_handle) =
            Session::spawn(a, Arc::new(TestPeer), "cp", SessionConfig::default());

        let caller = {
            let s = session.clone();
            tokio::spawn(async move { s.call("Echo", serde_json::json!({})).await })
        };
        // Let the call register and hit the wire before closing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close();

        match caller.await.unwrap() {
            Err(RpcError::SessionClosed) => {}
            other => panic!("expected SessionClosed, got {:?}", other),
        }

        loop_handle.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        // Calls after close are rejected immediately.
        match session.call("Echo", serde_json::json!({})).await {
            Err(RpcError::SessionClosed) => {}
            other => panic!("expected SessionClosed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_close_terminates_session() {
        let (a, peer) = mem::pair(16);
        let (session, loop_handle) =
            Session::spawn(a, Arc::new(TestPeer), "cp", SessionConfig::default());

        drop(peer);
        loop_handle.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
