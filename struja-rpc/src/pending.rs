//! Pending-call table
//!
//! Tracks locally-initiated calls awaiting a matched CALLRESULT or
//! CALLERROR, keyed by unique id. Each entry owns a one-shot slot that is
//! fulfilled exactly once, first wins: by the receive loop on a matched
//! reply, by `flush` on session termination, or abandoned by `expire` on
//! a caller-side timeout.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::frame::WireError;

/// What a waiting caller eventually observes.
#[derive(Debug)]
pub enum CallOutcome {
    /// Matched CALLRESULT payload.
    Result(Value),
    /// Matched CALLERROR triple.
    Error(WireError),
    /// The session closed before a reply arrived.
    Closed,
}

#[derive(Debug, Error)]
#[error("unique id {0} already has a call in flight")]
pub struct DuplicateId(pub String);

struct PendingCall {
    action: String,
    created_at: Instant,
    slot: oneshot::Sender<CallOutcome>,
}

/// Table of outstanding calls for one session.
///
/// Insertion and removal are mutually exclusive; the lock is never held
/// across an await point.
#[derive(Default)]
pub struct PendingTable {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `unique_id` and hand back the receiver half of its slot.
    pub fn register(
        &self,
        unique_id: &str,
        action: &str,
    ) -> Result<oneshot::Receiver<CallOutcome>, DuplicateId> {
        let mut calls = self.calls.lock();
        if calls.contains_key(unique_id) {
            return Err(DuplicateId(unique_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        calls.insert(
            unique_id.to_string(),
            PendingCall {
                action: action.to_string(),
                created_at: Instant::now(),
                slot: tx,
            },
        );
        Ok(rx)
    }

    /// Deliver `outcome` to the caller waiting on `unique_id`.
    ///
    /// Returns false if the id is unknown or already resolved. Not an
    /// error: a reply can legitimately arrive after local expiry, and
    /// such late replies are dropped by the caller of this method.
    pub fn resolve(&self, unique_id: &str, outcome: CallOutcome) -> bool {
        let entry = self.calls.lock().remove(unique_id);
        match entry {
            Some(call) => {
                tracing::trace!(
                    unique_id,
                    action = %call.action,
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    "resolving call"
                );
                // A failed send means the caller stopped waiting between
                // its deadline firing and our removal; treat as late.
                call.slot.send(outcome).is_ok()
            }
            None => false,
        }
    }

    /// Caller-driven timeout path: forget `unique_id` if still pending.
    ///
    /// Returns whether an entry was removed. A reply arriving afterwards
    /// finds nothing to resolve and is dropped.
    pub fn expire(&self, unique_id: &str) -> bool {
        self.calls.lock().remove(unique_id).is_some()
    }

    /// Session-termination path: fail every outstanding call.
    ///
    /// Returns how many calls were flushed.
    pub fn flush(&self) -> usize {
        let drained: Vec<PendingCall> = {
            let mut calls = self.calls.lock();
            calls.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call.slot.send(CallOutcome::Closed);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let table = PendingTable::new();
        let rx = table.register("id-1", "Heartbeat").unwrap();
        assert_eq!(table.len(), 1);

        assert!(table.resolve("id-1", CallOutcome::Result(serde_json::json!({"ok": true}))));
        assert!(table.is_empty());

        match rx.await.unwrap() {
            CallOutcome::Result(v) => assert_eq!(v["ok"], true),
            other => panic!("expected Result, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let table = PendingTable::new();
        let _rx = table.register("id-1", "Heartbeat").unwrap();
        let err = table.register("id-1", "Authorize").unwrap_err();
        assert_eq!(err.0, "id-1");
    }

    #[test]
    fn test_resolve_unknown_is_noop() {
        let table = PendingTable::new();
        assert!(!table.resolve("ghost", CallOutcome::Closed));
    }

    #[test]
    fn test_resolve_twice_is_noop() {
        let table = PendingTable::new();
        let _rx = table.register("id-1", "Heartbeat").unwrap();
        assert!(table.resolve("id-1", CallOutcome::Result(Value::Null)));
        assert!(!table.resolve("id-1", CallOutcome::Result(Value::Null)));
    }

    #[test]
    fn test_expire_then_resolve_drops_late_reply() {
        let table = PendingTable::new();
        let rx = table.register("id-1", "Heartbeat").unwrap();
        assert!(table.expire("id-1"));
        assert!(!table.expire("id-1"));
        assert!(!table.resolve("id-1", CallOutcome::Result(Value::Null)));
        drop(rx);
    }

    #[tokio::test]
    async fn test_flush_fails_all_outstanding() {
        let table = PendingTable::new();
        let rx1 = table.register("id-1", "Heartbeat").unwrap();
        let rx2 = table.register("id-2", "Authorize").unwrap();

        assert_eq!(table.flush(), 2);
        assert!(table.is_empty());

        assert!(matches!(rx1.await.unwrap(), CallOutcome::Closed));
        assert!(matches!(rx2.await.unwrap(), CallOutcome::Closed));
    }
}
