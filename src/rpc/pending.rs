//! Correlation Table: outstanding requests keyed by correlation id.
//!
//! Every entry is removed exactly once: by its matching response, by the
//! caller giving up (timeout or cancellation), or by the loss of the
//! connection generation it was sent on. Removal is the single point of
//! truth, so a request can never be resolved twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::envelope::{CorrelationId, Envelope};
use crate::error::{Error, Result};

/// Receiving half handed to the caller of [`PendingTable::insert`].
pub type ResponseReceiver = oneshot::Receiver<Result<Value>>;

/// One outstanding request.
#[derive(Debug)]
struct PendingRequest {
    command: String,
    created_at: Instant,
    generation: u64,
    responder: oneshot::Sender<Result<Value>>,
}

impl PendingRequest {
    fn complete(self, id: &CorrelationId, outcome: Result<Value>) {
        if let Err(e) = &outcome {
            log::debug!(
                "[Rpc] {} (id {}) failed after {:?}: {}",
                self.command,
                id,
                self.created_at.elapsed(),
                e
            );
        }
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.responder.send(outcome);
    }
}

/// Shared table of pending requests. Clones share the table.
#[derive(Debug, Clone, Default)]
pub struct PendingTable {
    entries: Arc<Mutex<HashMap<CorrelationId, PendingRequest>>>,
}

impl PendingTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request sent on connection `generation`.
    ///
    /// A duplicate id replaces nothing: the new entry is rejected immediately
    /// with [`Error::Encode`] so the earlier request keeps its slot.
    pub fn insert(&self, id: CorrelationId, command: &str, generation: u64) -> ResponseReceiver {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            drop(entries);
            let _ = tx.send(Err(Error::Encode(format!("duplicate correlation id {id}"))));
            return rx;
        }
        entries.insert(
            id,
            PendingRequest {
                command: command.to_string(),
                created_at: Instant::now(),
                generation,
                responder: tx,
            },
        );
        rx
    }

    /// Remove an entry without completing it. Returns whether it was present.
    pub fn remove(&self, id: &CorrelationId) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Remove an entry and reject it with `error`.
    pub fn reject(&self, id: &CorrelationId, error: Error) -> bool {
        let entry = self.entries.lock().remove(id);
        match entry {
            Some(entry) => {
                entry.complete(id, Err(error));
                true
            }
            None => false,
        }
    }

    /// Complete the entry matching `envelope`, if any.
    ///
    /// Returns the envelope back when it does not match a pending request, so
    /// the caller can route it as an event.
    pub fn resolve(&self, envelope: Envelope) -> Option<Envelope> {
        let Some(id) = envelope.id.clone() else {
            return Some(envelope);
        };
        let entry = self.entries.lock().remove(&id);
        match entry {
            Some(entry) => {
                let outcome = match envelope.error {
                    Some(message) => Err(Error::Remote(message)),
                    None => Ok(envelope.payload),
                };
                entry.complete(&id, outcome);
                None
            }
            None => {
                log::debug!(
                    "[Rpc] No pending request for id {} (topic '{}')",
                    id,
                    envelope.topic
                );
                Some(envelope)
            }
        }
    }

    /// Reject every request sent on `generation` or earlier with
    /// [`Error::Disconnected`]. Returns how many were rejected.
    pub fn fail_generation(&self, generation: u64) -> usize {
        self.fail_where(|entry| entry.generation <= generation)
    }

    /// Reject every pending request with [`Error::Disconnected`].
    pub fn fail_all(&self) -> usize {
        self.fail_where(|_| true)
    }

    fn fail_where(&self, predicate: impl Fn(&PendingRequest) -> bool) -> usize {
        let failed: Vec<(CorrelationId, PendingRequest)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<CorrelationId> = entries
                .iter()
                .filter(|(_, entry)| predicate(entry))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        let count = failed.len();
        for (id, entry) in failed {
            entry.complete(&id, Err(Error::Disconnected));
        }
        count
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is outstanding.
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.lock().contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn response(id: &str, payload: Value) -> Envelope {
        Envelope::from_wire(json!({"type": "x", "id": id, "data": payload})).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_matching_response() {
        let table = PendingTable::new();
        let rx = table.insert("1".into(), "ping", 1);

        assert!(table.resolve(response("1", json!({"pong": true}))).is_none());
        assert_eq!(rx.await.unwrap(), Ok(json!({"pong": true})));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_remote_error_rejects() {
        let table = PendingTable::new();
        let rx = table.insert("1".into(), "task.start", 1);
        let env = Envelope::from_wire(json!({"type": "x", "id": "1", "error": "no such task"}))
            .unwrap();

        assert!(table.resolve(env).is_none());
        assert_eq!(rx.await.unwrap(), Err(Error::Remote("no such task".into())));
    }

    #[tokio::test]
    async fn test_unknown_id_is_returned_and_not_misattributed() {
        let table = PendingTable::new();
        let mut rx = table.insert("1".into(), "ping", 1);

        let stale = table.resolve(response("99", json!("late")));
        assert!(stale.is_some());
        assert!(table.contains(&"1".into()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_response_for_same_id_is_not_applied() {
        let table = PendingTable::new();
        let rx = table.insert("1".into(), "ping", 1);
        assert!(table.resolve(response("1", json!(1))).is_none());
        assert!(table.resolve(response("1", json!(2))).is_some());
        assert_eq!(rx.await.unwrap(), Ok(json!(1)));
    }

    #[tokio::test]
    async fn test_fail_generation_only_hits_older_requests() {
        let table = PendingTable::new();
        let old = table.insert("1".into(), "a", 1);
        let new = table.insert("2".into(), "b", 2);

        assert_eq!(table.fail_generation(1), 1);
        assert_eq!(old.await.unwrap(), Err(Error::Disconnected));
        assert!(table.contains(&"2".into()));

        assert_eq!(table.fail_all(), 1);
        assert_eq!(new.await.unwrap(), Err(Error::Disconnected));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let table = PendingTable::new();
        let _first = table.insert("1".into(), "a", 1);
        let second = table.insert("1".into(), "b", 1);
        assert!(matches!(second.await.unwrap(), Err(Error::Encode(_))));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reject_and_remove() {
        let table = PendingTable::new();
        let _rx = table.insert("1".into(), "a", 1);
        assert!(table.reject(&"1".into(), Error::Cancelled));
        assert!(!table.reject(&"1".into(), Error::Cancelled));
        assert!(!table.remove(&"1".into()));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_reject_delivers_error_to_waiter() {
        let table = PendingTable::new();
        let rx = table.insert("1".into(), "index.build", 1);
        assert!(table.reject(&"1".into(), Error::Timeout(Duration::from_millis(5))));
        assert_eq!(rx.await.unwrap(), Err(Error::Timeout(Duration::from_millis(5))));
    }
}
