//! Idempotency record storage.
//!
//! # Responsibilities
//! - Atomically claim an unseen key for exactly one executor
//! - Store the finished response for a key
//! - Wake requests waiting on an in-flight key
//!
//! # Key States
//! ```text
//! absent ──try_claim──▶ pending ──complete──▶ ready
//!                          │
//!                          └──release──▶ absent
//! ```
//!
//! # Design Decisions
//! - The claim is an insert-if-absent on the map entry, never check-then-store
//! - Waiters subscribe to a watch channel owned by the pending slot
//! - Records are immutable once stored and shared via `Arc`

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Response, StatusCode},
};
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::watch;

use crate::observability::capture::BufferedResponse;

/// A stored response, replayed verbatim for its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: StatusCode,
    /// In response order, repeats kept.
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Bytes,
    /// Unix seconds.
    pub created_at: u64,
}

impl IdempotencyRecord {
    pub fn from_response(key: impl Into<String>, response: BufferedResponse) -> Self {
        let headers = response
            .parts
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Self {
            key: key.into(),
            status: response.parts.status,
            headers,
            body: response.body,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Rebuild the response exactly as recorded.
    pub fn to_response(&self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            headers.append(name.clone(), value.clone());
        }
        response
    }
}

/// Result of [`IdempotencyStore::try_claim`].
#[derive(Debug)]
pub enum Claim {
    /// The caller owns the key and must `complete` or `release` it.
    Acquired,
    /// A record exists.
    Replay(Arc<IdempotencyRecord>),
    /// Another request owns the key.
    Pending(InFlight),
}

/// Handle on a key another request is executing.
#[derive(Debug)]
pub struct InFlight {
    rx: watch::Receiver<Option<Arc<IdempotencyRecord>>>,
}

impl InFlight {
    /// Wait for the owner to finish. `None` means the claim was released.
    pub async fn wait(mut self) -> Option<Arc<IdempotencyRecord>> {
        loop {
            if let Some(record) = self.rx.borrow_and_update().clone() {
                return Some(record);
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

/// Backend behind the idempotency cache.
pub trait IdempotencyStore: Send + Sync + fmt::Debug {
    /// Atomically claim `key`, or report what already holds it.
    fn try_claim(&self, key: &str) -> Claim;

    /// Store the record for a claimed key and wake its waiters.
    fn complete(&self, record: IdempotencyRecord) -> Arc<IdempotencyRecord>;

    /// Give up a claim without storing anything.
    fn release(&self, key: &str);

    fn get(&self, key: &str) -> Option<Arc<IdempotencyRecord>>;
}

enum Slot {
    Pending(watch::Sender<Option<Arc<IdempotencyRecord>>>),
    Ready {
        record: Arc<IdempotencyRecord>,
        stored_at: Instant,
    },
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Pending(_) => f.write_str("Pending"),
            Slot::Ready { record, .. } => f.debug_tuple("Ready").field(&record.status).finish(),
        }
    }
}

/// Process-local store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    slots: DashMap<String, Slot>,
    ttl: Option<Duration>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records older than `ttl` are treated as absent.
    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
        }
    }

    fn expired(&self, stored_at: Instant) -> bool {
        self.ttl.is_some_and(|ttl| stored_at.elapsed() >= ttl)
    }

    /// Drop expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::Ready { stored_at, .. } => !self.expired(*stored_at),
            Slot::Pending(_) => true,
        });
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn try_claim(&self, key: &str) -> Claim {
        match self.slots.entry(key.to_string()) {
            Entry::Vacant(entry) => {
                let (tx, _) = watch::channel(None);
                entry.insert(Slot::Pending(tx));
                Claim::Acquired
            }
            Entry::Occupied(mut entry) => {
                let claim = match entry.get() {
                    Slot::Ready { record, stored_at } if !self.expired(*stored_at) => {
                        Claim::Replay(record.clone())
                    }
                    Slot::Ready { .. } => Claim::Acquired,
                    Slot::Pending(tx) => Claim::Pending(InFlight { rx: tx.subscribe() }),
                };
                if matches!(claim, Claim::Acquired) {
                    // Expired record; take the key over.
                    let (tx, _) = watch::channel(None);
                    entry.insert(Slot::Pending(tx));
                }
                claim
            }
        }
    }

    fn complete(&self, record: IdempotencyRecord) -> Arc<IdempotencyRecord> {
        let record = Arc::new(record);
        let previous = self.slots.insert(
            record.key.clone(),
            Slot::Ready {
                record: record.clone(),
                stored_at: Instant::now(),
            },
        );
        if let Some(Slot::Pending(tx)) = previous {
            tx.send_replace(Some(record.clone()));
        }
        record
    }

    fn release(&self, key: &str) {
        // Dropping the sender wakes waiters with "released".
        self.slots
            .remove_if(key, |_, slot| matches!(slot, Slot::Pending(_)));
    }

    fn get(&self, key: &str) -> Option<Arc<IdempotencyRecord>> {
        self.slots.get(key).and_then(|slot| match &*slot {
            Slot::Ready { record, stored_at } if !self.expired(*stored_at) => Some(record.clone()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, body: &'static str) -> IdempotencyRecord {
        IdempotencyRecord {
            key: key.into(),
            status: StatusCode::CREATED,
            headers: vec![(
                HeaderName::from_static("content-type"),
                HeaderValue::from_static("application/json"),
            )],
            body: Bytes::from_static(body.as_bytes()),
            created_at: 0,
        }
    }

    #[test]
    fn test_claim_is_exclusive() {
        let store = InMemoryIdempotencyStore::new();
        assert!(matches!(store.try_claim("k"), Claim::Acquired));
        assert!(matches!(store.try_claim("k"), Claim::Pending(_)));
        assert!(matches!(store.try_claim("other"), Claim::Acquired));
    }

    #[test]
    fn test_complete_then_replay() {
        let store = InMemoryIdempotencyStore::new();
        assert!(matches!(store.try_claim("k"), Claim::Acquired));
        store.complete(record("k", "{}"));

        match store.try_claim("k") {
            Claim::Replay(r) => assert_eq!(r.status, StatusCode::CREATED),
            other => panic!("expected replay, got {:?}", other),
        }
        assert!(store.get("k").is_some());
    }

    #[test]
    fn test_release_frees_key() {
        let store = InMemoryIdempotencyStore::new();
        assert!(matches!(store.try_claim("k"), Claim::Acquired));
        store.release("k");
        assert!(matches!(store.try_claim("k"), Claim::Acquired));
    }

    #[test]
    fn test_release_keeps_ready_record() {
        let store = InMemoryIdempotencyStore::new();
        store.try_claim("k");
        store.complete(record("k", "{}"));
        store.release("k");
        assert!(store.get("k").is_some());
    }

    #[tokio::test]
    async fn test_waiter_sees_record() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        assert!(matches!(store.try_claim("k"), Claim::Acquired));
        let Claim::Pending(in_flight) = store.try_claim("k") else {
            panic!("expected pending");
        };

        let waiter = tokio::spawn(in_flight.wait());
        tokio::task::yield_now().await;
        store.complete(record("k", r#"{"id":1}"#));

        let seen = waiter.await.unwrap().unwrap();
        assert_eq!(&seen.body[..], br#"{"id":1}"#);
    }

    #[tokio::test]
    async fn test_waiter_sees_release() {
        let store = InMemoryIdempotencyStore::new();
        store.try_claim("k");
        let Claim::Pending(in_flight) = store.try_claim("k") else {
            panic!("expected pending");
        };
        store.release("k");
        assert!(in_flight.wait().await.is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let store = InMemoryIdempotencyStore::with_ttl(Some(Duration::ZERO));
        store.try_claim("k");
        store.complete(record("k", "{}"));
        assert!(store.get("k").is_none());
        assert!(matches!(store.try_claim("k"), Claim::Acquired));

        store.complete(record("k", "{}"));
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_record_round_trips_headers() {
        let mut r = record("k", "body");
        r.headers.push((
            HeaderName::from_static("set-cookie"),
            HeaderValue::from_static("a=1"),
        ));
        r.headers.push((
            HeaderName::from_static("set-cookie"),
            HeaderValue::from_static("b=2"),
        ));

        let response = r.to_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let cookies: Vec<_> = response.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }
}
