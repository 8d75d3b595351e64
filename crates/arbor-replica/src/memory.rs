//! In-process [`DurableStore`] with a bounded change history.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::store::{Change, ChangeEvent, ChangeStream, DurableDocument, DurableStore, ResumeToken};

/// Default number of changes kept per collection.
pub const DEFAULT_RETENTION: usize = 1024;

/// Default capacity of the live change channel per collection.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

struct Collection {
    document: Option<DurableDocument>,
    history: VecDeque<ChangeEvent>,
    feed: broadcast::Sender<ChangeEvent>,
}

impl Collection {
    fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity);
        Self {
            document: None,
            history: VecDeque::new(),
            feed,
        }
    }
}

struct Inner {
    collections: HashMap<String, Collection>,
    online: bool,
}

/// A durable store held in memory, for tests and simulations.
///
/// It keeps the last `retention` changes of each collection; watching from
/// an older token fails with [`StoreError::TokenExpired`]. Outages are
/// simulated with [`disconnect`](Self::disconnect), which also closes every
/// open change stream.
pub struct InMemoryDurableStore {
    inner: Mutex<Inner>,
    retention: usize,
    feed_capacity: usize,
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                collections: HashMap::new(),
                online: true,
            }),
            retention: DEFAULT_RETENTION,
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity.max(1);
        self
    }

    /// Make the store unreachable and close every open change stream.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.online = false;
        let capacity = self.feed_capacity;
        for collection in inner.collections.values_mut() {
            // Dropping the old sender closes its receivers.
            collection.feed = broadcast::channel(capacity).0;
        }
        info!("in-memory store disconnected");
    }

    pub fn reconnect(&self) {
        self.inner.lock().expect("lock poisoned").online = true;
        info!("in-memory store reconnected");
    }

    pub fn is_online(&self) -> bool {
        self.inner.lock().expect("lock poisoned").online
    }

    /// Drop the retained history of `collection`, so any resume token older
    /// than the current revision expires.
    pub fn expire_history(&self, collection: &str) {
        if let Some(c) = self
            .inner
            .lock()
            .expect("lock poisoned")
            .collections
            .get_mut(collection)
        {
            c.history.clear();
        }
    }

    /// The stored document, read even while disconnected.
    pub fn peek(&self, collection: &str) -> Option<DurableDocument> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .collections
            .get(collection)
            .and_then(|c| c.document.clone())
    }

    fn online(inner: &Inner) -> StoreResult<()> {
        if inner.online {
            Ok(())
        } else {
            Err(StoreError::unavailable("store is offline"))
        }
    }
}

impl DurableStore for InMemoryDurableStore {
    fn load(&self, collection: &str) -> StoreResult<Option<DurableDocument>> {
        let inner = self.inner.lock().expect("lock poisoned");
        Self::online(&inner)?;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|c| c.document.clone()))
    }

    fn seed(&self, mut document: DurableDocument) -> StoreResult<DurableDocument> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        Self::online(&inner)?;
        let capacity = self.feed_capacity;
        let collection = inner
            .collections
            .entry(document.collection.clone())
            .or_insert_with(|| Collection::new(capacity));
        if let Some(existing) = &collection.document {
            return Ok(existing.clone());
        }
        document.revision = 0;
        collection.document = Some(document.clone());
        debug!(collection = %document.collection, "seeded collection");
        Ok(document)
    }

    fn compare_and_swap(
        &self,
        expected: u64,
        mut document: DurableDocument,
        change: Change,
    ) -> StoreResult<ChangeEvent> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        Self::online(&inner)?;
        let Some(collection) = inner.collections.get_mut(&document.collection) else {
            return Err(StoreError::Backend(format!(
                "collection {} has no document",
                document.collection
            )));
        };
        let actual = collection
            .document
            .as_ref()
            .map(|d| d.revision)
            .ok_or_else(|| StoreError::Backend("collection has no document".into()))?;
        if actual != expected {
            return Err(StoreError::RevisionMismatch { expected, actual });
        }

        let revision = expected + 1;
        document.revision = revision;
        let event = ChangeEvent {
            token: revision,
            revision,
            op: change.op,
            diagnostics: change.diagnostics,
        };
        collection.document = Some(document);
        collection.history.push_back(event.clone());
        while collection.history.len() > self.retention {
            collection.history.pop_front();
        }
        // No live subscribers is fine.
        let _ = collection.feed.send(event.clone());
        Ok(event)
    }

    fn current_revision(&self, collection: &str) -> StoreResult<Option<u64>> {
        let inner = self.inner.lock().expect("lock poisoned");
        Self::online(&inner)?;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|c| c.document.as_ref())
            .map(|d| d.revision))
    }

    fn watch(&self, collection: &str, resume_after: ResumeToken) -> StoreResult<ChangeStream> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        Self::online(&inner)?;
        let capacity = self.feed_capacity;
        let c = inner
            .collections
            .entry(collection.to_string())
            .or_insert_with(|| Collection::new(capacity));

        let current = c.document.as_ref().map_or(0, |d| d.revision);
        let expired = resume_after > current
            || (resume_after < current
                && c.history
                    .front()
                    .map_or(true, |oldest| oldest.token > resume_after + 1));
        if expired {
            return Err(StoreError::TokenExpired {
                token: resume_after,
            });
        }

        let live = c.feed.subscribe();
        let backlog: Vec<ChangeEvent> = c
            .history
            .iter()
            .filter(|e| e.token > resume_after)
            .cloned()
            .collect();
        Ok(ChangeStream::new(resume_after, backlog, live))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeOp;
    use arbor_tree::Diagnostics;
    use arbor_types::Path;

    const C: &str = "docs";

    fn doc(root: &str) -> DurableDocument {
        DurableDocument {
            collection: C.into(),
            revision: 0,
            manifest: "m".into(),
            root: root.as_bytes().to_vec(),
        }
    }

    fn change(path: &str) -> Change {
        Change {
            op: ChangeOp::Delete {
                path: Path::parse(path).unwrap(),
            },
            diagnostics: Diagnostics::new(),
        }
    }

    fn seeded() -> InMemoryDurableStore {
        let store = InMemoryDurableStore::new();
        store.seed(doc("r0")).unwrap();
        store
    }

    // ---- Test 1: seeding is first-writer-wins ----
    #[test]
    fn seed_keeps_first_document() {
        let store = InMemoryDurableStore::new();
        assert_eq!(store.load(C).unwrap(), None);
        let first = store.seed(doc("a")).unwrap();
        let second = store.seed(doc("b")).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.load(C).unwrap().unwrap().root, b"a");
        assert_eq!(store.current_revision(C).unwrap(), Some(0));
    }

    // ---- Test 2: conditional writes advance one revision at a time ----
    #[test]
    fn compare_and_swap_checks_revision() {
        let store = seeded();
        let event = store.compare_and_swap(0, doc("r1"), change("/a")).unwrap();
        assert_eq!((event.token, event.revision), (1, 1));

        let err = store.compare_and_swap(0, doc("stale"), change("/b")).unwrap_err();
        assert_eq!(
            err,
            StoreError::RevisionMismatch {
                expected: 0,
                actual: 1
            }
        );
        let stored = store.load(C).unwrap().unwrap();
        assert_eq!((stored.revision, stored.root), (1, b"r1".to_vec()));
    }

    // ---- Test 3: a stream replays history, then follows live changes ----
    #[tokio::test]
    async fn stream_replays_then_follows() {
        let store = seeded();
        store.compare_and_swap(0, doc("r1"), change("/a")).unwrap();
        store.compare_and_swap(1, doc("r2"), change("/b")).unwrap();

        let mut stream = store.watch(C, 1).unwrap();
        store.compare_and_swap(2, doc("r3"), change("/c")).unwrap();

        assert_eq!(stream.next().await.unwrap().token, 2);
        let live = stream.next().await.unwrap();
        assert_eq!(live.token, 3);
        assert_eq!(live.op.path().to_string(), "/c");
        assert_eq!(stream.position(), 3);
    }

    // ---- Test 4: tokens older than the retained history expire ----
    #[test]
    fn old_tokens_expire() {
        let store = InMemoryDurableStore::new().with_retention(2);
        store.seed(doc("r0")).unwrap();
        for rev in 0..4 {
            store.compare_and_swap(rev, doc("r"), change("/a")).unwrap();
        }
        assert!(store.watch(C, 2).is_ok());
        assert_eq!(
            store.watch(C, 1).unwrap_err(),
            StoreError::TokenExpired { token: 1 }
        );
        assert!(matches!(
            store.watch(C, 9),
            Err(StoreError::TokenExpired { .. })
        ));
        store.expire_history(C);
        assert!(store.watch(C, 3).is_err());
        assert!(store.watch(C, 4).is_ok());
    }

    // ---- Test 5: a lagging subscriber is told its token expired ----
    #[tokio::test]
    async fn lagging_stream_expires() {
        let store = InMemoryDurableStore::new().with_feed_capacity(2);
        store.seed(doc("r0")).unwrap();
        let mut stream = store.watch(C, 0).unwrap();
        for rev in 0..5 {
            store.compare_and_swap(rev, doc("r"), change("/a")).unwrap();
        }
        assert!(matches!(
            stream.next().await,
            Err(StoreError::TokenExpired { token: 0 })
        ));
    }

    // ---- Test 6: disconnect closes streams and rejects calls ----
    #[tokio::test]
    async fn disconnect_closes_streams() {
        let store = seeded();
        let mut stream = store.watch(C, 0).unwrap();
        store.disconnect();
        assert!(matches!(
            stream.next().await,
            Err(StoreError::Unavailable { .. })
        ));
        assert!(matches!(store.load(C), Err(StoreError::Unavailable { .. })));
        assert!(store.peek(C).is_some());

        store.reconnect();
        assert!(store.is_online());
        assert_eq!(store.current_revision(C).unwrap(), Some(0));
    }
}
