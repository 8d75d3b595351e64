//! Boundary to the external durable store.

use std::collections::VecDeque;

use arbor_tree::Diagnostics;
use arbor_types::Path;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::{StoreError, StoreResult};

/// Position in a collection's change history. A stream opened at token `t`
/// delivers every change with a greater token.
pub type ResumeToken = u64;

/// The durable state of one tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableDocument {
    pub collection: String,
    /// 0 when seeded, +1 per successful conditional write.
    pub revision: u64,
    /// Fingerprint of the schema the root was encoded with.
    pub manifest: String,
    /// The encoded root.
    pub root: Vec<u8>,
}

/// What one conditional write changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    Replace { path: Path, payload: Vec<u8> },
    Delete { path: Path },
}

impl ChangeOp {
    pub fn path(&self) -> &Path {
        match self {
            ChangeOp::Replace { path, .. } | ChangeOp::Delete { path } => path,
        }
    }
}

/// The change a writer hands to [`DurableStore::compare_and_swap`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub op: ChangeOp,
    /// Diagnostic attributes of the submitting thread.
    pub diagnostics: Diagnostics,
}

/// One entry of the change feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub token: ResumeToken,
    /// The document revision this change produced.
    pub revision: u64,
    pub op: ChangeOp,
    pub diagnostics: Diagnostics,
}

/// An external store holding one document per collection, with an ordered
/// change feed per collection.
pub trait DurableStore: Send + Sync {
    fn load(&self, collection: &str) -> StoreResult<Option<DurableDocument>>;

    /// Create the document at revision 0 unless one exists. Returns the
    /// document that is stored afterwards, which is the existing one if
    /// another writer seeded first.
    fn seed(&self, document: DurableDocument) -> StoreResult<DurableDocument>;

    /// Store `document` as revision `expected + 1` if the stored revision is
    /// still `expected`, and publish `change` on the feed.
    fn compare_and_swap(
        &self,
        expected: u64,
        document: DurableDocument,
        change: Change,
    ) -> StoreResult<ChangeEvent>;

    /// Revision of the stored document, `None` if there is none.
    fn current_revision(&self, collection: &str) -> StoreResult<Option<u64>>;

    /// Stream every change after `resume_after`.
    fn watch(&self, collection: &str, resume_after: ResumeToken) -> StoreResult<ChangeStream>;
}

/// Ordered stream of [`ChangeEvent`]s: retained history first, then live
/// changes.
pub struct ChangeStream {
    backlog: VecDeque<ChangeEvent>,
    live: broadcast::Receiver<ChangeEvent>,
    last: ResumeToken,
}

impl ChangeStream {
    /// `backlog` must hold every retained change after `resume_after` and
    /// `live` must have been subscribed before the backlog was collected.
    pub fn new(
        resume_after: ResumeToken,
        backlog: impl IntoIterator<Item = ChangeEvent>,
        live: broadcast::Receiver<ChangeEvent>,
    ) -> Self {
        Self {
            backlog: backlog.into_iter().collect(),
            live,
            last: resume_after,
        }
    }

    /// Token of the last delivered change.
    pub fn position(&self) -> ResumeToken {
        self.last
    }

    /// The next change. A subscriber that fell behind the live channel gets
    /// [`StoreError::TokenExpired`]; a closed feed gets
    /// [`StoreError::Unavailable`].
    pub async fn next(&mut self) -> StoreResult<ChangeEvent> {
        while let Some(event) = self.backlog.pop_front() {
            if event.token > self.last {
                self.last = event.token;
                return Ok(event);
            }
        }
        loop {
            match self.live.recv().await {
                Ok(event) if event.token <= self.last => continue,
                Ok(event) => {
                    self.last = event.token;
                    return Ok(event);
                }
                Err(RecvError::Lagged(_)) => {
                    return Err(StoreError::TokenExpired { token: self.last })
                }
                Err(RecvError::Closed) => {
                    return Err(StoreError::unavailable("change feed closed"))
                }
            }
        }
    }
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("position", &self.last)
            .field("backlog", &self.backlog.len())
            .finish()
    }
}
