//! Thread-scoped read sessions.
//!
//! Opening a session pins one snapshot of a tree for the calling thread.
//! Every resolve on that thread sees the pinned snapshot until the guard
//! drops. Opening a session while one is already open on the same tree
//! shares the outer pin; [`StateTree::pinned_session`] always pushes a new
//! one.
//!
//! [`StateTree::pinned_session`]: crate::StateTree::pinned_session

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use arbor_refs::{resolve, Reference, ResolutionError};
use arbor_types::Node;

use crate::state::{Snapshot, TreeId};

struct Frame {
    id: u64,
    snapshot: Arc<Snapshot>,
    depth: usize,
}

thread_local! {
    static SESSIONS: RefCell<HashMap<TreeId, Vec<Frame>>> = RefCell::new(HashMap::new());
    static NEXT_FRAME: Cell<u64> = const { Cell::new(0) };
}

fn next_frame_id() -> u64 {
    NEXT_FRAME.with(|n| {
        let id = n.get();
        n.set(id + 1);
        id
    })
}

/// Guard for a pinned snapshot. Not `Send`: the pin belongs to the thread
/// that opened it.
#[must_use = "the session closes when the guard is dropped"]
pub struct ReadSession {
    tree: TreeId,
    /// The frame this guard holds open; guards may drop out of order.
    frame: u64,
    snapshot: Arc<Snapshot>,
    _not_send: PhantomData<*const ()>,
}

impl ReadSession {
    /// Join the innermost open session on `tree`, or pin `current()`.
    pub(crate) fn open(tree: TreeId, current: impl FnOnce() -> Arc<Snapshot>) -> Self {
        let (frame, snapshot) = SESSIONS.with(|s| {
            let mut sessions = s.borrow_mut();
            let frames = sessions.entry(tree).or_default();
            match frames.last_mut() {
                Some(top) => {
                    top.depth += 1;
                    (top.id, top.snapshot.clone())
                }
                None => {
                    let snapshot = current();
                    let id = next_frame_id();
                    frames.push(Frame {
                        id,
                        snapshot: snapshot.clone(),
                        depth: 1,
                    });
                    (id, snapshot)
                }
            }
        });
        Self {
            tree,
            frame,
            snapshot,
            _not_send: PhantomData,
        }
    }

    /// Push a fresh pin of `snapshot`, regardless of any open session.
    pub(crate) fn pin(tree: TreeId, snapshot: Arc<Snapshot>) -> Self {
        let frame = next_frame_id();
        SESSIONS.with(|s| {
            s.borrow_mut().entry(tree).or_default().push(Frame {
                id: frame,
                snapshot: snapshot.clone(),
                depth: 1,
            })
        });
        Self {
            tree,
            frame,
            snapshot,
            _not_send: PhantomData,
        }
    }

    /// The snapshot pinned by the innermost open session on `tree`.
    pub(crate) fn current(tree: TreeId) -> Option<Arc<Snapshot>> {
        SESSIONS
            .try_with(|s| {
                s.borrow()
                    .get(&tree)
                    .and_then(|frames| frames.last())
                    .map(|f| f.snapshot.clone())
            })
            .ok()
            .flatten()
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn revision(&self) -> u64 {
        self.snapshot.revision
    }

    pub fn root(&self) -> &Node {
        &self.snapshot.root
    }

    /// Resolve against the pinned snapshot.
    pub fn resolve(&self, reference: &Reference) -> Result<Node, ResolutionError> {
        resolve(reference, &self.snapshot.root)
    }
}

impl Drop for ReadSession {
    fn drop(&mut self) {
        let _ = SESSIONS.try_with(|s| {
            let mut sessions = s.borrow_mut();
            let Some(frames) = sessions.get_mut(&self.tree) else {
                return;
            };
            if let Some(index) = frames.iter().rposition(|f| f.id == self.frame) {
                frames[index].depth -= 1;
                if frames[index].depth == 0 {
                    frames.remove(index);
                }
            }
            if frames.is_empty() {
                sessions.remove(&self.tree);
            }
        });
    }
}

impl std::fmt::Debug for ReadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSession")
            .field("tree", &self.tree)
            .field("revision", &self.snapshot.revision)
            .finish()
    }
}
