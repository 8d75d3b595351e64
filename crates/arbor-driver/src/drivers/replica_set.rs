//! In-process fan-out of one logical tree to several tree instances.
//!
//! Every member of a [`ReplicaSet`] sees the same updates in the same
//! order. Fan-out is serialized by one lock; an update submitted while the
//! same thread is already fanning out (typically from a hook) is queued and
//! applied to every member once the current update has reached all of them.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use arbor_tree::{StateTree, Update};
use arbor_types::Node;
use tracing::{debug, info, warn};

use crate::driver::{Driver, TreeMeta};
use crate::error::{DriverError, DriverResult};
use crate::stack::DriverFactory;

thread_local! {
    static FANNING_OUT: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

struct Member {
    name: String,
    state: Weak<StateTree>,
    downstream: Weak<dyn Driver>,
}

#[derive(Default)]
struct Shared {
    members: Mutex<Vec<Member>>,
    fan_out: Mutex<()>,
    deferred: Mutex<VecDeque<Update>>,
}

impl Shared {
    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    /// Live members, pruning those whose tree instance was dropped.
    fn live(&self) -> Vec<(String, Arc<StateTree>, Arc<dyn Driver>)> {
        let mut members = self.members.lock().expect("lock poisoned");
        members.retain(|m| m.state.strong_count() > 0 && m.downstream.strong_count() > 0);
        members
            .iter()
            .filter_map(|m| Some((m.name.clone(), m.state.upgrade()?, m.downstream.upgrade()?)))
            .collect()
    }

    fn apply_everywhere(&self, update: &Update) -> DriverResult<()> {
        let mut first_error = None;
        for (name, _, downstream) in self.live() {
            if let Err(e) = downstream.submit(update.clone()) {
                debug!(member = %name, error = %e, "replica member rejected update");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

struct FanOutGuard {
    key: usize,
}

impl FanOutGuard {
    fn enter(key: usize) -> Self {
        FANNING_OUT.with(|f| f.borrow_mut().insert(key));
        Self { key }
    }

    fn active(key: usize) -> bool {
        FANNING_OUT.with(|f| f.borrow().contains(&key))
    }
}

impl Drop for FanOutGuard {
    fn drop(&mut self) {
        let _ = FANNING_OUT.try_with(|f| f.borrow_mut().remove(&self.key));
    }
}

/// A group of tree instances in one process that share one logical tree.
///
/// Each instance joins by building its stack with [`driver_factory`]. The
/// first member starts from its own default root; later members start from
/// the current root of an existing member.
///
/// [`driver_factory`]: ReplicaSet::driver_factory
#[derive(Clone, Default)]
pub struct ReplicaSet {
    shared: Arc<Shared>,
}

impl ReplicaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory that joins the tree being built to this set.
    pub fn driver_factory(&self) -> DriverFactory {
        let shared = self.shared.clone();
        Box::new(move |meta: &TreeMeta, downstream: Arc<dyn Driver>| {
            Ok(Arc::new(ReplicaSetDriver {
                shared,
                name: meta.name.clone(),
                state: meta.state.clone(),
                downstream,
            }) as Arc<dyn Driver>)
        })
    }

    /// Number of live members.
    pub fn len(&self) -> usize {
        self.shared.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct ReplicaSetDriver {
    shared: Arc<Shared>,
    name: String,
    state: Arc<StateTree>,
    downstream: Arc<dyn Driver>,
}

impl Driver for ReplicaSetDriver {
    /// Joins the set. A later joiner starts from the current root of an
    /// existing member and initializes its own tree before any further
    /// update can be fanned out.
    fn initial_root(&self) -> DriverResult<Node> {
        let _order = self.shared.fan_out.lock().expect("lock poisoned");
        let existing = self.shared.live().into_iter().next();
        let root = match existing {
            Some((from, state, _)) => {
                let snapshot = state.snapshot()?;
                info!(
                    member = %self.name,
                    from = %from,
                    revision = snapshot.revision,
                    "joining replica set from existing member"
                );
                snapshot.root.clone()
            }
            None => self.downstream.initial_root()?,
        };
        if !self.state.is_initialized() {
            self.state.initialize(root.clone())?;
        }
        self.shared
            .members
            .lock()
            .expect("lock poisoned")
            .push(Member {
                name: self.name.clone(),
                state: Arc::downgrade(&self.state),
                downstream: Arc::downgrade(&self.downstream),
            });
        Ok(root)
    }

    fn submit(&self, update: Update) -> DriverResult<()> {
        let key = self.shared.key();
        if FanOutGuard::active(key) {
            self.shared
                .deferred
                .lock()
                .expect("lock poisoned")
                .push_back(update);
            return Ok(());
        }

        let _order = self.shared.fan_out.lock().expect("lock poisoned");
        let _guard = FanOutGuard::enter(key);
        let result = self.shared.apply_everywhere(&update);
        loop {
            let next = self.shared.deferred.lock().expect("lock poisoned").pop_front();
            let Some(next) = next else { break };
            if let Err(e) = self.shared.apply_everywhere(&next) {
                warn!(error = %e, target = %next.target().path(), "deferred replica update failed");
            }
        }
        result
    }

    fn flush(&self) -> DriverResult<()> {
        if !self.state.is_initialized() {
            return Err(DriverError::Update(arbor_tree::UpdateError::NotInitialized));
        }
        let mut first_error = None;
        for (_, _, downstream) in self.shared.live() {
            if let Err(e) = downstream.flush() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
