use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use arbor_tree::{entry_at, StateTree, Update};
use arbor_types::{Node, Path};
use tracing::debug;

use crate::driver::{Driver, TreeMeta};
use crate::error::{DriverError, DriverResult};
use crate::stack::DriverFactory;

#[derive(Clone, Debug)]
enum Expected {
    Value(Node),
    Absent,
}

/// Test-harness driver that checks the flush barrier.
///
/// It remembers the last unconditional value submitted for each target.
/// After a successful downstream `flush` it reads the local tree and fails
/// with [`DriverError::FlushVerification`] if any of those values is
/// missing. Conditional updates, failed submissions and overlapping writes
/// make the affected expectations unknowable, so they are dropped.
pub struct FlushVerifier {
    state: Arc<StateTree>,
    downstream: Arc<dyn Driver>,
    expected: Mutex<BTreeMap<Path, Expected>>,
}

impl FlushVerifier {
    pub fn new(state: Arc<StateTree>, downstream: Arc<dyn Driver>) -> Self {
        Self {
            state,
            downstream,
            expected: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn factory() -> DriverFactory {
        Box::new(|meta: &TreeMeta, downstream: Arc<dyn Driver>| {
            Ok(Arc::new(FlushVerifier::new(meta.state.clone(), downstream)) as Arc<dyn Driver>)
        })
    }

    /// Number of targets that will be checked at the next flush.
    pub fn tracked(&self) -> usize {
        self.expected.lock().expect("lock poisoned").len()
    }

    fn forget_overlapping(expected: &mut BTreeMap<Path, Expected>, path: &Path) {
        expected.retain(|tracked, _| !(tracked.is_prefix_of(path) || path.is_prefix_of(tracked)));
    }

    fn record(&self, update: &Update) {
        let path = update.target().path();
        let mut expected = self.expected.lock().expect("lock poisoned");
        Self::forget_overlapping(&mut expected, path);
        match update {
            Update::Replace { value, .. } => {
                expected.insert(path.clone(), Expected::Value(value.clone()));
            }
            Update::Delete { .. } => {
                expected.insert(path.clone(), Expected::Absent);
            }
            _ => {}
        }
    }

    fn verify(&self) -> DriverResult<()> {
        let expected = std::mem::take(&mut *self.expected.lock().expect("lock poisoned"));
        if expected.is_empty() {
            return Ok(());
        }
        let snapshot = self.state.snapshot()?;
        debug!(targets = expected.len(), revision = snapshot.revision, "verifying flush");
        for (path, want) in expected {
            let found = entry_at(&snapshot.root, &path).ok().flatten();
            let ok = match (&want, &found) {
                (Expected::Absent, None) => true,
                (Expected::Value(v), Some(f)) => f == v || listing_member_matches(f, v),
                _ => false,
            };
            if !ok {
                return Err(DriverError::FlushVerification {
                    path: path.to_string(),
                    expected: describe(match &want {
                        Expected::Value(v) => Some(v),
                        Expected::Absent => None,
                    }),
                    found: describe(found.as_ref()),
                });
            }
        }
        Ok(())
    }
}

fn listing_member_matches(found: &Node, wanted: &Node) -> bool {
    match found {
        Node::Id(member) => wanted.entity_id() == Some(member),
        _ => false,
    }
}

fn describe(node: Option<&Node>) -> String {
    match node {
        Some(n) => format!("{n:?}"),
        None => "nothing".into(),
    }
}

impl Driver for FlushVerifier {
    fn initial_root(&self) -> DriverResult<Node> {
        self.downstream.initial_root()
    }

    fn submit(&self, update: Update) -> DriverResult<()> {
        self.record(&update);
        let result = self.downstream.submit(update.clone());
        if result.is_err() {
            let mut expected = self.expected.lock().expect("lock poisoned");
            Self::forget_overlapping(&mut expected, update.target().path());
        }
        result
    }

    fn flush(&self) -> DriverResult<()> {
        self.downstream.flush()?;
        self.verify()
    }
}
