//! The per-instance serialization point.
//!
//! A [`StateTree`] owns the current [`Snapshot`] of one tree instance. All
//! transitions go through its commit lock, which gives every observer one
//! total order of `(old, new)` pairs. Readers never take the commit lock:
//! they clone the current `Arc<Snapshot>` and keep it as long as they like.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use arbor_refs::{Reference, ResolutionError};
use arbor_types::{Node, Path, Schema};
use tracing::{debug, info};

use crate::diagnostic::{DiagnosticContext, Diagnostics};
use crate::error::{Result, UpdateError};
use crate::precondition::PreconditionPolicy;
use crate::session::ReadSession;
use crate::update::{apply, Applied, Update, UpdateKind};

static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one tree instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeId(u64);

impl TreeId {
    fn next() -> Self {
        Self(NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tree-{}", self.0)
    }
}

/// One immutable version of the tree.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub root: Node,
    /// Local commit counter: 0 at initialization, +1 per commit.
    pub revision: u64,
}

/// A committed transition, handed to observers under the commit lock.
#[derive(Clone, Debug)]
pub struct Commit {
    pub old: Arc<Snapshot>,
    pub new: Arc<Snapshot>,
    /// The path the update targeted; `/` for whole-root replacement.
    pub target: Path,
    pub kind: UpdateKind,
    /// Attributes in force on the committing thread.
    pub diagnostics: Diagnostics,
}

/// Receives every commit of a [`StateTree`].
pub trait CommitObserver: Send + Sync {
    /// Called with the commit lock held; must not block on other commits.
    fn observe(&self, commit: &Commit);

    /// Called after the commit lock is released.
    fn settle(&self) {}
}

/// The current state of one tree instance.
pub struct StateTree {
    id: TreeId,
    name: String,
    schema: Arc<Schema>,
    policy: PreconditionPolicy,
    current: RwLock<Option<Arc<Snapshot>>>,
    commit_lock: Mutex<()>,
    initialized: Mutex<bool>,
    initialized_cond: Condvar,
    observers: RwLock<Vec<Arc<dyn CommitObserver>>>,
}

impl StateTree {
    pub fn new(name: impl Into<String>, schema: Arc<Schema>, policy: PreconditionPolicy) -> Self {
        Self {
            id: TreeId::next(),
            name: name.into(),
            schema,
            policy,
            current: RwLock::new(None),
            commit_lock: Mutex::new(()),
            initialized: Mutex::new(false),
            initialized_cond: Condvar::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TreeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn policy(&self) -> &PreconditionPolicy {
        &self.policy
    }

    /// Install the first root. Fails if a root is already present or if
    /// `root` does not match the schema.
    pub fn initialize(&self, root: Node) -> Result<Arc<Snapshot>> {
        let _guard = self.lock_commits();
        if self.current.read().expect("lock poisoned").is_some() {
            return Err(UpdateError::AlreadyInitialized);
        }
        self.schema
            .validate(&self.schema.root, &root)
            .map_err(|e| UpdateError::TypeMismatch {
                path: "/".into(),
                reason: e.to_string(),
            })?;
        let snapshot = Arc::new(Snapshot { root, revision: 0 });
        *self.current.write().expect("lock poisoned") = Some(snapshot.clone());

        let mut initialized = self.initialized.lock().expect("lock poisoned");
        *initialized = true;
        self.initialized_cond.notify_all();
        info!(tree = %self.name, id = %self.id, "state tree initialized");
        Ok(snapshot)
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.lock().expect("lock poisoned")
    }

    /// Block until [`initialize`](Self::initialize) has run or `timeout`
    /// elapses. Returns whether the tree is initialized.
    pub fn wait_until_initialized(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut initialized = self.initialized.lock().expect("lock poisoned");
        while !*initialized {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            initialized = self
                .initialized_cond
                .wait_timeout(initialized, deadline - now)
                .expect("lock poisoned")
                .0;
        }
        true
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Result<Arc<Snapshot>> {
        self.current
            .read()
            .expect("lock poisoned")
            .clone()
            .ok_or(UpdateError::NotInitialized)
    }

    pub fn revision(&self) -> Option<u64> {
        self.snapshot().ok().map(|s| s.revision)
    }

    /// Apply `update` and publish the result.
    ///
    /// Returns the new snapshot, or `None` if the update changed nothing.
    pub fn commit(&self, update: &Update) -> Result<Option<Arc<Snapshot>>> {
        let diagnostics = DiagnosticContext::current();
        let committed = {
            let _guard = self.lock_commits();
            let old = self.snapshot()?;
            match apply(&self.schema, &self.policy, &old.root, update)? {
                Applied::Unchanged => None,
                Applied::Changed(root) => Some(self.publish(
                    old,
                    root,
                    update.target().path().clone(),
                    update.kind(),
                    diagnostics,
                )),
            }
        };
        if committed.is_some() {
            self.settle_observers();
        }
        Ok(committed)
    }

    /// Replace the whole root as a single commit.
    pub fn replace_root(&self, root: Node) -> Result<Option<Arc<Snapshot>>> {
        self.commit(&Update::Replace {
            target: Reference::root(&self.schema),
            value: root,
        })
    }

    fn publish(
        &self,
        old: Arc<Snapshot>,
        root: Node,
        target: Path,
        kind: UpdateKind,
        diagnostics: Diagnostics,
    ) -> Arc<Snapshot> {
        let new = Arc::new(Snapshot {
            root,
            revision: old.revision + 1,
        });
        *self.current.write().expect("lock poisoned") = Some(new.clone());
        debug!(
            tree = %self.name,
            revision = new.revision,
            target = %target,
            kind = %kind,
            "committed"
        );
        let commit = Commit {
            old,
            new: new.clone(),
            target,
            kind,
            diagnostics,
        };
        for observer in self.observers.read().expect("lock poisoned").iter() {
            observer.observe(&commit);
        }
        new
    }

    fn settle_observers(&self) {
        let observers = self.observers.read().expect("lock poisoned").clone();
        for observer in observers {
            observer.settle();
        }
    }

    /// Run `f` on the current snapshot with the commit lock held, then
    /// settle observers. No commit can interleave with `f`.
    pub fn with_commit_lock<R>(&self, f: impl FnOnce(&Arc<Snapshot>) -> R) -> Result<R> {
        let result = {
            let _guard = self.lock_commits();
            let current = self.snapshot()?;
            f(&current)
        };
        self.settle_observers();
        Ok(result)
    }

    pub fn add_observer(&self, observer: Arc<dyn CommitObserver>) {
        self.observers.write().expect("lock poisoned").push(observer);
    }

    fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().expect("lock poisoned")
    }

    // -----------------------------------------------------------------------
    // Read sessions
    // -----------------------------------------------------------------------

    /// Pin the current snapshot for this thread, or join an open session.
    pub fn read_session(&self) -> Result<ReadSession> {
        let current = self.snapshot()?;
        Ok(ReadSession::open(self.id, move || current))
    }

    /// Push a new pin of `snapshot` for this thread.
    pub fn pinned_session(&self, snapshot: Arc<Snapshot>) -> ReadSession {
        ReadSession::pin(self.id, snapshot)
    }

    /// The snapshot pinned on this thread, if a session is open.
    pub fn session_snapshot(&self) -> Option<Arc<Snapshot>> {
        ReadSession::current(self.id)
    }

    /// Resolve `reference` in this thread's open session.
    pub fn resolve(&self, reference: &Reference) -> std::result::Result<Node, ResolutionError> {
        let snapshot = self
            .session_snapshot()
            .ok_or(ResolutionError::NoReadSession)?;
        arbor_refs::resolve(reference, &snapshot.root)
    }
}

impl fmt::Debug for StateTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTree")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("revision", &self.revision())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::{Catalog, Identifier, Record, RecordShape, TypeRef};

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(TypeRef::named("Doc"))
                .record(
                    "Doc",
                    RecordShape::new()
                        .field("name", TypeRef::Text)
                        .field("counter", TypeRef::Int)
                        .field("items", TypeRef::catalog(TypeRef::named("Item"))),
                )
                .record(
                    "Item",
                    RecordShape::new()
                        .field("id", TypeRef::Identifier)
                        .field("label", TypeRef::Text),
                ),
        )
    }

    fn root() -> Node {
        Record::new("Doc")
            .with_field("name", "Bob")
            .with_field("counter", 0i64)
            .with_field("items", Catalog::new())
            .into()
    }

    fn tree() -> StateTree {
        let tree = StateTree::new("test", schema(), PreconditionPolicy::default());
        tree.initialize(root()).unwrap();
        tree
    }

    fn r(path: &str) -> Reference {
        Reference::parse(&schema(), path).unwrap()
    }

    fn set_name(tree: &StateTree, name: &str) {
        tree.commit(&Update::Replace {
            target: r("/name"),
            value: Node::text(name),
        })
        .unwrap();
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u64, u64, String)>>,
        settled: Mutex<usize>,
    }

    impl CommitObserver for Recorder {
        fn observe(&self, commit: &Commit) {
            self.seen.lock().unwrap().push((
                commit.old.revision,
                commit.new.revision,
                commit.target.to_string(),
            ));
        }

        fn settle(&self) {
            *self.settled.lock().unwrap() += 1;
        }
    }

    // ---------------------------------------------------------------------
    // Initialization and commits
    // ---------------------------------------------------------------------

    #[test]
    fn initialize_once() {
        let tree = StateTree::new("t", schema(), PreconditionPolicy::default());
        assert!(!tree.is_initialized());
        assert!(matches!(tree.snapshot(), Err(UpdateError::NotInitialized)));
        tree.initialize(root()).unwrap();
        assert!(tree.is_initialized());
        assert!(matches!(
            tree.initialize(root()),
            Err(UpdateError::AlreadyInitialized)
        ));
        assert_eq!(tree.revision(), Some(0));
    }

    #[test]
    fn initialize_validates_root() {
        let tree = StateTree::new("t", schema(), PreconditionPolicy::default());
        let bad: Node = Record::new("Doc").with_field("name", "x").into();
        assert!(matches!(
            tree.initialize(bad),
            Err(UpdateError::TypeMismatch { .. })
        ));
        assert!(!tree.is_initialized());
    }

    #[test]
    fn commits_bump_revision_and_notify() {
        let tree = tree();
        let recorder = Arc::new(Recorder::default());
        tree.add_observer(recorder.clone());

        set_name(&tree, "Alice");
        set_name(&tree, "Carol");
        // no-op: same text
        set_name(&tree, "Carol");

        assert_eq!(tree.revision(), Some(2));
        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![(0, 1, "/name".to_string()), (1, 2, "/name".to_string())]
        );
        assert_eq!(*recorder.settled.lock().unwrap(), 2);
    }

    #[test]
    fn commit_captures_diagnostics() {
        struct Capture(Mutex<Option<Diagnostics>>);
        impl CommitObserver for Capture {
            fn observe(&self, commit: &Commit) {
                *self.0.lock().unwrap() = Some(commit.diagnostics.clone());
            }
        }
        let tree = tree();
        let capture = Arc::new(Capture(Mutex::new(None)));
        tree.add_observer(capture.clone());
        {
            let _scope = DiagnosticContext::enter(Diagnostics::new().with("user", "alice"));
            set_name(&tree, "Alice");
        }
        let seen = capture.0.lock().unwrap().clone().unwrap();
        assert_eq!(seen.get("user"), Some("alice"));
    }

    #[test]
    fn wait_until_initialized_from_another_thread() {
        let tree = Arc::new(StateTree::new("t", schema(), PreconditionPolicy::default()));
        assert!(!tree.wait_until_initialized(Duration::from_millis(10)));
        let waiter = {
            let tree = tree.clone();
            std::thread::spawn(move || tree.wait_until_initialized(Duration::from_secs(5)))
        };
        tree.initialize(root()).unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn replace_root_is_one_commit() {
        let tree = tree();
        let next: Node = Record::new("Doc")
            .with_field("name", "Zed")
            .with_field("counter", 9i64)
            .with_field("items", Catalog::new())
            .into();
        let snapshot = tree.replace_root(next).unwrap().unwrap();
        assert_eq!(snapshot.revision, 1);
    }

    // ---------------------------------------------------------------------
    // Read sessions
    // ---------------------------------------------------------------------

    #[test]
    fn resolve_requires_a_session() {
        let tree = tree();
        assert!(matches!(
            tree.resolve(&r("/name")),
            Err(ResolutionError::NoReadSession)
        ));
        let _session = tree.read_session().unwrap();
        assert_eq!(tree.resolve(&r("/name")).unwrap(), Node::text("Bob"));
    }

    #[test]
    fn session_pins_snapshot_against_later_commits() {
        let tree = tree();
        let session = tree.read_session().unwrap();
        set_name(&tree, "Alice");
        assert_eq!(tree.resolve(&r("/name")).unwrap(), Node::text("Bob"));
        drop(session);

        let _fresh = tree.read_session().unwrap();
        assert_eq!(tree.resolve(&r("/name")).unwrap(), Node::text("Alice"));
    }

    #[test]
    fn nested_sessions_share_the_outer_pin() {
        let tree = tree();
        let _outer = tree.read_session().unwrap();
        set_name(&tree, "Alice");
        {
            let inner = tree.read_session().unwrap();
            assert_eq!(inner.revision(), 0);
            assert_eq!(tree.resolve(&r("/name")).unwrap(), Node::text("Bob"));
        }
        // outer still open after the inner guard drops
        assert!(tree.session_snapshot().is_some());
    }

    #[test]
    fn pinned_session_overrides_and_restores() {
        let tree = tree();
        let _outer = tree.read_session().unwrap();
        set_name(&tree, "Alice");
        let latest = tree.snapshot().unwrap();
        {
            let _pinned = tree.pinned_session(latest);
            assert_eq!(tree.resolve(&r("/name")).unwrap(), Node::text("Alice"));
        }
        assert_eq!(tree.resolve(&r("/name")).unwrap(), Node::text("Bob"));
    }

    #[test]
    fn outer_session_dropped_before_pinned_one() {
        let tree = tree();
        let outer = tree.read_session().unwrap();
        set_name(&tree, "Alice");
        let pinned = tree.pinned_session(tree.snapshot().unwrap());
        drop(outer);
        assert_eq!(tree.resolve(&r("/name")).unwrap(), Node::text("Alice"));
        assert_eq!(tree.session_snapshot().unwrap().revision, 1);
        drop(pinned);
        assert!(tree.session_snapshot().is_none());
    }

    #[test]
    fn sessions_are_released_on_unwind() {
        let tree = Arc::new(tree());
        let t = tree.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _session = t.read_session().unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(tree.session_snapshot().is_none());
    }

    #[test]
    fn sessions_are_per_tree() {
        let a = tree();
        let b = tree();
        let _sa = a.read_session().unwrap();
        assert!(b.session_snapshot().is_none());
        assert!(b.resolve(&r("/name")).is_err());
    }

    #[test]
    fn sibling_subtrees_are_shared_across_snapshots() {
        let tree = tree();
        let before = tree.snapshot().unwrap();
        tree.commit(&Update::Create {
            target: r("/items/a"),
            value: Record::entity("Item", Identifier::new("a").unwrap())
                .with_field("label", "first")
                .into(),
        })
        .unwrap();
        let middle = tree.snapshot().unwrap();
        set_name(&tree, "Alice");
        let after = tree.snapshot().unwrap();

        let items = |s: &Snapshot| {
            arbor_refs::resolve_path(&s.root, &Path::parse("/items").unwrap()).unwrap()
        };
        assert!(!Node::same(&items(&before), &items(&middle)));
        assert!(Node::same(&items(&middle), &items(&after)));
    }
}
