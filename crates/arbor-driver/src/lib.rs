//! Driver pipeline for Arbor state trees.
//!
//! Every update to a tree instance enters an ordered stack of [`Driver`]s.
//! Each driver may transform, delay, forward or replicate what it receives
//! before handing it to the next one. The innermost driver,
//! [`LocalDriver`], commits to the local [`StateTree`]. A stack is a list of
//! [`DriverFactory`] closures composed once, when the instance is built.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use arbor_driver::{BufferingDriver, Driver, DriverStack, LocalDriver, TreeMeta};
//! use arbor_refs::Reference;
//! use arbor_tree::{PreconditionPolicy, StateTree};
//! use arbor_types::{Node, Record, RecordShape, Schema, TypeRef};
//!
//! let schema = Arc::new(
//!     Schema::new(TypeRef::named("Doc"))
//!         .record("Doc", RecordShape::new().field("name", TypeRef::Text)),
//! );
//! let state = Arc::new(StateTree::new("doc", schema.clone(), PreconditionPolicy::default()));
//! let local = Arc::new(LocalDriver::new(
//!     state.clone(),
//!     Arc::new(|| Node::from(Record::new("Doc").with_field("name", "Bob"))),
//! ));
//!
//! let driver = DriverStack::new()
//!     .with("buffer", BufferingDriver::factory())
//!     .build(&TreeMeta::new(state.clone()), local)
//!     .unwrap();
//! state.initialize(driver.initial_root().unwrap()).unwrap();
//!
//! let name = Reference::parse(&schema, "/name").unwrap();
//! driver.submit_replacement(name.clone(), Node::text("Alice")).unwrap();
//! driver.flush().unwrap();
//!
//! let _session = state.read_session().unwrap();
//! assert_eq!(state.resolve(&name).unwrap(), Node::text("Alice"));
//! ```

pub mod driver;
pub mod drivers;
pub mod error;
pub mod stack;

// Re-exports for convenience.
pub use driver::{Driver, TreeMeta};
pub use drivers::buffering::BufferingDriver;
pub use drivers::diagnostic::{DiagnosticDeriver, DiagnosticScopeDriver};
pub use drivers::forwarding::ForwardingDriver;
pub use drivers::local::{DefaultRoot, LocalDriver};
pub use drivers::replica_set::ReplicaSet;
pub use drivers::verifier::FlushVerifier;
pub use error::{DriverError, DriverResult};
pub use stack::{DriverFactory, DriverStack};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex, OnceLock};

    use arbor_refs::Reference;
    use arbor_tree::{
        Commit, CommitObserver, DiagnosticContext, Diagnostics, PreconditionPolicy, StateTree,
        Update, UpdateError,
    };
    use arbor_types::{Node, Record, RecordShape, Schema, TypeRef};

    /// Helper: a document with a name and a counter.
    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(TypeRef::named("Doc")).record(
                "Doc",
                RecordShape::new()
                    .field("name", TypeRef::Text)
                    .field("counter", TypeRef::Int),
            ),
        )
    }

    fn default_root() -> DefaultRoot {
        Arc::new(|| {
            Node::from(
                Record::new("Doc")
                    .with_field("name", "Bob")
                    .with_field("counter", 0i64),
            )
        })
    }

    fn r(path: &str) -> Reference {
        Reference::parse(&schema(), path).unwrap()
    }

    /// Helper: build one tree instance over `stack`, the way the SDK does.
    fn instance(name: &str, stack: DriverStack) -> (Arc<StateTree>, Arc<dyn Driver>) {
        let state = Arc::new(StateTree::new(name, schema(), PreconditionPolicy::default()));
        let local = Arc::new(LocalDriver::new(state.clone(), default_root()));
        let driver = stack.build(&TreeMeta::new(state.clone()), local).unwrap();
        let root = driver.initial_root().unwrap();
        if !state.is_initialized() {
            state.initialize(root).unwrap();
        }
        (state, driver)
    }

    fn read(state: &StateTree, path: &str) -> Node {
        let _session = state.read_session().unwrap();
        state.resolve(&r(path)).unwrap()
    }

    /// Records the label of every driver a submission passes through.
    struct Tracing {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        downstream: Arc<dyn Driver>,
    }

    impl Driver for Tracing {
        fn initial_root(&self) -> DriverResult<Node> {
            self.downstream.initial_root()
        }
        fn submit(&self, update: Update) -> DriverResult<()> {
            self.log.lock().unwrap().push(self.label);
            self.downstream.submit(update)
        }
        fn flush(&self) -> DriverResult<()> {
            self.downstream.flush()
        }
    }

    fn tracing(label: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> DriverFactory {
        Box::new(move |_meta: &TreeMeta, downstream: Arc<dyn Driver>| {
            Ok(Arc::new(Tracing {
                label,
                log,
                downstream,
            }) as Arc<dyn Driver>)
        })
    }

    /// Swallows every submission without forwarding it.
    struct Lossy;

    impl Driver for Lossy {
        fn initial_root(&self) -> DriverResult<Node> {
            Ok(default_root()())
        }
        fn submit(&self, _update: Update) -> DriverResult<()> {
            Ok(())
        }
        fn flush(&self) -> DriverResult<()> {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // 1. An empty stack is just the local driver
    // -----------------------------------------------------------------------
    #[test]
    fn empty_stack_commits_directly() {
        let (state, driver) = instance("plain", DriverStack::new());
        assert_eq!(state.revision(), Some(0));
        driver
            .submit_replacement(r("/name"), Node::text("Alice"))
            .unwrap();
        assert_eq!(state.revision(), Some(1));
        assert_eq!(read(&state, "/name"), Node::text("Alice"));
    }

    // -----------------------------------------------------------------------
    // 2. First factory pushed is the outermost driver
    // -----------------------------------------------------------------------
    #[test]
    fn stack_order_is_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stack = DriverStack::new()
            .with("outer", tracing("outer", log.clone()))
            .with("middle", tracing("middle", log.clone()))
            .with("inner", tracing("inner", log.clone()));
        assert_eq!(stack.labels(), vec!["outer", "middle", "inner"]);
        assert_eq!(stack.len(), 3);

        let (_state, driver) = instance("ordered", stack);
        driver.submit_replacement(r("/counter"), 1i64.into()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["outer", "middle", "inner"]);
    }

    // -----------------------------------------------------------------------
    // 3. Forwarding driver passes everything through
    // -----------------------------------------------------------------------
    #[test]
    fn forwarding_is_transparent() {
        let (state, driver) = instance(
            "forwarded",
            DriverStack::new()
                .with("fwd-1", ForwardingDriver::factory())
                .with("fwd-2", ForwardingDriver::factory()),
        );
        driver
            .submit_replacement(r("/name"), Node::text("Alice"))
            .unwrap();
        driver.flush().unwrap();
        assert_eq!(read(&state, "/name"), Node::text("Alice"));

        let err = driver
            .submit_creation(r("/name"), Node::text("Carol"))
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Update(UpdateError::AlreadyExists { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // 4. Buffering holds updates until flush, replays in order
    // -----------------------------------------------------------------------
    #[test]
    fn buffering_replays_on_flush() {
        let (state, driver) = instance(
            "buffered",
            DriverStack::new().with("buffer", BufferingDriver::factory()),
        );
        driver
            .submit_replacement(r("/name"), Node::text("Alice"))
            .unwrap();
        driver.submit_replacement(r("/counter"), 1i64.into()).unwrap();
        driver.submit_replacement(r("/counter"), 2i64.into()).unwrap();
        assert_eq!(state.revision(), Some(0));
        assert_eq!(read(&state, "/name"), Node::text("Bob"));

        driver.flush().unwrap();
        assert_eq!(state.revision(), Some(3));
        assert_eq!(read(&state, "/counter"), Node::Int(2));
    }

    // -----------------------------------------------------------------------
    // 5. Buffering reports the first replay error but applies the rest
    // -----------------------------------------------------------------------
    #[test]
    fn buffering_returns_first_replay_error() {
        let (state, driver) = instance(
            "buffered",
            DriverStack::new().with("buffer", BufferingDriver::factory()),
        );
        driver
            .submit_creation(r("/name"), Node::text("dup"))
            .unwrap();
        driver.submit_deletion(r("/counter")).unwrap();
        driver.submit_replacement(r("/counter"), 7i64.into()).unwrap();

        let err = driver.flush().unwrap_err();
        assert!(matches!(
            err,
            DriverError::Update(UpdateError::AlreadyExists { .. })
        ));
        assert_eq!(read(&state, "/counter"), Node::Int(7));
        // The queue was drained even though replay failed.
        driver.flush().unwrap();
    }

    // -----------------------------------------------------------------------
    // 6. Diagnostic scope attributes reach commit observers
    // -----------------------------------------------------------------------
    #[test]
    fn diagnostic_scope_reaches_commits() {
        #[derive(Default)]
        struct Capture(Mutex<Vec<Diagnostics>>);
        impl CommitObserver for Capture {
            fn observe(&self, commit: &Commit) {
                self.0.lock().unwrap().push(commit.diagnostics.clone());
            }
        }

        let (state, driver) = instance(
            "diag",
            DriverStack::new().with("diag", DiagnosticScopeDriver::factory()),
        );
        let capture = Arc::new(Capture::default());
        state.add_observer(capture.clone());

        {
            let _outer = DiagnosticContext::enter(Diagnostics::new().with("user", "alice"));
            driver
                .submit_replacement(r("/name"), Node::text("Alice"))
                .unwrap();
        }

        let seen = capture.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get("arbor.op"), Some("replace"));
        assert_eq!(seen[0].get("arbor.target"), Some("/name"));
        assert_eq!(seen[0].get("user"), Some("alice"));
        drop(seen);
        assert!(DiagnosticContext::current().is_empty());
    }

    // -----------------------------------------------------------------------
    // 7. Replica set fans out to every member
    // -----------------------------------------------------------------------
    #[test]
    fn replica_set_fans_out() {
        let set = ReplicaSet::new();
        let (a, da) = instance("a", DriverStack::new().with("replica", set.driver_factory()));
        let (b, db) = instance("b", DriverStack::new().with("replica", set.driver_factory()));
        assert_eq!(set.len(), 2);

        da.submit_replacement(r("/name"), Node::text("Alice")).unwrap();
        db.submit_replacement(r("/counter"), 5i64.into()).unwrap();
        da.flush().unwrap();

        for state in [&a, &b] {
            assert_eq!(read(state, "/name"), Node::text("Alice"));
            assert_eq!(read(state, "/counter"), Node::Int(5));
            assert_eq!(state.revision(), Some(2));
        }
    }

    // -----------------------------------------------------------------------
    // 8. Late joiner starts from the current shared state
    // -----------------------------------------------------------------------
    #[test]
    fn replica_set_late_joiner_sees_prior_updates() {
        let set = ReplicaSet::new();
        let (_a, da) = instance("a", DriverStack::new().with("replica", set.driver_factory()));
        da.submit_replacement(r("/name"), Node::text("Alice")).unwrap();
        da.submit_replacement(r("/counter"), 1i64.into()).unwrap();
        da.submit_replacement(r("/counter"), 2i64.into()).unwrap();

        let (late, dl) = instance("late", DriverStack::new().with("replica", set.driver_factory()));
        assert_eq!(read(&late, "/name"), Node::text("Alice"));
        assert_eq!(read(&late, "/counter"), Node::Int(2));
        // The joiner starts at its own revision 0.
        assert_eq!(late.revision(), Some(0));

        dl.submit_replacement(r("/counter"), 3i64.into()).unwrap();
        da.flush().unwrap();
        dl.flush().unwrap();
        assert_eq!(read(&late, "/counter"), Node::Int(3));
    }

    // -----------------------------------------------------------------------
    // 9. Dropped members leave the set
    // -----------------------------------------------------------------------
    #[test]
    fn replica_set_prunes_dropped_members() {
        let set = ReplicaSet::new();
        let (a, da) = instance("a", DriverStack::new().with("replica", set.driver_factory()));
        {
            let _b = instance("b", DriverStack::new().with("replica", set.driver_factory()));
            assert_eq!(set.len(), 2);
        }
        assert_eq!(set.len(), 1);
        da.submit_replacement(r("/counter"), 9i64.into()).unwrap();
        assert_eq!(read(&a, "/counter"), Node::Int(9));
    }

    // -----------------------------------------------------------------------
    // 10. Submissions made while fanning out are applied afterwards
    // -----------------------------------------------------------------------
    #[test]
    fn replica_set_defers_reentrant_submissions() {
        struct BumpOnAlice {
            state: Arc<StateTree>,
            driver: OnceLock<Arc<dyn Driver>>,
        }
        impl CommitObserver for BumpOnAlice {
            fn observe(&self, _commit: &Commit) {}
            fn settle(&self) {
                let snapshot = self.state.snapshot().unwrap();
                let _session = self.state.pinned_session(snapshot);
                let name = self.state.resolve(&r("/name")).unwrap();
                let counter = self.state.resolve(&r("/counter")).unwrap();
                if name == Node::text("Alice") && counter == Node::Int(0) {
                    if let Some(driver) = self.driver.get() {
                        driver.submit_replacement(r("/counter"), 1i64.into()).unwrap();
                    }
                }
            }
        }

        let set = ReplicaSet::new();
        let (a, da) = instance("a", DriverStack::new().with("replica", set.driver_factory()));
        let (b, _db) = instance("b", DriverStack::new().with("replica", set.driver_factory()));

        let bump = Arc::new(BumpOnAlice {
            state: a.clone(),
            driver: OnceLock::new(),
        });
        let _ = bump.driver.set(da.clone());
        a.add_observer(bump);

        da.submit_replacement(r("/name"), Node::text("Alice")).unwrap();

        // Both members saw the name change before the counter change.
        for state in [&a, &b] {
            assert_eq!(read(state, "/name"), Node::text("Alice"));
            assert_eq!(read(state, "/counter"), Node::Int(1));
            assert_eq!(state.revision(), Some(2));
        }
    }

    // -----------------------------------------------------------------------
    // 11. Flush verifier accepts a faithful pipeline
    // -----------------------------------------------------------------------
    #[test]
    fn flush_verifier_accepts_faithful_pipeline() {
        let (_state, driver) = instance(
            "verified",
            DriverStack::new()
                .with("verify", FlushVerifier::factory())
                .with("buffer", BufferingDriver::factory()),
        );
        driver
            .submit_replacement(r("/name"), Node::text("Alice"))
            .unwrap();
        driver.submit_replacement(r("/counter"), 4i64.into()).unwrap();
        driver.flush().unwrap();
    }

    // -----------------------------------------------------------------------
    // 12. Flush verifier catches a pipeline that loses writes
    // -----------------------------------------------------------------------
    #[test]
    fn flush_verifier_detects_lost_write() {
        let lossy: DriverFactory = Box::new(|_meta: &TreeMeta, _downstream: Arc<dyn Driver>| {
            Ok(Arc::new(Lossy) as Arc<dyn Driver>)
        });
        let (_state, driver) = instance(
            "lossy",
            DriverStack::new()
                .with("verify", FlushVerifier::factory())
                .with("lossy", lossy),
        );
        driver
            .submit_replacement(r("/name"), Node::text("Alice"))
            .unwrap();
        let err = driver.flush().unwrap_err();
        match err {
            DriverError::FlushVerification { path, .. } => assert_eq!(path, "/name"),
            other => panic!("unexpected error: {other}"),
        }
        // Expectations are cleared once checked.
        driver.flush().unwrap();
    }

    // -----------------------------------------------------------------------
    // 13. Conditional replacement through the pipeline
    // -----------------------------------------------------------------------
    #[test]
    fn conditional_replacement_through_stack() {
        let (state, driver) = instance(
            "cond",
            DriverStack::new().with("fwd", ForwardingDriver::factory()),
        );
        driver
            .submit_conditional_replacement(
                r("/name"),
                Node::text("Alice"),
                r("/counter"),
                0i64.into(),
            )
            .unwrap();
        assert_eq!(read(&state, "/name"), Node::text("Alice"));

        let err = driver
            .submit_conditional_replacement(
                r("/name"),
                Node::text("Carol"),
                r("/counter"),
                5i64.into(),
            )
            .unwrap_err();
        assert!(err.is_expected_conflict());
        assert!(!err.is_connectivity());
        assert_eq!(read(&state, "/name"), Node::text("Alice"));
    }

    // -----------------------------------------------------------------------
    // 14. Error classification
    // -----------------------------------------------------------------------
    #[test]
    fn error_classification() {
        assert!(DriverError::Disconnected {
            reason: "feed lost".into()
        }
        .is_connectivity());
        assert!(DriverError::FlushTimeout(std::time::Duration::from_secs(1)).is_connectivity());
        assert!(DriverError::Conflict {
            path: "/counter".into(),
            attempts: 5
        }
        .is_expected_conflict());
        assert!(!DriverError::Closed.is_expected_conflict());
        assert!(!DriverError::Update(UpdateError::NotInitialized).is_expected_conflict());
    }

    // -----------------------------------------------------------------------
    // 15. A flush waits for a replay running on another thread
    // -----------------------------------------------------------------------

    /// Blocks each submission until the test releases it.
    struct Gate {
        entered: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
        downstream: Arc<dyn Driver>,
    }

    impl Driver for Gate {
        fn initial_root(&self) -> DriverResult<Node> {
            self.downstream.initial_root()
        }
        fn submit(&self, update: Update) -> DriverResult<()> {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            self.downstream.submit(update)
        }
        fn flush(&self) -> DriverResult<()> {
            self.downstream.flush()
        }
    }

    #[test]
    fn flush_waits_for_replay_in_progress() {
        use std::sync::mpsc;
        use std::time::Duration;

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let (state, driver) = instance(
            "buffered-race",
            DriverStack::new()
                .with("buffer", BufferingDriver::factory())
                .with(
                    "gate",
                    Box::new(move |_meta: &TreeMeta, downstream: Arc<dyn Driver>| {
                        Ok(Arc::new(Gate {
                            entered: Mutex::new(entered_tx),
                            release: Mutex::new(release_rx),
                            downstream,
                        }) as Arc<dyn Driver>)
                    }),
                ),
        );

        driver
            .submit_replacement(r("/name"), Node::text("Alice"))
            .unwrap();

        let replaying = {
            let driver = driver.clone();
            std::thread::spawn(move || driver.flush())
        };
        entered_rx.recv().unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let waiting = {
            let driver = driver.clone();
            let state = state.clone();
            std::thread::spawn(move || {
                driver.flush().unwrap();
                done_tx.send(read(&state, "/name")).unwrap();
            })
        };
        assert!(
            done_rx.recv_timeout(Duration::from_millis(100)).is_err(),
            "second flush returned while the first replay was still running"
        );

        release_tx.send(()).unwrap();
        assert_eq!(
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Node::text("Alice")
        );
        replaying.join().unwrap().unwrap();
        waiting.join().unwrap();
    }
}
