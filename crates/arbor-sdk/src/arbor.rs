use std::sync::Arc;

use arbor_driver::{DefaultRoot, Driver, DriverFactory, DriverStack, LocalDriver, TreeMeta};
use arbor_hooks::{HookContext, HookDispatcher, HookFailure, HookHandle};
use arbor_refs::Reference;
use arbor_replica::{
    Codec, DurableStore, JsonCodec, ReplicaConfig, ReplicaHandle, ReplicatingDriver,
};
use arbor_tree::{PreconditionPolicy, ReadSession, Snapshot, StateTree};
use arbor_types::{Node, Schema};
use tokio::sync::broadcast;
use tracing::info;

use crate::config::ArborConfig;
use crate::error::{SdkError, SdkResult};

/// Builder for an [`Arbor`] instance.
pub struct ArborBuilder {
    name: String,
    schema: Arc<Schema>,
    default_root: Option<DefaultRoot>,
    stack: DriverStack,
    policy: PreconditionPolicy,
    replica: Option<ReplicaConfig>,
    store: Option<(Arc<dyn DurableStore>, Arc<dyn Codec>)>,
}

impl ArborBuilder {
    /// Root used when no other driver supplies one.
    pub fn default_root<F>(mut self, root: F) -> Self
    where
        F: Fn() -> Node + Send + Sync + 'static,
    {
        self.default_root = Some(Arc::new(root));
        self
    }

    /// Like [`default_root`](Self::default_root), with a fixed value.
    pub fn default_root_value(self, root: Node) -> Self {
        self.default_root(move || root.clone())
    }

    /// Add a driver below the ones added before it.
    pub fn driver(mut self, label: impl Into<String>, factory: DriverFactory) -> Self {
        self.stack = self.stack.with(label, factory);
        self
    }

    pub fn policy(mut self, policy: PreconditionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Apply the name, precondition policy and replica settings of `config`.
    pub fn config(mut self, config: &ArborConfig) -> Self {
        self.name = config.name.clone();
        self.policy = config.precondition.clone();
        if config.replica.is_some() {
            self.replica = config.replica.clone();
        }
        self
    }

    /// Replicate through `store`, encoding values as JSON. The replicating
    /// driver sits below every driver added with [`driver`](Self::driver).
    pub fn replicated(self, store: Arc<dyn DurableStore>) -> Self {
        self.replicated_with(store, Arc::new(JsonCodec::new()))
    }

    pub fn replicated_with(mut self, store: Arc<dyn DurableStore>, codec: Arc<dyn Codec>) -> Self {
        self.store = Some((store, codec));
        self
    }

    pub fn replica_config(mut self, config: ReplicaConfig) -> Self {
        self.replica = Some(config);
        self
    }

    /// Create the tree, compose the drivers and initialize from the root the
    /// outermost driver supplies.
    pub fn build(self) -> SdkResult<Arbor> {
        let default_root = self
            .default_root
            .ok_or_else(|| SdkError::MissingDefaultRoot(self.name.clone()))?;
        self.schema.validate_definitions()?;
        self.schema.validate(&self.schema.root, &default_root())?;

        let mut stack = self.stack;
        let mut replica = None;
        if let Some((store, codec)) = self.store {
            let config = self
                .replica
                .unwrap_or_else(|| ReplicaConfig::new(self.name.clone()));
            let (factory, handle) = ReplicatingDriver::factory_with_handle(store, codec, config);
            stack = stack.with("replica", factory);
            replica = Some(handle);
        }

        let state = Arc::new(StateTree::new(self.name.clone(), self.schema, self.policy));
        let hooks = HookDispatcher::attach(&state);
        let local = Arc::new(LocalDriver::new(state.clone(), default_root));
        let driver = stack.build(&TreeMeta::new(state.clone()), local)?;

        let root = driver.initial_root()?;
        if !state.is_initialized() {
            state.initialize(root)?;
        }
        info!(tree = %self.name, replicated = replica.is_some(), "arbor instance ready");

        Ok(Arbor {
            state,
            driver,
            hooks,
            replica,
        })
    }
}

/// One tree instance with its driver stack and hooks.
pub struct Arbor {
    state: Arc<StateTree>,
    driver: Arc<dyn Driver>,
    hooks: Arc<HookDispatcher>,
    replica: Option<ReplicaHandle>,
}

impl Arbor {
    pub fn builder(name: impl Into<String>, schema: Arc<Schema>) -> ArborBuilder {
        ArborBuilder {
            name: name.into(),
            schema,
            default_root: None,
            stack: DriverStack::new(),
            policy: PreconditionPolicy::default(),
            replica: None,
            store: None,
        }
    }

    // ---- Updates ----

    /// The outermost driver; every update should go through it.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn replace(&self, path: &str, value: impl Into<Node>) -> SdkResult<()> {
        self.driver
            .submit_replacement(self.reference(path)?, value.into())?;
        Ok(())
    }

    pub fn create(&self, path: &str, value: impl Into<Node>) -> SdkResult<()> {
        self.driver.submit_creation(self.reference(path)?, value.into())?;
        Ok(())
    }

    pub fn delete(&self, path: &str) -> SdkResult<()> {
        self.driver.submit_deletion(self.reference(path)?)?;
        Ok(())
    }

    /// Wait until every submitted update is reflected in the local tree.
    pub fn flush(&self) -> SdkResult<()> {
        self.driver.flush()?;
        Ok(())
    }

    // ---- Reads ----

    pub fn reference(&self, path: &str) -> SdkResult<Reference> {
        Ok(Reference::parse(self.schema(), path)?)
    }

    /// Pin the current snapshot for reads on this thread.
    pub fn read_session(&self) -> SdkResult<ReadSession> {
        Ok(self.state.read_session()?)
    }

    /// Resolve within the active read session.
    pub fn resolve(&self, reference: &Reference) -> SdkResult<Node> {
        Ok(self.state.resolve(reference)?)
    }

    /// Resolve `path` in a session of its own.
    pub fn get(&self, path: &str) -> SdkResult<Node> {
        let reference = self.reference(path)?;
        let session = self.read_session()?;
        Ok(session.resolve(&reference)?)
    }

    pub fn snapshot(&self) -> SdkResult<Arc<Snapshot>> {
        Ok(self.state.snapshot()?)
    }

    pub fn revision(&self) -> Option<u64> {
        self.state.revision()
    }

    // ---- Hooks ----

    /// Register `callback` for every instance of `scope`. Instances present
    /// now fire once right away.
    pub fn register_hook<F>(
        &self,
        name: impl Into<String>,
        scope: &str,
        callback: F,
    ) -> SdkResult<HookHandle>
    where
        F: Fn(&HookContext) -> arbor_hooks::Result<()> + Send + Sync + 'static,
    {
        let scope = self.reference(scope)?;
        Ok(self.hooks.register(name, scope, callback))
    }

    pub fn deregister_hook(&self, handle: HookHandle) -> bool {
        self.hooks.deregister(handle)
    }

    pub fn hook_failures(&self) -> broadcast::Receiver<HookFailure> {
        self.hooks.failures()
    }

    // ---- Accessors ----

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.state.schema()
    }

    pub fn state(&self) -> &Arc<StateTree> {
        &self.state
    }

    pub fn hooks(&self) -> &Arc<HookDispatcher> {
        &self.hooks
    }

    /// The replicating driver's handle, if this instance is replicated.
    pub fn replica(&self) -> Option<&ReplicaHandle> {
        self.replica.as_ref()
    }

    /// Stop replication. Local reads keep working.
    pub fn close(&self) {
        if let Some(replica) = &self.replica {
            replica.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use arbor_driver::{BufferingDriver, DiagnosticScopeDriver, DriverError};
    use arbor_hooks::HookError;
    use arbor_replica::{InMemoryDurableStore, ReplicaState};
    use arbor_tree::{Diagnostics, Update, UpdateError};
    use arbor_types::{Catalog, Identifier, Record, RecordShape, TypeRef};

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

    fn item(key: &str, label: &str) -> Node {
        Record::entity("Item", Identifier::new(key).unwrap())
            .with_field("label", label)
            .into()
    }

    fn local(name: &str) -> Arbor {
        Arbor::builder(name, schema())
            .default_root(root)
            .build()
            .unwrap()
    }

    #[test]
    fn build_initializes_from_default_root() {
        let arbor = local("doc");
        assert_eq!(arbor.name(), "doc");
        assert_eq!(arbor.revision(), Some(0));
        assert_eq!(arbor.get("/name").unwrap(), Node::text("Bob"));
        assert!(arbor.replica().is_none());
    }

    #[test]
    fn missing_or_invalid_default_root_is_rejected() {
        assert!(matches!(
            Arbor::builder("doc", schema()).build(),
            Err(SdkError::MissingDefaultRoot(_))
        ));
        let wrong = Arbor::builder("doc", schema())
            .default_root_value(Record::new("Doc").with_field("name", 3i64).into())
            .build();
        assert!(matches!(wrong, Err(SdkError::Type(_))));
    }

    #[test]
    fn replace_then_read_in_new_session() {
        let arbor = local("doc");
        arbor.replace("/name", "Alice").unwrap();
        arbor.flush().unwrap();

        let _session = arbor.read_session().unwrap();
        let name = arbor.reference("/name").unwrap();
        assert_eq!(arbor.resolve(&name).unwrap(), Node::text("Alice"));
        assert_eq!(arbor.revision(), Some(1));
    }

    #[test]
    fn resolve_needs_a_session() {
        let arbor = local("doc");
        let name = arbor.reference("/name").unwrap();
        assert!(matches!(
            arbor.resolve(&name),
            Err(SdkError::Resolution(arbor_refs::ResolutionError::NoReadSession))
        ));
    }

    #[test]
    fn stacked_drivers_see_every_update() {
        let arbor = Arbor::builder("doc", schema())
            .default_root(root)
            .driver("buffer", BufferingDriver::factory())
            .driver(
                "diagnostics",
                DiagnosticScopeDriver::factory_with(Arc::new(|_: &Update| {
                    Diagnostics::new().with("source", "sdk")
                })),
            )
            .build()
            .unwrap();
        let sources = Arc::new(Mutex::new(Vec::new()));
        let sink = sources.clone();
        arbor
            .register_hook("counter", "/counter", move |ctx| {
                sink.lock()
                    .unwrap()
                    .push(ctx.diagnostics.get("source").map(str::to_string));
                Ok(())
            })
            .unwrap();

        arbor.create("/items/a", item("a", "first")).unwrap();
        arbor.replace("/counter", 2i64).unwrap();
        // Held by the buffer until flush.
        assert_eq!(arbor.get("/counter").unwrap(), Node::from(0i64));

        arbor.flush().unwrap();
        assert_eq!(arbor.get("/items/a/label").unwrap(), Node::text("first"));
        assert_eq!(arbor.get("/counter").unwrap(), Node::from(2i64));
        assert_eq!(*sources.lock().unwrap(), vec![None, Some("sdk".to_string())]);
    }

    #[test]
    fn hooks_fire_and_report_failures() {
        let arbor = local("doc");
        arbor.create("/items/a", item("a", "first")).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = arbor
            .register_hook("labels", "/items/-item-/label", move |ctx| {
                sink.lock().unwrap().push(ctx.value()?);
                Ok(())
            })
            .unwrap();
        let mut failures = arbor.hook_failures();
        arbor
            .register_hook("broken", "/name", |_| Err(HookError::failed("no")))
            .unwrap();

        arbor.replace("/items/a/label", "renamed").unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Node::text("first"), Node::text("renamed")]
        );
        assert_eq!(failures.try_recv().unwrap().hook, "broken");

        assert!(arbor.deregister_hook(handle));
        arbor.replace("/items/a/label", "quiet").unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn replicated_instances_share_state() {
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());
        let config = ArborConfig {
            replica: Some(ReplicaConfig::fast("docs")),
            ..ArborConfig::new("doc")
        };
        let build = || {
            Arbor::builder("ignored", schema())
                .config(&config)
                .default_root(root)
                .replicated(store.clone())
                .build()
                .unwrap()
        };
        let a = build();
        let b = build();
        assert_eq!(a.name(), "doc");
        assert_eq!(a.replica().unwrap().state(), Some(ReplicaState::Connected));

        a.replace("/name", "Alice").unwrap();
        a.flush().unwrap();
        b.flush().unwrap();
        assert_eq!(b.get("/name").unwrap(), Node::text("Alice"));

        b.close();
        assert!(matches!(
            b.replace("/name", "Closed"),
            Err(SdkError::Driver(DriverError::Closed))
        ));
        assert_eq!(a.get("/name").unwrap(), Node::text("Alice"));
    }

    #[test]
    fn update_errors_pass_through() {
        let arbor = local("doc");
        arbor.create("/items/a", item("a", "first")).unwrap();
        assert!(matches!(
            arbor.create("/items/a", item("a", "again")),
            Err(SdkError::Driver(DriverError::Update(UpdateError::AlreadyExists { .. })))
        ));
        assert!(matches!(
            arbor.reference("/nowhere"),
            Err(SdkError::Resolution(_))
        ));
    }
}
