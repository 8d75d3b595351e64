use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What bootstrap does when the collection holds no document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingStatePolicy {
    /// Fail with `NoDurableState`.
    Fail,
    /// Store the default root as revision 0.
    #[default]
    Seed,
}

/// What bootstrap does when the store cannot be reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnreachablePolicy {
    /// Fail with `Unreachable`.
    #[default]
    Fail,
    /// Start disconnected from the default root and adopt the durable state
    /// once the store is reachable.
    StartWithDefault,
}

/// Bootstrap behavior of the replicating driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub missing: MissingStatePolicy,
    pub unreachable: UnreachablePolicy,
}

/// Configuration for the replicating durable driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Collection holding the tree's document and change feed.
    pub collection: String,
    pub bootstrap: BootstrapConfig,
    /// Conditional write attempts before giving up with `Conflict`.
    pub max_write_attempts: u32,
    /// First reconnect delay.
    pub initial_backoff_ms: u64,
    /// Reconnect delays double up to this cap.
    pub max_backoff_ms: u64,
    /// Bound on how long `flush` waits; unbounded when absent.
    pub flush_timeout_ms: Option<u64>,
    /// How often the listener rechecks shutdown while waiting for the tree
    /// to be initialized.
    pub listener_poll_ms: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            collection: "arbor".into(),
            bootstrap: BootstrapConfig::default(),
            max_write_attempts: 8,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            flush_timeout_ms: Some(30_000),
            listener_poll_ms: 50,
        }
    }
}

impl ReplicaConfig {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Default::default()
        }
    }

    /// Fail at bootstrap instead of seeding or starting disconnected.
    pub fn strict(collection: impl Into<String>) -> Self {
        Self {
            bootstrap: BootstrapConfig {
                missing: MissingStatePolicy::Fail,
                unreachable: UnreachablePolicy::Fail,
            },
            ..Self::new(collection)
        }
    }

    /// Short delays for tests and simulations.
    pub fn fast(collection: impl Into<String>) -> Self {
        Self {
            initial_backoff_ms: 5,
            max_backoff_ms: 50,
            flush_timeout_ms: Some(5_000),
            listener_poll_ms: 5,
            ..Self::new(collection)
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: BootstrapConfig) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms))
    }

    pub fn flush_timeout(&self) -> Option<Duration> {
        self.flush_timeout_ms.map(Duration::from_millis)
    }

    pub fn listener_poll(&self) -> Duration {
        Duration::from_millis(self.listener_poll_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- Test 1: defaults seed missing state and fail when unreachable ----
    #[test]
    fn defaults() {
        let config = ReplicaConfig::default();
        assert_eq!(config.bootstrap.missing, MissingStatePolicy::Seed);
        assert_eq!(config.bootstrap.unreachable, UnreachablePolicy::Fail);
        assert_eq!(config.flush_timeout(), Some(Duration::from_secs(30)));
        assert!(config.max_write_attempts > 1);
    }

    // ---- Test 2: partial TOML falls back to defaults ----
    #[test]
    fn from_partial_toml() {
        let config: ReplicaConfig = toml::from_str(
            r#"
            collection = "planets"
            max_write_attempts = 3

            [bootstrap]
            unreachable = "start_with_default"
            "#,
        )
        .unwrap();
        assert_eq!(config.collection, "planets");
        assert_eq!(config.max_write_attempts, 3);
        assert_eq!(config.bootstrap.missing, MissingStatePolicy::Seed);
        assert_eq!(
            config.bootstrap.unreachable,
            UnreachablePolicy::StartWithDefault
        );
        assert_eq!(config.initial_backoff_ms, 100);
    }

    // ---- Test 3: presets ----
    #[test]
    fn presets() {
        let strict = ReplicaConfig::strict("c");
        assert_eq!(strict.bootstrap.missing, MissingStatePolicy::Fail);
        let fast = ReplicaConfig::fast("c");
        assert!(fast.initial_backoff() < ReplicaConfig::default().initial_backoff());
        assert!(fast.max_backoff() >= fast.initial_backoff());
    }
}
