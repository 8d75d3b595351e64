//! Ambient diagnostic attributes.
//!
//! Attributes such as the submitting user or a request id are attached to
//! the calling thread with a [`DiagnosticScope`] guard. Commits capture the
//! attributes in force when the update was submitted, and hook invocations
//! run inside the captured set.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

thread_local! {
    static CURRENT: RefCell<Diagnostics> = RefCell::new(Diagnostics::default());
}

/// An ordered set of diagnostic key/value attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diagnostics(BTreeMap<String, String>);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `self` overlaid with `other`; keys in `other` win.
    pub fn merged(&self, other: &Diagnostics) -> Diagnostics {
        let mut out = self.clone();
        for (k, v) in other.iter() {
            out.insert(k, v);
        }
        out
    }
}

/// Access to the calling thread's diagnostic attributes.
pub struct DiagnosticContext;

impl DiagnosticContext {
    /// A copy of the attributes currently in force on this thread.
    pub fn current() -> Diagnostics {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Overlay `attrs` on the current attributes until the guard drops.
    ///
    /// # Examples
    ///
    /// ```
    /// use arbor_tree::{DiagnosticContext, Diagnostics};
    ///
    /// {
    ///     let _outer = DiagnosticContext::enter(Diagnostics::new().with("user", "alice"));
    ///     let _inner = DiagnosticContext::enter(Diagnostics::new().with("op", "rename"));
    ///     let now = DiagnosticContext::current();
    ///     assert_eq!(now.get("user"), Some("alice"));
    ///     assert_eq!(now.get("op"), Some("rename"));
    /// }
    /// assert!(DiagnosticContext::current().is_empty());
    /// ```
    pub fn enter(attrs: Diagnostics) -> DiagnosticScope {
        let previous = CURRENT.with(|c| {
            let mut current = c.borrow_mut();
            let next = current.merged(&attrs);
            std::mem::replace(&mut *current, next)
        });
        DiagnosticScope {
            previous: Some(previous),
            _not_send: PhantomData,
        }
    }

    /// Replace the attributes wholesale until the guard drops.
    pub fn install(attrs: Diagnostics) -> DiagnosticScope {
        let previous = CURRENT.with(|c| std::mem::replace(&mut *c.borrow_mut(), attrs));
        DiagnosticScope {
            previous: Some(previous),
            _not_send: PhantomData,
        }
    }
}

/// Restores the previous attributes on drop, including during unwinding.
#[must_use = "the scope ends when the guard is dropped"]
pub struct DiagnosticScope {
    previous: Option<Diagnostics>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for DiagnosticScope {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            // try_with: the thread-local may already be gone during thread teardown.
            let _ = CURRENT.try_with(|c| *c.borrow_mut() = previous);
        }
    }
}
