//! Built-in drivers.

pub mod buffering;
pub mod diagnostic;
pub mod forwarding;
pub mod local;
pub mod replica_set;
pub mod verifier;

pub use buffering::BufferingDriver;
pub use diagnostic::DiagnosticScopeDriver;
pub use forwarding::ForwardingDriver;
pub use local::LocalDriver;
pub use replica_set::ReplicaSet;
pub use verifier::FlushVerifier;
