//! Trait surfaces that describe MUTT's interactions with external
//! collaborators: the queue substrate, the relational rule store, the audit
//! store, and the downstream sink. Concrete adapters live in `mutt-core`.

pub mod audit_store;
pub mod queue;
pub mod rule_store;
pub mod sink;

/// Frequently used trait combinators for wiring up components.
pub mod prelude {
    pub use super::audit_store::{AuditRecord, AuditStore, AuditStoreError};
    pub use super::queue::{QueueError, QueueSubstrate, ScriptReply};
    pub use super::rule_store::{RuleSnapshot, RuleStore, RuleStoreError};
    pub use super::sink::{Sink, SinkError, SinkHealth};
}
