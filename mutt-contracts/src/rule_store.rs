//! Read-only access to the externally-managed rule corpus (rules, dev-host
//! classifications, team mappings). The dashboard/API layer owns writes;
//! the core pipeline only ever reads a full snapshot.

use async_trait::async_trait;
use mutt_types::{classification::DevHosts, classification::TeamMappings, Rule};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleStoreError {
    #[error("rule store unreachable: {0}")]
    Unreachable(String),
    #[error("rule store query failed: {0}")]
    Query(String),
}

pub type RuleStoreResult<T> = Result<T, RuleStoreError>;

#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    pub rules: Vec<Rule>,
    pub dev_hosts: DevHosts,
    pub team_mappings: TeamMappings,
}

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Read the full rule corpus. Implementations must be all-or-nothing:
    /// a partial read should surface as an error, never a truncated
    /// snapshot, so the cache never serves half-loaded data.
    async fn load_snapshot(&self) -> RuleStoreResult<RuleSnapshot>;
}
