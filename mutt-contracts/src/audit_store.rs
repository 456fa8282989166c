//! The audit store records one row per classified event: which rule fired
//! (if any), the decision, team, environment, and the raw payload. It is
//! the operator's ground truth that an event was at least attempted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuditStoreError {
    #[error("audit store unreachable: {0}")]
    Unreachable(String),
    #[error("audit write failed: {0}")]
    Write(String),
}

pub type AuditStoreResult<T> = Result<T, AuditStoreError>;

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub correlation_id: Uuid,
    pub matched_rule_id: Option<i64>,
    pub handling_decision: String,
    pub team_assignment: String,
    pub environment: String,
    pub raw_payload: Value,
    pub processing_pod_id: String,
    pub recorded_at: DateTime<Utc>,
}

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn write_audit_row(&self, record: &AuditRecord) -> AuditStoreResult<()>;
}
