//! Postgres-backed audit store (spec §3, §4.E step 6): one row per
//! classified event, written before the corresponding alert-queue push so
//! an operator observing the audit store knows the alert has at least been
//! attempted.

use async_trait::async_trait;
use mutt_contracts::audit_store::{AuditRecord, AuditStore, AuditStoreError, AuditStoreResult};
use sqlx::PgPool;

#[derive(Clone)]
pub struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    async fn write_audit_row(&self, record: &AuditRecord) -> AuditStoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO event_audit (
                correlation_id, matched_rule_id, handling_decision, team_assignment,
                environment, raw_payload, processing_pod_id, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.correlation_id)
        .bind(record.matched_rule_id)
        .bind(&record.handling_decision)
        .bind(&record.team_assignment)
        .bind(&record.environment)
        .bind(&record.raw_payload)
        .bind(&record.processing_pod_id)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AuditStoreError::Write(format!("failed to write audit row: {e}")))?;

        Ok(())
    }
}
