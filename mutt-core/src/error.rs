use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Queue(#[from] mutt_contracts::queue::QueueError),

    #[error(transparent)]
    RuleStore(#[from] mutt_contracts::rule_store::RuleStoreError),

    #[error(transparent)]
    AuditStore(#[from] mutt_contracts::audit_store::AuditStoreError),

    #[error(transparent)]
    Sink(#[from] mutt_contracts::sink::SinkError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal invariant violation: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
