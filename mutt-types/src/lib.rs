//! Shared data models for the MUTT event pipeline: the wire/storage shapes
//! that flow between the ingest gateway, the alerter, the forwarder, and the
//! remediation worker.

pub mod alert;
pub mod circuit;
pub mod classification;
pub mod dynconfig;
pub mod error;
pub mod event;
pub mod rule;

pub use alert::Alert;
pub use circuit::{CircuitPhase, CircuitState};
pub use classification::{DevHosts, TeamMappings};
pub use dynconfig::{ConfigAuditRecord, DynConfigValue};
pub use error::{MuttError, Result};
pub use event::{Event, SourceType, SyslogSeverity};
pub use rule::{Environment, HandlingDecision, MatchType, Rule};
