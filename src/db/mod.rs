//! Transactional state store for the incident engine.
//!
//! Two interchangeable backends implement the `StateStore` trait: an
//! embedded libSQL database (the default, no server needed) and a pooled
//! PostgreSQL connection. Both persist identical logical state; the
//! orchestrator only ever sees `Arc<dyn StateStore>`.

mod libsql;
mod libsql_migrations;
mod pg_migrations;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::DatabaseError;
use crate::event::FaultEvent;
use crate::incident::{AgentExecution, Incident, IncidentStatus, TriageReport};

pub use self::libsql::LibSqlStore;
pub use self::postgres::PgStore;

/// Query filter for incident listings.
///
/// All criteria are conjunctive; an empty filter matches everything.
/// `statuses` is set membership, the rest are equality or range checks.
#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub statuses: Vec<IncidentStatus>,
    pub cluster: Option<String>,
    pub namespace: Option<String>,
    pub fault_type: Option<String>,
    pub severity: Option<String>,
    pub created_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Backend-agnostic persistence for incidents and their artifacts.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Apply the schema. Idempotent; run at startup.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Persist the triggering fault event and its incident in one
    /// transaction. The event insert is idempotent on `fault_id` (a repeat
    /// notification for a known fault is not an error); the incident insert
    /// is unconditional, so every accepted event gets a fresh incident row.
    async fn create_incident(
        &self,
        incident: &Incident,
        event: &FaultEvent,
    ) -> Result<(), DatabaseError>;

    /// Set an incident's status, optionally stamping `started_at`.
    /// Returns `NotFound` when no row matches the id.
    async fn update_incident_status(
        &self,
        id: Uuid,
        status: IncidentStatus,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Terminal bookkeeping for an incident: stamps `completed_at`, records
    /// the exit code and failure reason, and derives the status from the
    /// exit code (zero resolves, anything else fails). Returns `NotFound`
    /// when no row matches the id.
    async fn complete_incident(
        &self,
        id: Uuid,
        exit_code: i32,
        failure_reason: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Upsert an execution row on its id: inserted once at subprocess start,
    /// written again with completion fields after exit.
    async fn record_agent_execution(
        &self,
        execution: &AgentExecution,
    ) -> Result<(), DatabaseError>;

    /// Persist an investigator report.
    async fn record_triage_report(&self, report: &TriageReport) -> Result<(), DatabaseError>;

    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>, DatabaseError>;

    /// List incidents matching a filter, newest first.
    async fn list_incidents(
        &self,
        filter: &IncidentFilter,
    ) -> Result<Vec<Incident>, DatabaseError>;

    /// Execution rows for an incident, oldest first.
    async fn list_agent_executions(
        &self,
        incident_id: Uuid,
    ) -> Result<Vec<AgentExecution>, DatabaseError>;

    /// Reports for an incident, oldest first.
    async fn list_triage_reports(
        &self,
        incident_id: Uuid,
    ) -> Result<Vec<TriageReport>, DatabaseError>;

    /// Cheap connectivity probe.
    async fn health_check(&self) -> Result<(), DatabaseError>;

    /// Release connections. Safe to call more than once.
    async fn close(&self);
}

/// Build the configured backend.
pub async fn connect_from_config(
    config: &DatabaseConfig,
) -> Result<Arc<dyn StateStore>, DatabaseError> {
    match config {
        DatabaseConfig::LibSql { path } => {
            tracing::info!(path = %path.display(), "Using libSQL state store");
            Ok(Arc::new(LibSqlStore::new_local(path).await?))
        }
        DatabaseConfig::Postgres { .. } => {
            tracing::info!("Using PostgreSQL state store");
            Ok(Arc::new(PgStore::new(config)?))
        }
    }
}
