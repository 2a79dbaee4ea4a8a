//! libSQL backend for the StateStore trait.
//!
//! Embedded SQLite-compatible storage, file-based or in-memory (tests).
//! SQLite has no native UUID/timestamp/JSON types, so ids and timestamps
//! are stored as text (RFC 3339 for timestamps) and log paths as a JSON
//! encoded text column.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::{params, params_from_iter, Connection, Database};
use uuid::Uuid;

use crate::db::{libsql_migrations, IncidentFilter, StateStore};
use crate::error::DatabaseError;
use crate::event::{FaultEvent, ResourceRef};
use crate::incident::{AgentExecution, Incident, IncidentStatus, TriageReport};

/// Explicit column list for incidents (matches positional access in `row_to_incident`).
const INCIDENT_COLUMNS: &str = "\
    incident_id, fault_id, status, created_at, started_at, completed_at, \
    exit_code, failure_reason, cluster, namespace, \
    resource_kind, resource_name, resource_namespace, resource_api_version, resource_uid, \
    fault_type, severity, context, fault_occurred_at";

/// libSQL state store.
pub struct LibSqlStore {
    db: Arc<Database>,
    /// Keeps an in-memory database alive; a shared-cache memory database
    /// is destroyed once its last connection closes. `None` for file-backed
    /// stores.
    _keepalive: Option<Connection>,
}

impl LibSqlStore {
    /// Open (or create) a local embedded database.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("failed to create database directory: {}", e))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open libSQL database: {}", e)))?;

        Ok(Self {
            db: Arc::new(db),
            _keepalive: None,
        })
    }

    /// Create an in-memory database (for testing).
    ///
    /// Uses a uniquely named shared-cache memory URI so every connection
    /// created from this store sees the same database; a plain `:memory:`
    /// path gives each connection its own empty database.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let uri = format!("file:memdb-{}?mode=memory&cache=shared", Uuid::new_v4());
        let db = libsql::Builder::new_local(uri)
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("failed to create in-memory database: {}", e))
            })?;

        let keepalive = db.connect().map_err(|e| {
            DatabaseError::Pool(format!("failed to create connection: {}", e))
        })?;

        Ok(Self {
            db: Arc::new(db),
            _keepalive: Some(keepalive),
        })
    }

    /// Create a new connection.
    ///
    /// Sets `PRAGMA busy_timeout = 5000` on every connection so concurrent
    /// writers wait up to 5 seconds instead of failing instantly with
    /// "database is locked".
    async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("failed to create connection: {}", e)))?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to set busy_timeout: {}", e)))?;
        Ok(conn)
    }

    async fn insert_event(
        &self,
        conn: &Connection,
        event: &FaultEvent,
    ) -> Result<(), DatabaseError> {
        let resource = event.resource.as_ref();
        conn.execute(
            r#"
            INSERT INTO fault_events (
                fault_id, cluster, subscription,
                resource_kind, resource_name, resource_namespace,
                resource_api_version, resource_uid,
                fault_type, severity, context, occurred_at, received_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(fault_id) DO NOTHING
            "#,
            params![
                event.fault_id.as_str(),
                event.cluster.as_str(),
                event.subscription.as_str(),
                opt_text(resource.map(|r| r.kind.as_str())),
                opt_text(resource.map(|r| r.name.as_str())),
                opt_text(resource.and_then(|r| r.namespace.as_deref())),
                opt_text(resource.and_then(|r| r.api_version.as_deref())),
                opt_text(resource.and_then(|r| r.uid.as_deref())),
                event.fault_type.as_str(),
                event.severity.as_str(),
                event.context.as_str(),
                fmt_ts(&event.occurred_at),
                fmt_ts(&Utc::now()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn insert_incident(
        &self,
        conn: &Connection,
        incident: &Incident,
    ) -> Result<(), DatabaseError> {
        let resource = incident.resource.as_ref();
        conn.execute(
            r#"
            INSERT INTO incidents (
                incident_id, fault_id, status, created_at, started_at, completed_at,
                exit_code, failure_reason, cluster, namespace,
                resource_kind, resource_name, resource_namespace,
                resource_api_version, resource_uid,
                fault_type, severity, context, fault_occurred_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                      ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            "#,
            params![
                incident.id.to_string(),
                incident.triggering_event_id.as_str(),
                incident.status.as_str(),
                fmt_ts(&incident.created_at),
                fmt_opt_ts(&incident.started_at),
                fmt_opt_ts(&incident.completed_at),
                opt_i64(incident.exit_code.map(i64::from)),
                opt_text(incident.failure_reason.as_deref()),
                incident.cluster.as_str(),
                opt_text(incident.namespace.as_deref()),
                opt_text(resource.map(|r| r.kind.as_str())),
                opt_text(resource.map(|r| r.name.as_str())),
                opt_text(resource.and_then(|r| r.namespace.as_deref())),
                opt_text(resource.and_then(|r| r.api_version.as_deref())),
                opt_text(resource.and_then(|r| r.uid.as_deref())),
                incident.fault_type.as_str(),
                incident.severity.as_str(),
                incident.context.as_str(),
                fmt_ts(&incident.fault_occurred_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute_batch(libsql_migrations::SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }

    async fn create_incident(
        &self,
        incident: &Incident,
        event: &FaultEvent,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute("BEGIN", ())
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        if let Err(e) = self.insert_event(&conn, event).await {
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(e);
        }
        if let Err(e) = self.insert_incident(&conn, incident).await {
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(e);
        }

        conn.execute("COMMIT", ())
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn update_incident_status(
        &self,
        id: Uuid,
        status: IncidentStatus,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute(
                r#"
                UPDATE incidents
                SET status = ?2,
                    started_at = COALESCE(?3, started_at)
                WHERE incident_id = ?1
                "#,
                params![id.to_string(), status.as_str(), fmt_opt_ts(&started_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                kind: "incident",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn complete_incident(
        &self,
        id: Uuid,
        exit_code: i32,
        failure_reason: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute(
                r#"
                UPDATE incidents
                SET status = CASE WHEN ?2 = 0 THEN 'resolved' ELSE 'failed' END,
                    completed_at = ?4,
                    exit_code = ?2,
                    failure_reason = ?3
                WHERE incident_id = ?1
                "#,
                params![
                    id.to_string(),
                    i64::from(exit_code),
                    opt_text(failure_reason),
                    fmt_ts(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                kind: "incident",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn record_agent_execution(
        &self,
        execution: &AgentExecution,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        let log_paths = serde_json::to_string(&execution.log_paths)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        conn.execute(
            r#"
            INSERT INTO agent_executions (
                execution_id, incident_id, started_at, completed_at,
                exit_code, error_message, log_paths
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(execution_id) DO UPDATE SET
                completed_at = excluded.completed_at,
                exit_code = excluded.exit_code,
                error_message = excluded.error_message,
                log_paths = excluded.log_paths
            "#,
            params![
                execution.id.to_string(),
                execution.incident_id.to_string(),
                fmt_ts(&execution.started_at),
                fmt_opt_ts(&execution.completed_at),
                opt_i64(execution.exit_code.map(i64::from)),
                opt_text(execution.error_message.as_deref()),
                log_paths,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn record_triage_report(&self, report: &TriageReport) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO triage_reports (
                report_id, incident_id, execution_id, markdown, html, generated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                report.id.to_string(),
                report.incident_id.to_string(),
                report.execution_id.to_string(),
                report.markdown.as_str(),
                opt_text(report.html.as_deref()),
                fmt_ts(&report.generated_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM incidents WHERE incident_id = ?1",
                    INCIDENT_COLUMNS
                ),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_incident(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_incidents(
        &self,
        filter: &IncidentFilter,
    ) -> Result<Vec<Incident>, DatabaseError> {
        let conn = self.connect().await?;

        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if !filter.statuses.is_empty() {
            let placeholders = vec!["?"; filter.statuses.len()].join(", ");
            clauses.push(format!("status IN ({})", placeholders));
            for status in &filter.statuses {
                values.push(libsql::Value::Text(status.as_str().to_string()));
            }
        }
        if let Some(cluster) = &filter.cluster {
            clauses.push("cluster = ?".to_string());
            values.push(libsql::Value::Text(cluster.clone()));
        }
        if let Some(namespace) = &filter.namespace {
            clauses.push("namespace = ?".to_string());
            values.push(libsql::Value::Text(namespace.clone()));
        }
        if let Some(fault_type) = &filter.fault_type {
            clauses.push("fault_type = ?".to_string());
            values.push(libsql::Value::Text(fault_type.clone()));
        }
        if let Some(severity) = &filter.severity {
            clauses.push("severity = ?".to_string());
            values.push(libsql::Value::Text(severity.clone()));
        }
        if let Some(before) = &filter.created_before {
            clauses.push("created_at < ?".to_string());
            values.push(libsql::Value::Text(fmt_ts(before)));
        }
        if let Some(after) = &filter.created_after {
            clauses.push("created_at > ?".to_string());
            values.push(libsql::Value::Text(fmt_ts(after)));
        }

        let mut sql = format!("SELECT {} FROM incidents", INCIDENT_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if filter.limit.is_some() || filter.offset.is_some() {
            // SQLite requires LIMIT before OFFSET; -1 means unbounded.
            sql.push_str(" LIMIT ?");
            values.push(libsql::Value::Integer(filter.limit.unwrap_or(-1)));
            if let Some(offset) = filter.offset {
                sql.push_str(" OFFSET ?");
                values.push(libsql::Value::Integer(offset));
            }
        }

        let mut rows = conn
            .query(&sql, params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut incidents = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            incidents.push(row_to_incident(&row)?);
        }
        Ok(incidents)
    }

    async fn list_agent_executions(
        &self,
        incident_id: Uuid,
    ) -> Result<Vec<AgentExecution>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT execution_id, incident_id, started_at, completed_at,
                       exit_code, error_message, log_paths
                FROM agent_executions
                WHERE incident_id = ?1
                ORDER BY started_at ASC
                "#,
                params![incident_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut executions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            executions.push(row_to_execution(&row)?);
        }
        Ok(executions)
    }

    async fn list_triage_reports(
        &self,
        incident_id: Uuid,
    ) -> Result<Vec<TriageReport>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT report_id, incident_id, execution_id, markdown, html, generated_at
                FROM triage_reports
                WHERE incident_id = ?1
                ORDER BY generated_at ASC
                "#,
                params![incident_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut reports = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            reports.push(TriageReport {
                id: parse_uuid(&get_text(&row, 0))?,
                incident_id: parse_uuid(&get_text(&row, 1))?,
                execution_id: parse_uuid(&get_text(&row, 2))?,
                markdown: get_text(&row, 3),
                html: get_opt_text(&row, 4),
                generated_at: parse_ts(&get_text(&row, 5))?,
            });
        }
        Ok(reports)
    }

    async fn health_check(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.query("SELECT 1", ())
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        // Embedded database; connections are per-operation and dropped
        // when they go out of scope.
    }
}

// ==================== Helper functions ====================

/// Format a DateTime<Utc> for SQLite storage (RFC 3339 with millisecond
/// precision). Lexicographic order matches chronological order, which the
/// created_at range filters and ORDER BY rely on.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn fmt_opt_ts(dt: &Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Parse a stored timestamp. RFC 3339 is the canonical write format; the
/// naive forms cover rows written by SQLite's own datetime().
fn parse_ts(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!(
        "unparseable timestamp: {:?}",
        s
    )))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.map(|s| parse_ts(&s)).transpose()
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {:?}: {}", s, e)))
}

/// Convert an `Option<&str>` to a `libsql::Value` (Text or Null).
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_i64(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

/// Extract a text column, returning empty string for NULL.
fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

/// Extract an optional text column. Returns None for SQL NULL.
fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn get_opt_i32(row: &libsql::Row, idx: i32) -> Option<i32> {
    row.get::<i64>(idx).ok().map(|v| v as i32)
}

fn row_to_incident(row: &libsql::Row) -> Result<Incident, DatabaseError> {
    let status_str = get_text(row, 2);
    let status = IncidentStatus::parse(&status_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown incident status: {}", status_str))
    })?;

    let resource = get_opt_text(row, 10).map(|kind| ResourceRef {
        kind,
        name: get_text(row, 11),
        namespace: get_opt_text(row, 12),
        api_version: get_opt_text(row, 13),
        uid: get_opt_text(row, 14),
    });

    Ok(Incident {
        id: parse_uuid(&get_text(row, 0))?,
        status,
        created_at: parse_ts(&get_text(row, 3))?,
        started_at: parse_opt_ts(get_opt_text(row, 4))?,
        completed_at: parse_opt_ts(get_opt_text(row, 5))?,
        exit_code: get_opt_i32(row, 6),
        failure_reason: get_opt_text(row, 7),
        cluster: get_text(row, 8),
        namespace: get_opt_text(row, 9),
        resource,
        fault_type: get_text(row, 15),
        severity: get_text(row, 16),
        context: get_text(row, 17),
        fault_occurred_at: parse_ts(&get_text(row, 18))?,
        triggering_event_id: get_text(row, 1),
    })
}

fn row_to_execution(row: &libsql::Row) -> Result<AgentExecution, DatabaseError> {
    let log_paths: HashMap<String, String> = match get_opt_text(row, 6) {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        None => HashMap::new(),
    };

    Ok(AgentExecution {
        id: parse_uuid(&get_text(row, 0))?,
        incident_id: parse_uuid(&get_text(row, 1))?,
        started_at: parse_ts(&get_text(row, 2))?,
        completed_at: parse_opt_ts(get_opt_text(row, 3))?,
        exit_code: get_opt_i32(row, 4),
        error_message: get_opt_text(row, 5),
        log_paths,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    async fn store() -> LibSqlStore {
        let store = LibSqlStore::new_memory().await.expect("memory db");
        store.run_migrations().await.expect("migrations");
        store
    }

    fn event(fault_id: &str) -> FaultEvent {
        FaultEvent {
            fault_id: fault_id.to_string(),
            cluster: "prod-1".to_string(),
            subscription: "sub-a".to_string(),
            resource: Some(ResourceRef {
                kind: "Pod".to_string(),
                name: "api-0".to_string(),
                namespace: Some("payments".to_string()),
                api_version: Some("v1".to_string()),
                uid: None,
            }),
            fault_type: "CrashLoopBackOff".to_string(),
            severity: "critical".to_string(),
            context: "container restarted 14 times".to_string(),
            occurred_at: Utc::now(),
        }
    }

    async fn seed(store: &LibSqlStore, fault_id: &str) -> Incident {
        let event = event(fault_id);
        let incident = Incident::from_event(&event);
        store
            .create_incident(&incident, &event)
            .await
            .expect("create");
        incident
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let store = store().await;
        let incident = seed(&store, "sha256:aa").await;

        let loaded = store
            .get_incident(incident.id)
            .await
            .expect("get")
            .expect("found");
        assert_eq!(loaded.id, incident.id);
        assert_eq!(loaded.status, IncidentStatus::Investigating);
        assert_eq!(loaded.cluster, "prod-1");
        assert_eq!(loaded.namespace.as_deref(), Some("payments"));
        assert_eq!(loaded.triggering_event_id, "sha256:aa");
        let resource = loaded.resource.expect("resource");
        assert_eq!(resource.kind, "Pod");
        assert_eq!(resource.name, "api-0");
        assert!(loaded.started_at.is_none());
        assert!(loaded.exit_code.is_none());
    }

    #[tokio::test]
    async fn repeat_fault_id_creates_a_second_incident() {
        let store = store().await;
        let a = seed(&store, "sha256:dup").await;
        let b = seed(&store, "sha256:dup").await;
        assert_ne!(a.id, b.id);

        let all = store
            .list_incidents(&IncidentFilter::default())
            .await
            .expect("list");
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|i| i.triggering_event_id == "sha256:dup"));
    }

    #[tokio::test]
    async fn get_missing_incident_is_none() {
        let store = store().await;
        assert!(store
            .get_incident(Uuid::new_v4())
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn updates_against_unknown_id_are_not_found() {
        let store = store().await;
        let id = Uuid::new_v4();

        let err = store
            .update_incident_status(id, IncidentStatus::Investigating, Some(Utc::now()))
            .await
            .expect_err("should fail");
        assert!(err.is_not_found());

        let err = store
            .complete_incident(id, 0, None)
            .await
            .expect_err("should fail");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn status_update_stamps_started_at_once() {
        let store = store().await;
        let incident = seed(&store, "sha256:bb").await;

        let started = Utc::now();
        store
            .update_incident_status(incident.id, IncidentStatus::Investigating, Some(started))
            .await
            .expect("update");
        let loaded = store
            .get_incident(incident.id)
            .await
            .expect("get")
            .expect("found");
        let stamped = loaded.started_at.expect("started_at");

        // A later status-only update must not clear the stamp.
        store
            .update_incident_status(incident.id, IncidentStatus::AgentFailed, None)
            .await
            .expect("update");
        let loaded = store
            .get_incident(incident.id)
            .await
            .expect("get")
            .expect("found");
        assert_eq!(loaded.status, IncidentStatus::AgentFailed);
        assert_eq!(loaded.started_at, Some(stamped));
    }

    #[tokio::test]
    async fn complete_derives_status_from_exit_code() {
        let store = store().await;
        let ok = seed(&store, "sha256:ok").await;
        let bad = seed(&store, "sha256:bad").await;

        store.complete_incident(ok.id, 0, None).await.expect("complete");
        store
            .complete_incident(bad.id, 3, Some("agent exited with non-zero code: 3"))
            .await
            .expect("complete");

        let ok = store.get_incident(ok.id).await.expect("get").expect("found");
        assert_eq!(ok.status, IncidentStatus::Resolved);
        assert_eq!(ok.exit_code, Some(0));
        assert!(ok.failure_reason.is_none());
        assert!(ok.completed_at.is_some());

        let bad = store.get_incident(bad.id).await.expect("get").expect("found");
        assert_eq!(bad.status, IncidentStatus::Failed);
        assert_eq!(bad.exit_code, Some(3));
        assert_eq!(
            bad.failure_reason.as_deref(),
            Some("agent exited with non-zero code: 3")
        );
    }

    #[tokio::test]
    async fn execution_record_upserts_on_id() {
        let store = store().await;
        let incident = seed(&store, "sha256:cc").await;

        let mut execution = AgentExecution::begin(incident.id);
        store
            .record_agent_execution(&execution)
            .await
            .expect("record start");

        let mut log_paths = HashMap::new();
        log_paths.insert(
            "stdout".to_string(),
            "/work/logs/agent-stdout.log".to_string(),
        );
        execution.complete(0, None, log_paths);
        store
            .record_agent_execution(&execution)
            .await
            .expect("record completion");

        let rows = store
            .list_agent_executions(incident.id)
            .await
            .expect("list");
        assert_eq!(rows.len(), 1, "completion must rewrite the same row");
        assert_eq!(rows[0].id, execution.id);
        assert_eq!(rows[0].exit_code, Some(0));
        assert!(rows[0].completed_at.is_some());
        assert_eq!(
            rows[0].log_paths.get("stdout").map(String::as_str),
            Some("/work/logs/agent-stdout.log")
        );
    }

    #[tokio::test]
    async fn triage_report_round_trips() {
        let store = store().await;
        let incident = seed(&store, "sha256:dd").await;
        let execution = AgentExecution::begin(incident.id);
        store
            .record_agent_execution(&execution)
            .await
            .expect("record");

        let report = TriageReport::new(
            incident.id,
            execution.id,
            "# Root cause\n\nOOM in the sidecar.".to_string(),
        );
        store.record_triage_report(&report).await.expect("record");

        let reports = store
            .list_triage_reports(incident.id)
            .await
            .expect("list");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id, report.id);
        assert_eq!(reports[0].execution_id, execution.id);
        assert_eq!(reports[0].markdown, "# Root cause\n\nOOM in the sidecar.");
        assert!(reports[0].html.is_none());
    }

    #[tokio::test]
    async fn list_filters_by_status_set() {
        let store = store().await;
        let a = seed(&store, "sha256:f1").await;
        let b = seed(&store, "sha256:f2").await;
        let _c = seed(&store, "sha256:f3").await;

        store.complete_incident(a.id, 0, None).await.expect("complete");
        store
            .complete_incident(b.id, 1, Some("boom"))
            .await
            .expect("complete");

        let terminal = store
            .list_incidents(&IncidentFilter {
                statuses: vec![IncidentStatus::Resolved, IncidentStatus::Failed],
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(terminal.len(), 2);

        let investigating = store
            .list_incidents(&IncidentFilter {
                statuses: vec![IncidentStatus::Investigating],
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(investigating.len(), 1);
    }

    #[tokio::test]
    async fn list_filters_by_field_equality() {
        let store = store().await;
        seed(&store, "sha256:g1").await;

        let mut other = event("sha256:g2");
        other.cluster = "staging-2".to_string();
        other.fault_type = "NodeNotReady".to_string();
        let incident = Incident::from_event(&other);
        store
            .create_incident(&incident, &other)
            .await
            .expect("create");

        let staging = store
            .list_incidents(&IncidentFilter {
                cluster: Some("staging-2".to_string()),
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(staging.len(), 1);
        assert_eq!(staging[0].cluster, "staging-2");

        let none = store
            .list_incidents(&IncidentFilter {
                cluster: Some("staging-2".to_string()),
                fault_type: Some("CrashLoopBackOff".to_string()),
                ..Default::default()
            })
            .await
            .expect("list");
        assert!(none.is_empty(), "criteria are conjunctive");
    }

    #[tokio::test]
    async fn list_orders_newest_first_with_limit_and_offset() {
        let store = store().await;
        // Distinct created_at values so ordering is deterministic.
        let base = Utc::now() - Duration::minutes(10);
        let mut ids = Vec::new();
        for i in 0..4 {
            let event = event(&format!("sha256:h{i}"));
            let mut incident = Incident::from_event(&event);
            incident.created_at = base + Duration::minutes(i);
            store
                .create_incident(&incident, &event)
                .await
                .expect("create");
            ids.push(incident.id);
        }

        let page = store
            .list_incidents(&IncidentFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[3]);
        assert_eq!(page[1].id, ids[2]);

        let next = store
            .list_incidents(&IncidentFilter {
                limit: Some(2),
                offset: Some(2),
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].id, ids[1]);
        assert_eq!(next[1].id, ids[0]);
    }

    #[tokio::test]
    async fn list_filters_by_created_range() {
        let store = store().await;
        let base = Utc::now() - Duration::hours(2);
        for i in 0..3 {
            let event = event(&format!("sha256:r{i}"));
            let mut incident = Incident::from_event(&event);
            incident.created_at = base + Duration::hours(i);
            store
                .create_incident(&incident, &event)
                .await
                .expect("create");
        }

        let middle = store
            .list_incidents(&IncidentFilter {
                created_after: Some(base + Duration::minutes(30)),
                created_before: Some(base + Duration::minutes(90)),
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(middle.len(), 1);
    }

    #[tokio::test]
    async fn health_check_passes() {
        let store = store().await;
        store.health_check().await.expect("healthy");
    }
}
