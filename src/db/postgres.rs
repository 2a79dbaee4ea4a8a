//! PostgreSQL backend for the StateStore trait.
//!
//! Pooled via deadpool; the incident create path uses an explicit
//! transaction so the fault event and incident rows land atomically.

use std::collections::HashMap;

use async_trait::async_trait;
use deadpool_postgres::{Config as PgConfig, Pool, Runtime};
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::{IncidentFilter, StateStore};
use crate::error::DatabaseError;
use crate::event::FaultEvent;
use crate::incident::{AgentExecution, Incident, IncidentStatus, TriageReport};

/// PostgreSQL state store.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Build the connection pool from configuration. Connections are
    /// established lazily on first use.
    pub fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let DatabaseConfig::Postgres {
            host,
            port,
            user,
            password,
            dbname,
            pool_size,
        } = config
        else {
            return Err(DatabaseError::Pool(
                "PgStore requires a postgres configuration".to_string(),
            ));
        };

        let mut cfg = PgConfig::new();
        cfg.host = Some(host.clone());
        cfg.port = Some(*port);
        cfg.user = Some(user.clone());
        cfg.password = Some(password.clone());
        cfg.dbname = Some(dbname.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(*pool_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(format!("failed to create pool: {}", e)))?;

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        self.pool
            .get()
            .await
            .map_err(|e| DatabaseError::Pool(e.to_string()))
    }
}

#[async_trait]
impl StateStore for PgStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.batch_execute(crate::db::pg_migrations::SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }

    async fn create_incident(
        &self,
        incident: &Incident,
        event: &FaultEvent,
    ) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let resource = event.resource.as_ref();
        tx.execute(
            r#"
            INSERT INTO fault_events (
                fault_id, cluster, subscription,
                resource_kind, resource_name, resource_namespace,
                resource_api_version, resource_uid,
                fault_type, severity, context, occurred_at, received_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW()
            )
            ON CONFLICT (fault_id) DO NOTHING
            "#,
            &[
                &event.fault_id,
                &event.cluster,
                &event.subscription,
                &resource.map(|r| r.kind.as_str()),
                &resource.map(|r| r.name.as_str()),
                &resource.and_then(|r| r.namespace.as_deref()),
                &resource.and_then(|r| r.api_version.as_deref()),
                &resource.and_then(|r| r.uid.as_deref()),
                &event.fault_type,
                &event.severity,
                &event.context,
                &event.occurred_at,
            ],
        )
        .await?;

        let inc_resource = incident.resource.as_ref();
        tx.execute(
            r#"
            INSERT INTO incidents (
                incident_id, fault_id, status, created_at, started_at, completed_at,
                exit_code, failure_reason, cluster, namespace,
                resource_kind, resource_name, resource_namespace,
                resource_api_version, resource_uid,
                fault_type, severity, context, fault_occurred_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19
            )
            "#,
            &[
                &incident.id,
                &incident.triggering_event_id,
                &incident.status.as_str(),
                &incident.created_at,
                &incident.started_at,
                &incident.completed_at,
                &incident.exit_code,
                &incident.failure_reason,
                &incident.cluster,
                &incident.namespace,
                &inc_resource.map(|r| r.kind.as_str()),
                &inc_resource.map(|r| r.name.as_str()),
                &inc_resource.and_then(|r| r.namespace.as_deref()),
                &inc_resource.and_then(|r| r.api_version.as_deref()),
                &inc_resource.and_then(|r| r.uid.as_deref()),
                &incident.fault_type,
                &incident.severity,
                &incident.context,
                &incident.fault_occurred_at,
            ],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_incident_status(
        &self,
        id: Uuid,
        status: IncidentStatus,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                r#"
                UPDATE incidents
                SET status = $2,
                    started_at = COALESCE($3, started_at)
                WHERE incident_id = $1
                "#,
                &[&id, &status.as_str(), &started_at],
            )
            .await?;
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
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                r#"
                UPDATE incidents
                SET status = CASE WHEN $2 = 0 THEN 'resolved' ELSE 'failed' END,
                    completed_at = NOW(),
                    exit_code = $2,
                    failure_reason = $3
                WHERE incident_id = $1
                "#,
                &[&id, &exit_code, &failure_reason],
            )
            .await?;
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
        let conn = self.conn().await?;
        let log_paths = serde_json::to_value(&execution.log_paths)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        conn.execute(
            r#"
            INSERT INTO agent_executions (
                execution_id, incident_id, started_at, completed_at,
                exit_code, error_message, log_paths
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (execution_id) DO UPDATE SET
                completed_at = EXCLUDED.completed_at,
                exit_code = EXCLUDED.exit_code,
                error_message = EXCLUDED.error_message,
                log_paths = EXCLUDED.log_paths
            "#,
            &[
                &execution.id,
                &execution.incident_id,
                &execution.started_at,
                &execution.completed_at,
                &execution.exit_code,
                &execution.error_message,
                &log_paths,
            ],
        )
        .await?;
        Ok(())
    }

    async fn record_triage_report(&self, report: &TriageReport) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO triage_reports (
                report_id, incident_id, execution_id, markdown, html, generated_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            &[
                &report.id,
                &report.incident_id,
                &report.execution_id,
                &report.markdown,
                &report.html,
                &report.generated_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>, DatabaseError> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {} FROM incidents WHERE incident_id = $1",
            INCIDENT_COLUMNS
        );
        let row = conn.query_opt(sql.as_str(), &[&id]).await?;
        row.map(|r| row_to_incident(&r)).transpose()
    }

    async fn list_incidents(
        &self,
        filter: &IncidentFilter,
    ) -> Result<Vec<Incident>, DatabaseError> {
        let conn = self.conn().await?;

        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();

        // Owned values must outlive the params slice.
        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        if !statuses.is_empty() {
            params.push(&statuses);
            clauses.push(format!("status = ANY(${})", params.len()));
        }
        if let Some(cluster) = &filter.cluster {
            params.push(cluster);
            clauses.push(format!("cluster = ${}", params.len()));
        }
        if let Some(namespace) = &filter.namespace {
            params.push(namespace);
            clauses.push(format!("namespace = ${}", params.len()));
        }
        if let Some(fault_type) = &filter.fault_type {
            params.push(fault_type);
            clauses.push(format!("fault_type = ${}", params.len()));
        }
        if let Some(severity) = &filter.severity {
            params.push(severity);
            clauses.push(format!("severity = ${}", params.len()));
        }
        if let Some(before) = &filter.created_before {
            params.push(before);
            clauses.push(format!("created_at < ${}", params.len()));
        }
        if let Some(after) = &filter.created_after {
            params.push(after);
            clauses.push(format!("created_at > ${}", params.len()));
        }

        let mut sql = format!("SELECT {} FROM incidents", INCIDENT_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = &filter.limit {
            params.push(limit);
            sql.push_str(&format!(" LIMIT ${}", params.len()));
        }
        if let Some(offset) = &filter.offset {
            params.push(offset);
            sql.push_str(&format!(" OFFSET ${}", params.len()));
        }

        let rows = conn.query(sql.as_str(), &params).await?;
        rows.iter().map(row_to_incident).collect()
    }

    async fn list_agent_executions(
        &self,
        incident_id: Uuid,
    ) -> Result<Vec<AgentExecution>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                r#"
                SELECT execution_id, incident_id, started_at, completed_at,
                       exit_code, error_message, log_paths
                FROM agent_executions
                WHERE incident_id = $1
                ORDER BY started_at ASC
                "#,
                &[&incident_id],
            )
            .await?;
        rows.iter().map(row_to_execution).collect()
    }

    async fn list_triage_reports(
        &self,
        incident_id: Uuid,
    ) -> Result<Vec<TriageReport>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                r#"
                SELECT report_id, incident_id, execution_id, markdown, html, generated_at
                FROM triage_reports
                WHERE incident_id = $1
                ORDER BY generated_at ASC
                "#,
                &[&incident_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| TriageReport {
                id: r.get("report_id"),
                incident_id: r.get("incident_id"),
                execution_id: r.get("execution_id"),
                markdown: r.get("markdown"),
                html: r.get("html"),
                generated_at: r.get("generated_at"),
            })
            .collect())
    }

    async fn health_check(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// Explicit column list for incidents (matches named access in `row_to_incident`).
const INCIDENT_COLUMNS: &str = "\
    incident_id, fault_id, status, created_at, started_at, completed_at, \
    exit_code, failure_reason, cluster, namespace, \
    resource_kind, resource_name, resource_namespace, resource_api_version, resource_uid, \
    fault_type, severity, context, fault_occurred_at";

fn row_to_incident(row: &Row) -> Result<Incident, DatabaseError> {
    let status_str: String = row.get("status");
    let status = IncidentStatus::parse(&status_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown incident status: {}", status_str))
    })?;

    let resource = row
        .get::<_, Option<String>>("resource_kind")
        .map(|kind| crate::event::ResourceRef {
            kind,
            name: row.get::<_, Option<String>>("resource_name").unwrap_or_default(),
            namespace: row.get("resource_namespace"),
            api_version: row.get("resource_api_version"),
            uid: row.get("resource_uid"),
        });

    Ok(Incident {
        id: row.get("incident_id"),
        status,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        exit_code: row.get("exit_code"),
        failure_reason: row.get("failure_reason"),
        cluster: row.get("cluster"),
        namespace: row.get("namespace"),
        resource,
        fault_type: row.get("fault_type"),
        severity: row.get("severity"),
        context: row.get("context"),
        fault_occurred_at: row.get("fault_occurred_at"),
        triggering_event_id: row.get("fault_id"),
    })
}

fn row_to_execution(row: &Row) -> Result<AgentExecution, DatabaseError> {
    let log_paths: HashMap<String, String> = match row.get::<_, Option<serde_json::Value>>("log_paths") {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        None => HashMap::new(),
    };

    Ok(AgentExecution {
        id: row.get("execution_id"),
        incident_id: row.get("incident_id"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        exit_code: row.get("exit_code"),
        error_message: row.get("error_message"),
        log_paths,
    })
}
