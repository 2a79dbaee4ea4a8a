//! SQLite-dialect schema for the libSQL backend.
//!
//! Mirrors the PostgreSQL schema with the usual type translation:
//! - `UUID` -> `TEXT` (hex string)
//! - `TIMESTAMPTZ` -> `TEXT` (RFC 3339)
//! - `JSONB` -> `TEXT` (JSON encoded)
//!
//! Run once on database creation; idempotent via `IF NOT EXISTS`.

pub const SCHEMA: &str = r#"

-- ==================== Fault events ====================

CREATE TABLE IF NOT EXISTS fault_events (
    fault_id TEXT PRIMARY KEY,
    cluster TEXT NOT NULL,
    subscription TEXT NOT NULL,
    resource_kind TEXT,
    resource_name TEXT,
    resource_namespace TEXT,
    resource_api_version TEXT,
    resource_uid TEXT,
    fault_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    context TEXT NOT NULL,
    occurred_at TEXT NOT NULL,
    received_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fault_events_received_at ON fault_events(received_at);

-- ==================== Incidents ====================

CREATE TABLE IF NOT EXISTS incidents (
    incident_id TEXT PRIMARY KEY,
    fault_id TEXT NOT NULL REFERENCES fault_events(fault_id),
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    exit_code INTEGER,
    failure_reason TEXT,
    cluster TEXT NOT NULL,
    namespace TEXT,
    resource_kind TEXT,
    resource_name TEXT,
    resource_namespace TEXT,
    resource_api_version TEXT,
    resource_uid TEXT,
    fault_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    context TEXT NOT NULL,
    fault_occurred_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_incidents_status ON incidents(status);
CREATE INDEX IF NOT EXISTS idx_incidents_cluster ON incidents(cluster);
CREATE INDEX IF NOT EXISTS idx_incidents_namespace ON incidents(namespace);
CREATE INDEX IF NOT EXISTS idx_incidents_fault_type ON incidents(fault_type);
CREATE INDEX IF NOT EXISTS idx_incidents_severity ON incidents(severity);
CREATE INDEX IF NOT EXISTS idx_incidents_created_at ON incidents(created_at);

-- ==================== Agent executions ====================

CREATE TABLE IF NOT EXISTS agent_executions (
    execution_id TEXT PRIMARY KEY,
    incident_id TEXT NOT NULL REFERENCES incidents(incident_id),
    started_at TEXT NOT NULL,
    completed_at TEXT,
    exit_code INTEGER,
    error_message TEXT,
    log_paths TEXT
);

CREATE INDEX IF NOT EXISTS idx_agent_executions_incident ON agent_executions(incident_id);

-- ==================== Triage reports ====================

CREATE TABLE IF NOT EXISTS triage_reports (
    report_id TEXT PRIMARY KEY,
    incident_id TEXT NOT NULL REFERENCES incidents(incident_id),
    execution_id TEXT NOT NULL REFERENCES agent_executions(execution_id),
    markdown TEXT NOT NULL,
    html TEXT,
    generated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_triage_reports_incident ON triage_reports(incident_id);

"#;
