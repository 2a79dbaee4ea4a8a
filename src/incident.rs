//! Incident domain records.
//!
//! An `Incident` is this system's record of one investigation triggered by a
//! fault event. The event fields are flattened onto the incident at creation
//! time so the record is self-contained; `triggering_event_id` exists purely
//! for traceability and is never exposed to the investigator.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{FaultEvent, ResourceRef};

/// Incident lifecycle status.
///
/// Transitions only ever go investigating -> {resolved, failed, agent_failed}.
/// A terminal incident is never reopened; a later fault creates a fresh row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Investigating,
    Resolved,
    Failed,
    /// The investigator exited 0 but violated the output contract.
    AgentFailed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Failed => "failed",
            IncidentStatus::AgentFailed => "agent_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "investigating" => Some(IncidentStatus::Investigating),
            "resolved" => Some(IncidentStatus::Resolved),
            "failed" => Some(IncidentStatus::Failed),
            "agent_failed" => Some(IncidentStatus::AgentFailed),
            _ => None,
        }
    }
}

/// One fault-to-investigation lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
    pub cluster: String,
    pub namespace: Option<String>,
    pub resource: Option<ResourceRef>,
    pub fault_type: String,
    pub severity: String,
    pub context: String,
    pub fault_occurred_at: DateTime<Utc>,
    /// The upstream fault id; traceability only, never agent-visible.
    pub triggering_event_id: String,
}

impl Incident {
    /// Create a fresh investigating incident from an accepted fault event.
    pub fn from_event(event: &FaultEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: IncidentStatus::Investigating,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            failure_reason: None,
            cluster: event.cluster.clone(),
            namespace: event
                .resource
                .as_ref()
                .and_then(|r| r.namespace.clone()),
            resource: event.resource.clone(),
            fault_type: event.fault_type.clone(),
            severity: event.severity.clone(),
            context: event.context.clone(),
            fault_occurred_at: event.occurred_at,
            triggering_event_id: event.fault_id.clone(),
        }
    }
}

/// One investigator subprocess attempt for an incident.
///
/// Recorded once at start and re-recorded with completion fields when the
/// subprocess exits; the store upserts on `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecution {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    /// Log stream name -> file path, populated only in debug mode.
    pub log_paths: HashMap<String, String>,
}

impl AgentExecution {
    /// Start a new execution row for an incident.
    pub fn begin(incident_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            incident_id,
            started_at: Utc::now(),
            completed_at: None,
            exit_code: None,
            error_message: None,
            log_paths: HashMap::new(),
        }
    }

    /// Fill in the completion fields after the subprocess has exited.
    pub fn complete(
        &mut self,
        exit_code: i32,
        error_message: Option<String>,
        log_paths: HashMap<String, String>,
    ) {
        self.completed_at = Some(Utc::now());
        self.exit_code = Some(exit_code);
        self.error_message = error_message;
        self.log_paths = log_paths;
    }
}

/// The investigator's report, written at most once per execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageReport {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub execution_id: Uuid,
    pub markdown: String,
    pub html: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl TriageReport {
    pub fn new(incident_id: Uuid, execution_id: Uuid, markdown: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            incident_id,
            execution_id,
            markdown,
            html: None,
            generated_at: Utc::now(),
        }
    }
}
