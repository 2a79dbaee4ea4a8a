//! Per-incident workspace provisioning.
//!
//! Layout contract with the investigator container:
//! `<root>/<incident-id>/` holds `incident.json` (written before execution)
//! and `output/investigation.md` (written by the investigator). Directories
//! are owner-only and never shared between incidents.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::WorkspaceError;
use crate::executor::REPORT_RELATIVE_PATH;
use crate::incident::Incident;

/// The agent-visible incident context. Deliberately excludes
/// `triggering_event_id`: the upstream fault id is traceability metadata,
/// not investigation input.
#[derive(Debug, Serialize)]
struct IncidentContext<'a> {
    incident_id: String,
    cluster: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource: Option<&'a crate::event::ResourceRef>,
    fault_type: &'a str,
    severity: &'a str,
    context: &'a str,
    fault_occurred_at: chrono::DateTime<chrono::Utc>,
}

/// Create the workspace directory for an incident and write its context
/// file. Returns the workspace path.
pub async fn provision(root: &Path, incident: &Incident) -> Result<PathBuf, WorkspaceError> {
    let workspace = root.join(incident.id.to_string());

    create_private_dir(&workspace).await?;
    create_private_dir(&workspace.join("output")).await?;

    let context = IncidentContext {
        incident_id: incident.id.to_string(),
        cluster: &incident.cluster,
        namespace: incident.namespace.as_deref(),
        resource: incident.resource.as_ref(),
        fault_type: &incident.fault_type,
        severity: &incident.severity,
        context: &incident.context,
        fault_occurred_at: incident.fault_occurred_at,
    };
    let path = workspace.join("incident.json");
    let body = serde_json::to_vec_pretty(&context).map_err(|e| WorkspaceError::WriteContext {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    tokio::fs::write(&path, body)
        .await
        .map_err(|e| WorkspaceError::WriteContext {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    Ok(workspace)
}

/// Read the investigator's report out of a workspace.
pub async fn read_report(workspace: &Path) -> Result<String, WorkspaceError> {
    let path = workspace.join(REPORT_RELATIVE_PATH);
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| WorkspaceError::ReadReport {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

async fn create_private_dir(path: &Path) -> Result<(), WorkspaceError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| WorkspaceError::Create {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| WorkspaceError::Create {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
    }

    Ok(())
}
