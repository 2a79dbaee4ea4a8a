//! Incident pipeline: fault event in, terminal incident out.
//!
//! One event drives one supervised investigation: persist the incident,
//! provision a workspace, run the investigator, classify its output, and
//! settle the record. Outcomes also feed the circuit breaker so a run of
//! consecutive failures raises exactly one degraded alert and the next
//! success after it exactly one recovery notice.
//!
//! Per-event errors are logged and never abort the intake loop.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::db::StateStore;
use crate::error::Error;
use crate::event::FaultEvent;
use crate::executor::{detect_agent_failure, InvestigatorExecutor};
use crate::incident::{AgentExecution, Incident, IncidentStatus, TriageReport};
use crate::notify::Notifier;
use crate::workspace;

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    executor: InvestigatorExecutor,
    breaker: Arc<CircuitBreaker>,
    notifier: Arc<dyn Notifier>,
    workspace_root: PathBuf,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        executor: InvestigatorExecutor,
        breaker: Arc<CircuitBreaker>,
        notifier: Arc<dyn Notifier>,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            store,
            executor,
            breaker,
            notifier,
            workspace_root,
        }
    }

    /// Consume fault events until the sending side closes.
    pub async fn run(&self, mut rx: mpsc::Receiver<FaultEvent>) {
        while let Some(event) = rx.recv().await {
            let fault_id = event.fault_id.clone();
            match self.process_event(event).await {
                Ok(incident_id) => {
                    tracing::info!(fault_id, %incident_id, "Incident settled");
                }
                Err(e) => {
                    tracing::error!(fault_id, "Failed to process fault event: {}", e);
                }
            }
        }
        tracing::info!("Fault event stream closed, orchestrator stopping");
    }

    /// Drive one fault event through the full incident lifecycle. Returns
    /// the incident id once the record is terminal.
    pub async fn process_event(&self, event: FaultEvent) -> Result<Uuid, Error> {
        let incident = Incident::from_event(&event);
        let incident_id = incident.id;
        tracing::info!(
            %incident_id,
            fault_id = event.fault_id,
            cluster = event.cluster,
            fault_type = event.fault_type,
            "Opening incident"
        );

        self.store.create_incident(&incident, &event).await?;

        let workspace = match workspace::provision(&self.workspace_root, &incident).await {
            Ok(workspace) => workspace,
            Err(e) => {
                // No subprocess ever ran; settle the incident as failed and
                // count it against the breaker.
                let reason = format!("workspace provisioning failed: {e}");
                self.store
                    .complete_incident(incident_id, -1, Some(&reason))
                    .await?;
                self.settle_failure(&reason).await;
                return Ok(incident_id);
            }
        };

        self.store
            .update_incident_status(incident_id, IncidentStatus::Investigating, Some(Utc::now()))
            .await?;

        let mut execution = AgentExecution::begin(incident_id);
        self.store.record_agent_execution(&execution).await?;

        let (exit_code, log_paths, exec_error) = match self
            .executor
            .execute(&workspace, &incident_id.to_string())
            .await
        {
            Ok((code, paths)) => (code, paths, None),
            Err(e) => (-1, Default::default(), Some(e)),
        };

        let failure = detect_agent_failure(&workspace, exit_code, exec_error.as_ref());

        execution.complete(exit_code, failure.clone(), log_paths);
        self.store.record_agent_execution(&execution).await?;

        match failure {
            None => {
                self.persist_report(&incident, &execution, &workspace).await;
                self.store.complete_incident(incident_id, 0, None).await?;

                let stats = self.breaker.stats();
                if self.breaker.record_success() {
                    self.notifier.notify_recovered(&stats).await;
                }
            }
            Some(reason) => {
                tracing::warn!(%incident_id, reason, "Investigation failed");
                self.store
                    .complete_incident(incident_id, exit_code, Some(&reason))
                    .await?;
                // A clean exit that violated the output contract is the
                // agent's failure, not the fault's.
                if exit_code == 0 {
                    self.store
                        .update_incident_status(incident_id, IncidentStatus::AgentFailed, None)
                        .await?;
                }
                self.settle_failure(&reason).await;
            }
        }

        Ok(incident_id)
    }

    /// Best effort: a run with a valid report stays resolved even if the
    /// report row cannot be written.
    async fn persist_report(
        &self,
        incident: &Incident,
        execution: &AgentExecution,
        workspace: &std::path::Path,
    ) {
        let markdown = match workspace::read_report(workspace).await {
            Ok(markdown) => markdown,
            Err(e) => {
                tracing::warn!(incident_id = %incident.id, "Failed to read report: {}", e);
                return;
            }
        };
        let report = TriageReport::new(incident.id, execution.id, markdown);
        if let Err(e) = self.store.record_triage_report(&report).await {
            tracing::warn!(incident_id = %incident.id, "Failed to record triage report: {}", e);
        }
    }

    async fn settle_failure(&self, reason: &str) {
        self.breaker.record_failure(reason);
        if self.breaker.should_alert() {
            self.notifier.notify_degraded(&self.breaker.stats()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::breaker::BreakerStats;
    use crate::config::{BreakerConfig, ExecutorConfig};
    use crate::db::LibSqlStore;
    use crate::event::ResourceRef;

    #[derive(Default)]
    struct RecordingNotifier {
        degraded: Mutex<Vec<BreakerStats>>,
        recovered: Mutex<Vec<BreakerStats>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_degraded(&self, stats: &BreakerStats) {
            self.degraded.lock().unwrap().push(stats.clone());
        }

        async fn notify_recovered(&self, stats: &BreakerStats) {
            self.recovered.lock().unwrap().push(stats.clone());
        }
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("investigator.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("script");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    fn executor_config(script_path: PathBuf) -> ExecutorConfig {
        ExecutorConfig {
            script_path,
            cli: "claude".to_string(),
            image: "registry.local/investigator:test".to_string(),
            model: "test-model".to_string(),
            allowed_tools: vec!["kubectl".to_string()],
            timeout: Duration::from_secs(30),
            output_format: "markdown".to_string(),
            network_mode: "none".to_string(),
            debug_logs: false,
            verbose: false,
            kubeconfig: None,
        }
    }

    fn fault(fault_id: &str) -> FaultEvent {
        FaultEvent {
            fault_id: fault_id.to_string(),
            cluster: "prod-1".to_string(),
            subscription: "sub-a".to_string(),
            resource: Some(ResourceRef {
                kind: "Pod".to_string(),
                name: "api-0".to_string(),
                namespace: Some("payments".to_string()),
                api_version: None,
                uid: None,
            }),
            fault_type: "CrashLoopBackOff".to_string(),
            severity: "critical".to_string(),
            context: "container restarted 14 times".to_string(),
            occurred_at: Utc::now(),
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        store: Arc<dyn StateStore>,
        notifier: Arc<RecordingNotifier>,
        _root: tempfile::TempDir,
    }

    async fn harness(script_body: &str, failure_threshold: u32) -> Harness {
        let root = tempfile::tempdir().expect("tempdir");
        let script = write_script(root.path(), script_body);

        let store: Arc<dyn StateStore> =
            Arc::new(LibSqlStore::new_memory().await.expect("memory db"));
        store.run_migrations().await.expect("migrations");

        let breaker = Arc::new(CircuitBreaker::new(&BreakerConfig {
            failure_threshold,
            recent_reasons: 10,
        }));
        let notifier = Arc::new(RecordingNotifier::default());

        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            InvestigatorExecutor::new(executor_config(script)),
            breaker,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            root.path().to_path_buf(),
        );

        Harness {
            orchestrator,
            store,
            notifier,
            _root: root,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_investigation_resolves_the_incident() {
        let h = harness(
            "mkdir -p output && head -c 200 /dev/zero | tr '\\0' 'x' > output/investigation.md",
            3,
        )
        .await;

        let id = h
            .orchestrator
            .process_event(fault("sha256:ok"))
            .await
            .expect("process");

        let incident = h.store.get_incident(id).await.expect("get").expect("found");
        assert_eq!(incident.status, IncidentStatus::Resolved);
        assert_eq!(incident.exit_code, Some(0));
        assert!(incident.failure_reason.is_none());
        assert!(incident.started_at.is_some());
        assert!(incident.completed_at.is_some());

        let executions = h.store.list_agent_executions(id).await.expect("list");
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].exit_code, Some(0));
        assert!(executions[0].completed_at.is_some());

        let reports = h.store.list_triage_reports(id).await.expect("list");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].markdown.len(), 200);

        // A healthy run never touches the notifier.
        assert!(h.notifier.degraded.lock().unwrap().is_empty());
        assert!(h.notifier.recovered.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_fails_the_incident() {
        let h = harness("exit 3", 10).await;

        let id = h
            .orchestrator
            .process_event(fault("sha256:bad"))
            .await
            .expect("process");

        let incident = h.store.get_incident(id).await.expect("get").expect("found");
        assert_eq!(incident.status, IncidentStatus::Failed);
        assert_eq!(incident.exit_code, Some(3));
        assert_eq!(
            incident.failure_reason.as_deref(),
            Some("agent exited with non-zero code: 3")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_exit_without_report_is_agent_failed() {
        let h = harness("exit 0", 10).await;

        let id = h
            .orchestrator
            .process_event(fault("sha256:empty"))
            .await
            .expect("process");

        let incident = h.store.get_incident(id).await.expect("get").expect("found");
        assert_eq!(incident.status, IncidentStatus::AgentFailed);
        assert_eq!(incident.exit_code, Some(0));
        assert_eq!(
            incident.failure_reason.as_deref(),
            Some("investigation.md file not found")
        );

        let executions = h.store.list_agent_executions(id).await.expect("list");
        assert_eq!(
            executions[0].error_message.as_deref(),
            Some("investigation.md file not found")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn breaker_alerts_once_then_recovers_once() {
        // The script fails until STOP_FAILING appears next to the workspaces,
        // then produces a valid report.
        let h = harness(
            "if [ -f ../STOP_FAILING ]; then \
               mkdir -p output && head -c 200 /dev/zero | tr '\\0' 'x' > output/investigation.md; \
             else exit 1; fi",
            3,
        )
        .await;

        for i in 0..3 {
            h.orchestrator
                .process_event(fault(&format!("sha256:f{i}")))
                .await
                .expect("process");
        }
        {
            let degraded = h.notifier.degraded.lock().unwrap();
            assert_eq!(degraded.len(), 1);
            assert_eq!(degraded[0].failure_count, 3);
            assert_eq!(degraded[0].recent_reasons.len(), 3);
        }

        // A fourth failure in the same open period does not re-alert.
        h.orchestrator
            .process_event(fault("sha256:f3"))
            .await
            .expect("process");
        assert_eq!(h.notifier.degraded.lock().unwrap().len(), 1);

        std::fs::write(h._root.path().join("STOP_FAILING"), b"").expect("flag");
        let id = h
            .orchestrator
            .process_event(fault("sha256:recover"))
            .await
            .expect("process");

        let incident = h.store.get_incident(id).await.expect("get").expect("found");
        assert_eq!(incident.status, IncidentStatus::Resolved);
        let recovered = h.notifier.recovered.lock().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].failure_count, 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_drains_the_channel_and_stops_on_close() {
        let h = harness(
            "mkdir -p output && head -c 200 /dev/zero | tr '\\0' 'x' > output/investigation.md",
            3,
        )
        .await;

        let (tx, rx) = mpsc::channel(4);
        tx.send(fault("sha256:s1")).await.expect("send");
        tx.send(fault("sha256:s2")).await.expect("send");
        drop(tx);

        h.orchestrator.run(rx).await;

        let all = h
            .store
            .list_incidents(&crate::db::IncidentFilter::default())
            .await
            .expect("list");
        assert_eq!(all.len(), 2);
        assert!(all
            .iter()
            .all(|i| i.status == IncidentStatus::Resolved));
    }
}
