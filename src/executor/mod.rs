//! Investigator subprocess executor.
//!
//! Launches the configured investigator script under a hard deadline, with
//! stdout and stderr each consumed by a dedicated reader task. Lines are
//! forwarded to structured logging in real time; in debug mode they are also
//! persisted to per-stream files plus one interleaved, timestamped combined
//! file. Both readers complete before `execute` returns.
//!
//! A non-zero exit code is a normal result here; classification happens in
//! the output validator. Only launch/pipe/wait failures are errors.

mod validate;

pub use validate::{detect_agent_failure, MIN_REPORT_BYTES, REPORT_RELATIVE_PATH};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ExecutorConfig;
use crate::error::ExecutorError;

/// Fixed buffer added on top of the configured investigation timeout so the
/// investigator gets a chance to flush output before being killed.
const TIMEOUT_GRACE: Duration = Duration::from_secs(30);

const STDOUT_LOG: &str = "logs/agent-stdout.log";
const STDERR_LOG: &str = "logs/agent-stderr.log";
const COMBINED_LOG: &str = "logs/agent-full.log";
const PROMPT_AUDIT: &str = "prompt-sent.md";

/// Runs the investigator as a subprocess with concurrent output capture.
pub struct InvestigatorExecutor {
    config: ExecutorConfig,
    grace: Duration,
}

impl InvestigatorExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            grace: TIMEOUT_GRACE,
        }
    }

    #[cfg(test)]
    fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run one investigation in `workspace`.
    ///
    /// Returns the subprocess exit code (`-1` when the OS reports none, e.g.
    /// after a timeout kill) and the map of persisted log paths (empty in
    /// non-debug mode). Blocks until the process has exited and both stream
    /// readers have drained.
    pub async fn execute(
        &self,
        workspace: &Path,
        incident_id: &str,
    ) -> Result<(i32, HashMap<String, String>), ExecutorError> {
        if self.config.debug_logs {
            self.write_prompt_audit(workspace, incident_id).await;
        }

        let mut cmd = Command::new(&self.config.script_path);
        self.apply_env_contract(&mut cmd, incident_id);
        cmd.current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ExecutorError::Spawn {
            reason: e.to_string(),
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(ExecutorError::Pipe { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ExecutorError::Pipe { stream: "stderr" })?;

        let (sinks, log_paths) = self.open_log_sinks(workspace).await;

        let stdout_task = spawn_stream_reader(
            stdout,
            "STDOUT",
            incident_id.to_string(),
            sinks.stdout,
            sinks.combined.clone(),
        );
        let stderr_task = spawn_stream_reader(
            stderr,
            "STDERR",
            incident_id.to_string(),
            sinks.stderr,
            sinks.combined,
        );

        let deadline = self.config.timeout + self.grace;
        let status = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                let _ = tokio::join!(stdout_task, stderr_task);
                return Err(ExecutorError::Wait {
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                tracing::warn!(
                    incident_id,
                    timeout_secs = deadline.as_secs(),
                    "Investigation deadline exceeded, killing investigator"
                );
                let _ = child.start_kill();
                match child.wait().await {
                    Ok(status) => status,
                    Err(e) => {
                        let _ = tokio::join!(stdout_task, stderr_task);
                        return Err(ExecutorError::Wait {
                            reason: e.to_string(),
                        });
                    }
                }
            }
        };

        // Both readers must drain before we report the outcome; the kill
        // above closes the pipes so this cannot hang.
        let _ = tokio::join!(stdout_task, stderr_task);

        let exit_code = status.code().unwrap_or(-1);
        tracing::info!(incident_id, exit_code, "Investigator exited");

        Ok((exit_code, log_paths))
    }

    /// The entire child-process contract: configuration is passed only via
    /// environment variables, never positional arguments.
    fn apply_env_contract(&self, cmd: &mut Command, incident_id: &str) {
        cmd.env("INCIDENT_ID", incident_id)
            .env("INVESTIGATOR_CLI", &self.config.cli)
            .env("INVESTIGATOR_IMAGE", &self.config.image)
            .env("INVESTIGATOR_MODEL", &self.config.model)
            .env(
                "INVESTIGATOR_ALLOWED_TOOLS",
                self.config.allowed_tools.join(","),
            )
            .env(
                "INVESTIGATION_TIMEOUT_SECS",
                self.config.timeout.as_secs().to_string(),
            )
            .env("INVESTIGATOR_OUTPUT_FORMAT", &self.config.output_format)
            .env("INVESTIGATOR_NETWORK_MODE", &self.config.network_mode);

        if self.config.debug_logs {
            cmd.env("INVESTIGATOR_DEBUG", "true");
        }
        if self.config.verbose {
            cmd.env("INVESTIGATOR_VERBOSE", "true");
        }
        if let Some(kubeconfig) = &self.config.kubeconfig {
            cmd.env("KUBECONFIG", kubeconfig);
        }
    }

    /// Best-effort audit record of the composed instruction text. Failure to
    /// write it never aborts the run.
    async fn write_prompt_audit(&self, workspace: &Path, incident_id: &str) {
        let text = self.compose_instructions(incident_id);
        let path = workspace.join(PROMPT_AUDIT);
        if let Err(e) = tokio::fs::write(&path, text).await {
            tracing::warn!(
                incident_id,
                path = %path.display(),
                "Failed to write prompt audit file: {}",
                e
            );
        }
    }

    fn compose_instructions(&self, incident_id: &str) -> String {
        format!(
            "# Investigation instructions\n\n\
             Incident: {incident_id}\n\
             CLI: {}\n\
             Image: {}\n\
             Model: {}\n\
             Allowed tools: {}\n\
             Timeout: {}s\n\
             Output format: {}\n\
             Network mode: {}\n\n\
             Read incident.json in the workspace root and write your findings\n\
             to output/investigation.md.\n",
            self.config.cli,
            self.config.image,
            self.config.model,
            self.config.allowed_tools.join(","),
            self.config.timeout.as_secs(),
            self.config.output_format,
            self.config.network_mode,
        )
    }

    /// Open debug log files when enabled. In non-debug mode all sinks are
    /// `None` and no files are created.
    async fn open_log_sinks(&self, workspace: &Path) -> (LogSinks, HashMap<String, String>) {
        if !self.config.debug_logs {
            return (LogSinks::default(), HashMap::new());
        }

        let logs_dir = workspace.join("logs");
        if let Err(e) = tokio::fs::create_dir_all(&logs_dir).await {
            tracing::warn!(
                path = %logs_dir.display(),
                "Failed to create logs directory, continuing without log files: {}",
                e
            );
            return (LogSinks::default(), HashMap::new());
        }

        let mut paths = HashMap::new();
        let stdout = open_log_file(workspace.join(STDOUT_LOG), "stdout", &mut paths).await;
        let stderr = open_log_file(workspace.join(STDERR_LOG), "stderr", &mut paths).await;
        let combined = open_log_file(workspace.join(COMBINED_LOG), "combined", &mut paths)
            .await
            .map(|f| Arc::new(Mutex::new(f)));

        (
            LogSinks {
                stdout,
                stderr,
                combined,
            },
            paths,
        )
    }
}

#[derive(Default)]
struct LogSinks {
    stdout: Option<File>,
    stderr: Option<File>,
    combined: Option<Arc<Mutex<File>>>,
}

async fn open_log_file(
    path: PathBuf,
    stream: &str,
    paths: &mut HashMap<String, String>,
) -> Option<File> {
    match File::create(&path).await {
        Ok(f) => {
            paths.insert(stream.to_string(), path.display().to_string());
            Some(f)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "Failed to create {} log file: {}", stream, e);
            None
        }
    }
}

/// One reader per stream: forwards every line to tracing and, when sinks are
/// present, to the per-stream file plus the interleaved combined file with a
/// `<RFC3339> [STDOUT|STDERR]` prefix.
fn spawn_stream_reader<R>(
    stream: R,
    label: &'static str,
    incident_id: String,
    mut own_file: Option<File>,
    combined: Option<Arc<Mutex<File>>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match label {
                "STDOUT" => tracing::info!(incident_id = %incident_id, "investigator: {}", line),
                _ => tracing::debug!(incident_id = %incident_id, "investigator stderr: {}", line),
            }

            if let Some(file) = own_file.as_mut() {
                if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
                    tracing::warn!("Failed to write {} log line: {}", label, e);
                }
            }

            if let Some(combined) = &combined {
                let stamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
                let entry = format!("{stamp} [{label}] {line}\n");
                let mut guard = combined.lock().await;
                if let Err(e) = guard.write_all(entry.as_bytes()).await {
                    tracing::warn!("Failed to write combined log line: {}", e);
                }
            }
        }

        if let Some(file) = own_file.as_mut() {
            let _ = file.flush().await;
        }
        if let Some(combined) = &combined {
            let _ = combined.lock().await.flush().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn config(script_path: PathBuf, timeout: Duration, debug_logs: bool) -> ExecutorConfig {
        ExecutorConfig {
            script_path,
            cli: "claude".to_string(),
            image: "registry.local/investigator:test".to_string(),
            model: "test-model".to_string(),
            allowed_tools: vec!["kubectl".to_string(), "logs".to_string()],
            timeout,
            output_format: "markdown".to_string(),
            network_mode: "none".to_string(),
            debug_logs,
            verbose: false,
            kubeconfig: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn maps_exit_code_and_creates_no_logs_by_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(dir.path(), "echo hello; exit 7");
        let exec = InvestigatorExecutor::new(config(script, Duration::from_secs(10), false));

        let (code, paths) = exec.execute(dir.path(), "inc-1").await.expect("execute");
        assert_eq!(code, 7);
        assert!(paths.is_empty());
        assert!(!dir.path().join("logs").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn passes_configuration_through_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(
            dir.path(),
            "printf '%s|%s|%s|%s' \"$INCIDENT_ID\" \"$INVESTIGATOR_MODEL\" \
             \"$INVESTIGATOR_ALLOWED_TOOLS\" \"$INVESTIGATION_TIMEOUT_SECS\" > env-seen.txt",
        );
        let exec = InvestigatorExecutor::new(config(script, Duration::from_secs(42), false));

        let (code, _) = exec.execute(dir.path(), "inc-env").await.expect("execute");
        assert_eq!(code, 0);
        let seen = std::fs::read_to_string(dir.path().join("env-seen.txt")).expect("env file");
        assert_eq!(seen, "inc-env|test-model|kubectl,logs|42");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn debug_mode_persists_all_three_log_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(dir.path(), "echo out-line; echo err-line >&2");
        let exec = InvestigatorExecutor::new(config(script, Duration::from_secs(10), true));

        let (code, paths) = exec.execute(dir.path(), "inc-dbg").await.expect("execute");
        assert_eq!(code, 0);
        assert_eq!(paths.len(), 3);

        let stdout_log =
            std::fs::read_to_string(dir.path().join(STDOUT_LOG)).expect("stdout log");
        assert_eq!(stdout_log, "out-line\n");
        let stderr_log =
            std::fs::read_to_string(dir.path().join(STDERR_LOG)).expect("stderr log");
        assert_eq!(stderr_log, "err-line\n");

        let combined = std::fs::read_to_string(dir.path().join(COMBINED_LOG)).expect("combined");
        assert!(combined.contains("[STDOUT] out-line"), "{combined}");
        assert!(combined.contains("[STDERR] err-line"), "{combined}");
        // Every combined line carries a timestamp prefix.
        for line in combined.lines() {
            let stamp = line.split(' ').next().expect("stamp");
            assert!(
                chrono::DateTime::parse_from_rfc3339(stamp).is_ok(),
                "bad stamp in: {line}"
            );
        }

        // Audit record is written in debug mode.
        let audit =
            std::fs::read_to_string(dir.path().join(PROMPT_AUDIT)).expect("prompt audit");
        assert!(audit.contains("inc-dbg"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deadline_kill_yields_undefined_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(dir.path(), "sleep 30");
        let exec = InvestigatorExecutor::new(config(script, Duration::from_millis(50), false))
            .with_grace(Duration::from_millis(50));

        let (code, _) = exec.execute(dir.path(), "inc-slow").await.expect("execute");
        // Killed by signal: no exit code from the OS, mapped to -1. The
        // validator classifies this as a failure via the non-zero code.
        assert_ne!(code, 0);
    }

    #[tokio::test]
    async fn missing_script_is_a_spawn_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exec = InvestigatorExecutor::new(config(
            dir.path().join("does-not-exist.sh"),
            Duration::from_secs(5),
            false,
        ));

        let err = exec.execute(dir.path(), "inc-x").await.expect_err("spawn error");
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }
}
