use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::types::ProcessConfig;
use crate::error::{PyrunError, Result};
use crate::sandbox::child::run_child;
use crate::sandbox::handle::SandboxHandle;
use crate::sandbox::traits::{IsolatedExecutor, IsolationCapabilities, RunOutput};

/// PATH handed to the child; nothing else is inherited from the host.
const CLEAN_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Bare-subprocess executor.
///
/// Runs the script directly on the host with a cleared environment, closed
/// stdin and the artifact directory as working directory. This is the lowest
/// isolation level: no namespaces, no resource caps.
pub struct ProcessExecutor {
    interpreter: PathBuf,
    interpreter_args: Vec<String>,
    script_name: String,
    scratch_root: Option<PathBuf>,
    max_output_bytes: usize,
}

impl ProcessExecutor {
    /// Create a new process executor.
    ///
    /// The interpreter is resolved on PATH now so the cleared child
    /// environment does not need to find it.
    pub fn new(
        config: &ProcessConfig,
        scratch_root: Option<PathBuf>,
        max_output_bytes: usize,
    ) -> Result<Self> {
        let interpreter = which::which(&config.interpreter).map_err(|e| {
            PyrunError::ExecutorUnavailable {
                executor: "process".to_string(),
                reason: format!("interpreter '{}' not found: {}", config.interpreter, e),
            }
        })?;

        info!(interpreter = %interpreter.display(), "Process executor initialized");

        Ok(Self {
            interpreter,
            interpreter_args: config.interpreter_args.clone(),
            script_name: config.script_name.clone(),
            scratch_root,
            max_output_bytes,
        })
    }

    /// Version string reported by the interpreter, if it answers.
    pub async fn interpreter_version(&self) -> Option<String> {
        let output = Command::new(&self.interpreter)
            .arg("--version")
            .env_clear()
            .env("PATH", CLEAN_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }

        // Older Pythons print the version on stderr
        let text = if output.stdout.is_empty() {
            output.stderr
        } else {
            output.stdout
        };
        let version = String::from_utf8_lossy(&text).trim().to_string();
        (!version.is_empty()).then_some(version)
    }

    fn build_command(&self, handle: &SandboxHandle) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(&self.interpreter_args);
        // Relative name keeps host paths out of tracebacks
        cmd.arg(handle.script_name());
        cmd.current_dir(handle.dir());

        cmd.env_clear();
        cmd.env("PATH", CLEAN_PATH);
        cmd.env("HOME", handle.dir());
        cmd.env("PYTHONDONTWRITEBYTECODE", "1");
        cmd.env("PYTHONIOENCODING", "utf-8");
        cmd.env("PYTHONUNBUFFERED", "1");
        cmd
    }
}

#[async_trait]
impl IsolatedExecutor for ProcessExecutor {
    fn name(&self) -> &str {
        "process"
    }

    fn script_name(&self) -> &str {
        &self.script_name
    }

    fn capabilities(&self) -> IsolationCapabilities {
        IsolationCapabilities {
            isolated_fs: false,
            network_disabled: false,
            resource_capped: false,
            unprivileged: false,
            separate_streams: true,
        }
    }

    async fn run(&self, code: &str, timeout: Duration) -> Result<RunOutput> {
        let handle =
            SandboxHandle::create(self.scratch_root.as_deref(), &self.script_name, code, timeout)
                .await?;

        debug!(
            script = %handle.script_path().display(),
            timeout_secs = timeout.as_secs(),
            "Running code in child process"
        );

        let cmd = self.build_command(&handle);
        let program = self.interpreter.display().to_string();
        let outcome = run_child(cmd, &program, handle.remaining(), self.max_output_bytes).await;

        handle.release().await;
        outcome
    }

    fn metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                "interpreter".to_string(),
                self.interpreter.display().to_string(),
            ),
            ("script_name".to_string(), self.script_name.clone()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_executor(root: &std::path::Path, max_output: usize) -> ProcessExecutor {
        let config = ProcessConfig {
            interpreter: "sh".to_string(),
            interpreter_args: vec![],
            script_name: "main.sh".to_string(),
        };
        ProcessExecutor::new(&config, Some(root.to_path_buf()), max_output).unwrap()
    }

    fn entries(path: &std::path::Path) -> usize {
        std::fs::read_dir(path).unwrap().count()
    }

    #[tokio::test]
    async fn test_runs_code_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let executor = sh_executor(root.path(), 1024);

        let output = executor
            .run("echo hi", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(output.stdout, "hi\n");
        assert!(output.stderr.is_empty());
        assert!(output.success());
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_program_error_keeps_streams() {
        let root = tempfile::tempdir().unwrap();
        let executor = sh_executor(root.path(), 1024);

        let output = executor
            .run("echo before; echo broken >&2; exit 1", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(output.stdout, "before\n");
        assert_eq!(output.stderr, "broken\n");
        assert_eq!(output.exit_code, Some(1));
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_timeout_kills_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let executor = sh_executor(root.path(), 1024);

        let started = std::time::Instant::now();
        let output = executor
            .run("echo early; while true; do :; done", Duration::from_secs(1))
            .await
            .unwrap();

        assert!(output.timed_out);
        assert!(output.stdout.is_empty());
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        std::env::set_var("PYRUN_TEST_SECRET", "hunter2");
        let root = tempfile::tempdir().unwrap();
        let executor = sh_executor(root.path(), 1024);

        let output = executor
            .run("echo \"[$PYRUN_TEST_SECRET]\"", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(output.stdout, "[]\n");
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let root = tempfile::tempdir().unwrap();
        let executor = sh_executor(root.path(), 100);

        let output = executor
            .run("i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(output.truncated);
        assert_eq!(output.stdout.len(), 100);
        assert!(output.success());
    }

    #[test]
    fn test_missing_interpreter_is_unavailable() {
        let config = ProcessConfig {
            interpreter: "definitely-not-an-interpreter-xyz".to_string(),
            ..ProcessConfig::default()
        };
        let err = ProcessExecutor::new(&config, None, 1024).err().unwrap();
        assert!(matches!(err, PyrunError::ExecutorUnavailable { .. }));
    }
}
