use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::types::DockerConfig;
use crate::error::{PyrunError, Result};
use crate::sandbox::child::run_child;
use crate::sandbox::factory::ExecutorAvailability;
use crate::sandbox::handle::SandboxHandle;
use crate::sandbox::traits::{IsolatedExecutor, IsolationCapabilities, RunOutput};

/// Mount point of the artifact directory inside the container
const CONTAINER_WORKDIR: &str = "/app";

/// Writable scratch space; the root filesystem is read-only
const CONTAINER_TMPFS: &str = "/tmp:rw,noexec,nosuid,size=16m";

/// Exit status of a container killed by SIGKILL (OOM killer included)
const EXIT_KILLED: i32 = 137;

/// Docker sandbox executor.
///
/// Each run creates a fresh, single-use container with `docker run --rm`,
/// mounting the script read-only. Every container gets the full resource
/// envelope: memory ceiling, CPU share, no network and a non-root user.
pub struct DockerExecutor {
    docker_bin: String,
    image: Option<String>,
    unavailable_reason: Option<String>,
    interpreter: String,
    script_name: String,
    memory_limit_mb: u64,
    cpus: f64,
    user: String,
    pids_limit: u32,
    scratch_root: Option<PathBuf>,
    max_output_bytes: usize,
}

/// How a finished `docker run` is interpreted.
#[derive(Debug, PartialEq, Eq)]
enum ContainerExit {
    /// The program ran; its output stands as-is
    Completed,
    /// The program was killed for exceeding the memory ceiling
    OutOfMemory,
    /// Docker itself failed before or while starting the program
    Runtime,
}

impl DockerExecutor {
    /// Create a new Docker executor from the start-up availability probe.
    ///
    /// When the probe found no usable runtime or image the executor is still
    /// constructed, but reports itself unavailable and refuses to run code.
    pub fn new(
        config: &DockerConfig,
        availability: &ExecutorAvailability,
        scratch_root: Option<PathBuf>,
        max_output_bytes: usize,
    ) -> Self {
        let (image, unavailable_reason) = if availability.container_available {
            (availability.image.clone(), None)
        } else {
            (
                None,
                Some(
                    availability
                        .reason
                        .clone()
                        .unwrap_or_else(|| "container runtime was not provisioned".to_string()),
                ),
            )
        };

        if let Some(image) = &image {
            info!(image = %image, "Docker executor initialized");
        }

        Self {
            docker_bin: config.docker_bin.clone(),
            image,
            unavailable_reason,
            interpreter: config.interpreter.clone(),
            script_name: config.script_name.clone(),
            memory_limit_mb: config.memory_limit_mb,
            cpus: config.cpus,
            user: config.user.clone(),
            pids_limit: config.pids_limit,
            scratch_root,
            max_output_bytes,
        }
    }

    /// Arguments for a single-use `docker run`.
    fn container_args(&self, image: &str, name: &str, host_dir: &Path) -> Vec<String> {
        let memory = format!("{}m", self.memory_limit_mb);
        vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
            // Resource envelope
            "--network=none".to_string(),
            format!("--memory={}", memory),
            format!("--memory-swap={}", memory),
            format!("--cpus={}", self.cpus),
            format!("--user={}", self.user),
            // Hardening
            format!("--pids-limit={}", self.pids_limit),
            "--read-only".to_string(),
            format!("--tmpfs={}", CONTAINER_TMPFS),
            "--cap-drop=ALL".to_string(),
            "--security-opt=no-new-privileges".to_string(),
            // Interpreter environment
            "-e".to_string(),
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
            "-e".to_string(),
            "PYTHONUNBUFFERED=1".to_string(),
            "-v".to_string(),
            format!("{}:{}:ro", host_dir.display(), CONTAINER_WORKDIR),
            "-w".to_string(),
            CONTAINER_WORKDIR.to_string(),
            image.to_string(),
            self.interpreter.clone(),
            self.script_name.clone(),
        ]
    }

    async fn run_container(&self, image: &str, handle: &mut SandboxHandle) -> Result<RunOutput> {
        handle.share_read_only().await?;

        let name = format!("pyrun-{}", Uuid::new_v4());
        handle.attach_container(&self.docker_bin, &name);

        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(self.container_args(image, &name, handle.dir()));

        debug!(container = %name, image = %image, "Starting sandbox container");

        let output = run_child(cmd, &self.docker_bin, handle.remaining(), self.max_output_bytes)
            .await
            .map_err(|e| match e {
                // The runtime itself is missing, not the submitted code
                PyrunError::Spawn { program, source } => PyrunError::Infrastructure(format!(
                    "failed to run '{}': {}",
                    program, source
                )),
                other => other,
            })?;

        if output.timed_out {
            warn!(container = %name, "Container exceeded its deadline");
            return Ok(output);
        }

        match classify_exit(output.exit_code, &output.stderr) {
            ContainerExit::Completed => Ok(output),
            ContainerExit::OutOfMemory => Ok(RunOutput {
                stderr: format!(
                    "MemoryError: the program was stopped after exceeding the {} MB memory limit",
                    self.memory_limit_mb
                ),
                ..output
            }),
            ContainerExit::Runtime => Err(PyrunError::Infrastructure(
                output.stderr.trim().to_string(),
            )),
        }
    }
}

/// Separate docker's own failures from the program's.
///
/// `docker run` exits 125 when the daemon fails, 126/127 when the command
/// cannot be started; in those cases it prints a `docker:` diagnostic.
fn classify_exit(exit_code: Option<i32>, stderr: &str) -> ContainerExit {
    let from_docker = stderr.contains("docker:")
        || stderr.contains("Error response from daemon")
        || stderr.contains("Cannot connect to the Docker daemon");

    match exit_code {
        Some(125..=127) if from_docker => ContainerExit::Runtime,
        Some(EXIT_KILLED) if stderr.trim().is_empty() => ContainerExit::OutOfMemory,
        _ => ContainerExit::Completed,
    }
}

#[async_trait]
impl IsolatedExecutor for DockerExecutor {
    fn name(&self) -> &str {
        "docker"
    }

    fn script_name(&self) -> &str {
        &self.script_name
    }

    fn capabilities(&self) -> IsolationCapabilities {
        IsolationCapabilities {
            isolated_fs: true,
            network_disabled: true,
            resource_capped: true,
            unprivileged: true,
            separate_streams: true,
        }
    }

    fn is_available(&self) -> bool {
        self.image.is_some()
    }

    async fn run(&self, code: &str, timeout: Duration) -> Result<RunOutput> {
        let image = match &self.image {
            Some(image) => image.clone(),
            None => {
                return Err(PyrunError::ExecutorUnavailable {
                    executor: "docker".to_string(),
                    reason: self
                        .unavailable_reason
                        .clone()
                        .unwrap_or_else(|| "no image".to_string()),
                })
            }
        };

        let mut handle =
            SandboxHandle::create(self.scratch_root.as_deref(), &self.script_name, code, timeout)
                .await?;

        let outcome = self.run_container(&image, &mut handle).await;

        handle.release().await;
        outcome
    }

    fn metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                "image".to_string(),
                self.image.clone().unwrap_or_else(|| "-".to_string()),
            ),
            ("memory_limit_mb".to_string(), self.memory_limit_mb.to_string()),
            ("cpus".to_string(), self.cpus.to_string()),
            ("user".to_string(), self.user.clone()),
            ("networking".to_string(), "false".to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn available(image: &str) -> ExecutorAvailability {
        ExecutorAvailability::container(image)
    }

    #[test]
    fn test_resource_envelope_always_present() {
        let executor = DockerExecutor::new(
            &DockerConfig::default(),
            &available("pyrun-sandbox:latest"),
            None,
            1024,
        );
        let args = executor.container_args("pyrun-sandbox:latest", "pyrun-x", Path::new("/tmp/pyrun-abc"));

        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--memory=128m".to_string()));
        assert!(args.contains(&"--cpus=0.5".to_string()));
        assert!(args.contains(&"--user=1000:1000".to_string()));
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"/tmp/pyrun-abc:/app:ro".to_string()));

        let tail: Vec<_> = args.iter().rev().take(3).rev().cloned().collect();
        assert_eq!(tail, vec!["pyrun-sandbox:latest", "python", "main.py"]);
    }

    #[test]
    fn test_custom_limits_are_passed() {
        let config = DockerConfig {
            memory_limit_mb: 64,
            cpus: 0.25,
            user: "65534:65534".to_string(),
            ..DockerConfig::default()
        };
        let executor = DockerExecutor::new(&config, &available("img"), None, 1024);
        let args = executor.container_args("img", "n", Path::new("/d"));

        assert!(args.contains(&"--memory=64m".to_string()));
        assert!(args.contains(&"--memory-swap=64m".to_string()));
        assert!(args.contains(&"--cpus=0.25".to_string()));
        assert!(args.contains(&"--user=65534:65534".to_string()));
    }

    #[test]
    fn test_exit_classification() {
        assert_eq!(classify_exit(Some(0), ""), ContainerExit::Completed);
        assert_eq!(
            classify_exit(Some(1), "Traceback...\nZeroDivisionError: division by zero"),
            ContainerExit::Completed
        );
        assert_eq!(
            classify_exit(
                Some(125),
                "docker: Error response from daemon: pull access denied."
            ),
            ContainerExit::Runtime
        );
        // A program may exit 125 on its own
        assert_eq!(classify_exit(Some(125), ""), ContainerExit::Completed);
        assert_eq!(classify_exit(Some(137), ""), ContainerExit::OutOfMemory);
        assert_eq!(
            classify_exit(Some(137), "Killed by user code"),
            ContainerExit::Completed
        );
    }

    #[tokio::test]
    async fn test_unavailable_executor_refuses_to_run() {
        let executor = DockerExecutor::new(
            &DockerConfig::default(),
            &ExecutorAvailability::unavailable("docker daemon not reachable"),
            None,
            1024,
        );

        assert!(!executor.is_available());
        let err = executor
            .run("print(1)", Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            PyrunError::ExecutorUnavailable { executor, reason } => {
                assert_eq!(executor, "docker");
                assert!(reason.contains("not reachable"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_runtime_is_infrastructure_error() {
        let root = tempfile::tempdir().unwrap();
        let config = DockerConfig {
            docker_bin: "/nonexistent/docker-xyz".to_string(),
            ..DockerConfig::default()
        };
        let executor = DockerExecutor::new(
            &config,
            &available("img"),
            Some(root.path().to_path_buf()),
            1024,
        );

        let err = executor
            .run("print(1)", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, PyrunError::Infrastructure(_)));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    /// Stand-in for the docker CLI: logs each call, and `run` does `behaviour`.
    #[cfg(unix)]
    fn fake_docker(dir: &Path, behaviour: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("docker");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$*\" >> '{}'\nif [ \"$1\" = run ]; then\n{}\nfi\nexit 0\n",
                dir.join("calls.log").display(),
                behaviour
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    fn logged_calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[cfg(unix)]
    fn fake_executor(docker_bin: &Path, scratch: &Path) -> DockerExecutor {
        let config = DockerConfig {
            docker_bin: docker_bin.display().to_string(),
            ..DockerConfig::default()
        };
        DockerExecutor::new(&config, &available("img"), Some(scratch.to_path_buf()), 1024)
    }

    /// Name given to `docker run --name`, and whether `docker rm -f` got it.
    #[cfg(unix)]
    fn started_and_removed(calls: &[String]) -> (String, bool) {
        let run = calls
            .iter()
            .find(|call| call.starts_with("run "))
            .expect("docker run was not called");
        let mut words = run.split_whitespace();
        words.find(|word| *word == "--name");
        let name = words.next().unwrap().to_string();
        let removed = calls.contains(&format!("rm -f {}", name));
        (name, removed)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_removes_container() {
        let bin = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let docker = fake_docker(bin.path(), "exec sleep 30");
        let executor = fake_executor(&docker, scratch.path());

        let started = std::time::Instant::now();
        let output = executor
            .run("while True: pass", Duration::from_secs(1))
            .await
            .unwrap();

        assert!(output.timed_out);
        assert!(output.stdout.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));

        let (name, removed) = started_and_removed(&logged_calls(bin.path()));
        assert!(name.starts_with("pyrun-"));
        assert!(removed, "container {name} was not force-removed");
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_daemon_failure_is_infrastructure_error() {
        let bin = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let docker = fake_docker(
            bin.path(),
            "echo 'docker: Error response from daemon: No such image: img.' >&2\nexit 125",
        );
        let executor = fake_executor(&docker, scratch.path());

        let err = executor
            .run("print(1)", Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            PyrunError::Infrastructure(message) => assert!(message.contains("No such image")),
            other => panic!("unexpected error: {other:?}"),
        }

        let (_, removed) = started_and_removed(&logged_calls(bin.path()));
        assert!(removed);
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_memory_kill_reported_as_program_error() {
        let bin = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let docker = fake_docker(bin.path(), "exit 137");
        let executor = fake_executor(&docker, scratch.path());

        let output = executor
            .run("x = 'a' * 10**10", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!output.timed_out);
        assert_eq!(output.exit_code, Some(137));
        assert!(output.stderr.starts_with("MemoryError"));
        assert!(output.stderr.contains("128 MB"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_completed_run_passes_output_through() {
        let bin = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let docker = fake_docker(bin.path(), "echo hi\necho oops >&2\nexit 1");
        let executor = fake_executor(&docker, scratch.path());

        let output = executor
            .run("print('hi')", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(output.stdout, "hi\n");
        assert_eq!(output.stderr, "oops\n");
        assert_eq!(output.exit_code, Some(1));

        let (_, removed) = started_and_removed(&logged_calls(bin.path()));
        assert!(removed);
    }
}
