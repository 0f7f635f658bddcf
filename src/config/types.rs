use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{PyrunError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PyrunConfig {
    pub sandbox: SandboxConfig,
}

impl PyrunConfig {
    pub fn validate(&self) -> Result<()> {
        self.sandbox.validate()
    }
}

/// The isolation strategy to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Resource-capped, network-isolated Docker container
    Docker,
    /// Bare child process on the host
    Process,
    /// Prefer Docker when it was provisioned at start-up, else a bare process
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Which isolation strategy to use
    pub backend: BackendType,
    /// Timeout applied when a request does not specify one
    pub default_timeout_seconds: u64,
    /// Largest timeout a request may ask for
    pub max_timeout_seconds: u64,
    /// Bytes kept per output stream; the rest is discarded
    pub max_output_bytes: usize,
    /// Executions allowed in flight at once
    pub max_concurrent: usize,
    /// Root directory for temporary artifacts (system temp dir if unset)
    pub scratch_dir: Option<PathBuf>,
    /// Bare-process configuration
    pub process: ProcessConfig,
    /// Docker-specific configuration
    pub docker: DockerConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            default_timeout_seconds: 10,
            max_timeout_seconds: 60,
            max_output_bytes: 64 * 1024,
            max_concurrent: 8,
            scratch_dir: None,
            process: ProcessConfig::default(),
            docker: DockerConfig::default(),
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_seconds == 0 || self.max_timeout_seconds == 0 {
            return Err(PyrunError::Config(
                "timeouts must be at least 1 second".to_string(),
            ));
        }
        if self.default_timeout_seconds > self.max_timeout_seconds {
            return Err(PyrunError::Config(format!(
                "default_timeout_seconds ({}) exceeds max_timeout_seconds ({})",
                self.default_timeout_seconds, self.max_timeout_seconds
            )));
        }
        if self.max_output_bytes == 0 {
            return Err(PyrunError::Config(
                "max_output_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(PyrunError::Config(
                "max_concurrent must be greater than zero".to_string(),
            ));
        }
        self.process.validate()?;
        self.docker.validate()
    }
}

/// Bare-process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Interpreter executable, resolved on PATH
    pub interpreter: String,
    /// Arguments placed before the script name
    pub interpreter_args: Vec<String>,
    /// File name the submitted code is written to
    pub script_name: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            // Isolated mode: ignore PYTHON* env vars and the user site dir
            interpreter_args: vec!["-I".to_string()],
            script_name: "main.py".to_string(),
        }
    }
}

impl ProcessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interpreter.trim().is_empty() {
            return Err(PyrunError::Config(
                "process.interpreter must not be empty".to_string(),
            ));
        }
        validate_script_name(&self.script_name)
    }
}

/// Docker-specific configuration.
///
/// Network access is always disabled for sandbox containers and is therefore
/// not configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Docker CLI binary
    pub docker_bin: String,
    /// Image built from the bundled recipe
    pub image: String,
    /// Public image used when the recipe cannot be built
    pub fallback_image: String,
    /// Build the image at start-up if it doesn't exist (default: true)
    pub build_image: bool,
    /// Explicit Dockerfile path (searched for when unset)
    pub dockerfile: Option<PathBuf>,
    /// Memory ceiling in MB; swap is capped at the same value
    pub memory_limit_mb: u64,
    /// CPU share as a fraction of one core
    pub cpus: f64,
    /// Non-root `uid[:gid]` the program runs as
    pub user: String,
    /// Maximum number of processes inside the container
    pub pids_limit: u32,
    /// Interpreter inside the image
    pub interpreter: String,
    /// File name the submitted code is mounted as
    pub script_name: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            image: "pyrun-sandbox:latest".to_string(),
            fallback_image: "python:3.11-slim".to_string(),
            build_image: true,
            dockerfile: None,
            memory_limit_mb: 128,
            cpus: 0.5,
            user: "1000:1000".to_string(),
            pids_limit: 64,
            interpreter: "python".to_string(),
            script_name: "main.py".to_string(),
        }
    }
}

impl DockerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.memory_limit_mb == 0 {
            return Err(PyrunError::Config(
                "docker.memory_limit_mb must be greater than zero".to_string(),
            ));
        }
        if !(self.cpus > 0.0 && self.cpus <= 1.0) {
            return Err(PyrunError::Config(format!(
                "docker.cpus must be in (0, 1], got {}",
                self.cpus
            )));
        }
        if is_root_identity(&self.user) {
            return Err(PyrunError::Config(format!(
                "docker.user must be an unprivileged identity, got '{}'",
                self.user
            )));
        }
        if self.pids_limit == 0 {
            return Err(PyrunError::Config(
                "docker.pids_limit must be greater than zero".to_string(),
            ));
        }
        if self.interpreter.trim().is_empty() {
            return Err(PyrunError::Config(
                "docker.interpreter must not be empty".to_string(),
            ));
        }
        validate_script_name(&self.script_name)
    }
}

fn validate_script_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return Err(PyrunError::Config(format!(
            "script_name must be a plain file name, got '{}'",
            name
        )));
    }
    Ok(())
}

/// Empty, `root`, uid 0 and `0:<gid>` all resolve to the root user.
fn is_root_identity(user: &str) -> bool {
    let uid = user.split(':').next().unwrap_or("").trim();
    uid.is_empty() || uid == "root" || uid == "0"
}
