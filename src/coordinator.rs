//! Single entry point for running submitted code.
//!
//! The coordinator validates the request, picks an executor from the
//! start-up availability probe, runs the code under a concurrency bound and
//! folds every outcome into an [`ExecutionResult`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::classifier::{classify_script, ClassifiedError};
use crate::config::types::SandboxConfig;
use crate::error::{PyrunError, Result};
use crate::sandbox::{
    available_backends, create_executors, probe_availability, BackendInfo, ExecutorAvailability,
    Executors, IsolatedExecutor, IsolationCapabilities, RunOutput,
};

/// Shown instead of an empty string when code ran and printed nothing.
pub const NO_OUTPUT_SENTINEL: &str = "Code executed successfully (no output)";

const INFRASTRUCTURE_MESSAGE: &str =
    "The execution environment failed before your code could finish. Please try again.";
const UNAVAILABLE_MESSAGE: &str = "No execution environment is available right now.";
const INTERNAL_MESSAGE: &str = "Internal error: your code could not be executed.";

/// Code to run plus an optional deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            timeout_seconds: None,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}

/// Error attached to a result: either classified program output, or a
/// fixed message for failures that are not the program's fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum ExecutionError {
    Classified(ClassifiedError),
    Raw(String),
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Classified(err) => err.fmt(f),
            Self::Raw(message) => f.write_str(message),
        }
    }
}

/// Normalized outcome of one execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Program output, trimmed
    pub stdout: String,
    pub error: Option<ExecutionError>,
    /// The program exited with status 0
    pub exited_cleanly: bool,
    pub timed_out: bool,
    /// Output was cut at the capture limit
    pub truncated: bool,
    /// Executor that ran the code, if any
    pub executor: Option<String>,
    /// The failure came from the sandbox, not the code; resubmitting may work
    pub retryable: bool,
    pub duration_ms: u64,
}

impl ExecutionResult {
    fn failure(executor: Option<&str>, message: &str, retryable: bool, duration_ms: u64) -> Self {
        Self {
            stdout: String::new(),
            error: Some(ExecutionError::Raw(message.to_string())),
            exited_cleanly: false,
            timed_out: false,
            truncated: false,
            executor: executor.map(str::to_string),
            retryable,
            duration_ms,
        }
    }

    fn timeout(executor: &str, seconds: u64, duration_ms: u64) -> Self {
        Self {
            stdout: String::new(),
            error: Some(ExecutionError::Classified(ClassifiedError::timeout(seconds))),
            exited_cleanly: false,
            timed_out: true,
            truncated: false,
            executor: Some(executor.to_string()),
            retryable: false,
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Output as shown to the user: the sentinel replaces empty output of a
    /// successful run, so "ran silently" differs from "did not run".
    pub fn display_output(&self) -> &str {
        if self.stdout.is_empty() && self.is_success() {
            NO_OUTPUT_SENTINEL
        } else {
            &self.stdout
        }
    }

    pub fn classified_error(&self) -> Option<&ClassifiedError> {
        match &self.error {
            Some(ExecutionError::Classified(err)) => Some(err),
            _ => None,
        }
    }
}

/// Snapshot answered by [`Coordinator::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    /// Executor new requests are sent to
    pub active_executor: Option<String>,
    pub container_available: bool,
    pub image: Option<String>,
    pub reason: Option<String>,
    pub probed_at: DateTime<Utc>,
    pub interpreter_version: Option<String>,
    pub capabilities: Option<IsolationCapabilities>,
    /// Backend-specific details of the active executor
    pub details: HashMap<String, String>,
    pub max_concurrent: usize,
    pub in_flight: usize,
}

/// Selects an executor per request and normalizes its outcome.
pub struct Coordinator {
    executors: Executors,
    availability: ExecutorAvailability,
    default_timeout_seconds: u64,
    max_timeout_seconds: u64,
    max_concurrent: usize,
    permits: Arc<Semaphore>,
}

impl Coordinator {
    pub fn new(
        config: &SandboxConfig,
        availability: ExecutorAvailability,
        executors: Executors,
    ) -> Self {
        Self {
            executors,
            availability,
            default_timeout_seconds: config.default_timeout_seconds,
            max_timeout_seconds: config.max_timeout_seconds,
            max_concurrent: config.max_concurrent,
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
        }
    }

    /// Probe availability once and build the executors it allows.
    pub async fn from_config(config: &SandboxConfig) -> Result<Self> {
        config.validate()?;
        let availability = probe_availability(config).await;
        let executors = create_executors(config, &availability).await?;
        let coordinator = Self::new(config, availability, executors);

        info!(
            executor = ?coordinator.select().map(|e| e.name().to_string()),
            container_available = coordinator.availability.container_available,
            "Coordinator ready"
        );

        Ok(coordinator)
    }

    pub fn availability(&self) -> &ExecutorAvailability {
        &self.availability
    }

    pub fn backends(&self) -> Vec<BackendInfo> {
        available_backends(&self.executors, &self.availability)
    }

    /// Container isolation when the probe found it, else a bare process.
    fn select(&self) -> Option<&Arc<dyn IsolatedExecutor>> {
        match (&self.executors.container, &self.executors.process) {
            (Some(container), _) if self.availability.container_available => Some(container),
            (_, Some(process)) => Some(process),
            // Container-only configuration; it reports its own unavailability
            (Some(container), None) => Some(container),
            (None, None) => None,
        }
    }

    fn resolve_timeout(&self, requested: Option<u64>) -> Result<u64> {
        let seconds = requested.unwrap_or(self.default_timeout_seconds);
        if seconds == 0 || seconds > self.max_timeout_seconds {
            return Err(PyrunError::InvalidTimeout {
                seconds,
                max: self.max_timeout_seconds,
            });
        }
        Ok(seconds)
    }

    /// Run a request to completion.
    ///
    /// Returns `Err` only for invalid requests; every execution failure is
    /// reported inside the result.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        if request.code.trim().is_empty() {
            return Err(PyrunError::EmptyCode);
        }
        let seconds = self.resolve_timeout(request.timeout_seconds)?;

        let executor = match self.select() {
            Some(executor) => Arc::clone(executor),
            None => {
                error!("No executor configured");
                return Ok(ExecutionResult::failure(None, UNAVAILABLE_MESSAGE, true, 0));
            }
        };
        let name = executor.name().to_string();
        let script_name = executor.script_name().to_string();

        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(error = %e, "Execution semaphore closed");
                return Ok(ExecutionResult::failure(Some(&name), INTERNAL_MESSAGE, false, 0));
            }
        };

        debug!(executor = %name, timeout_secs = seconds, code_len = request.code.len(), "Executing request");

        let started = Instant::now();
        // A separate task keeps a panicking executor from unwinding into the
        // caller and lets cleanup finish even if the caller stops waiting.
        let code = request.code;
        let task = tokio::spawn(async move {
            executor.run(&code, Duration::from_secs(seconds)).await
        });
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(PyrunError::Internal(format!("executor task failed: {}", e))),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        Ok(normalize(&name, &script_name, seconds, outcome, duration_ms))
    }

    pub fn status(&self) -> ExecutorStatus {
        let active = self.select();
        ExecutorStatus {
            active_executor: active.map(|e| e.name().to_string()),
            container_available: self.availability.container_available,
            image: self.availability.image.clone(),
            reason: self.availability.reason.clone(),
            probed_at: self.availability.probed_at,
            interpreter_version: self.executors.interpreter_version.clone(),
            capabilities: active.map(|e| e.capabilities()),
            details: active.map(|e| e.metadata()).unwrap_or_default(),
            max_concurrent: self.max_concurrent,
            in_flight: self.max_concurrent - self.permits.available_permits(),
        }
    }
}

/// Fold an executor outcome into a result.
fn normalize(
    executor: &str,
    script_name: &str,
    seconds: u64,
    outcome: Result<RunOutput>,
    duration_ms: u64,
) -> ExecutionResult {
    let output = match outcome {
        Ok(output) => output,
        Err(e) => {
            let message = match &e {
                PyrunError::Infrastructure(_) => {
                    warn!(executor = %executor, error = %e, "Sandbox infrastructure failure");
                    INFRASTRUCTURE_MESSAGE
                }
                PyrunError::ExecutorUnavailable { .. } => {
                    warn!(executor = %executor, error = %e, "Executor unavailable");
                    UNAVAILABLE_MESSAGE
                }
                _ => {
                    error!(executor = %executor, error = %e, "Execution failed");
                    INTERNAL_MESSAGE
                }
            };
            return ExecutionResult::failure(Some(executor), message, e.is_retryable(), duration_ms);
        }
    };

    if output.timed_out {
        return ExecutionResult::timeout(executor, seconds, duration_ms);
    }

    let stderr = output.stderr.trim();
    let classify = |text: &str| classify_script(text, script_name);
    let error = if !stderr.is_empty() {
        Some(ExecutionError::Classified(classify(stderr)))
    } else {
        match output.exit_code {
            Some(0) => None,
            Some(code) => Some(ExecutionError::Classified(classify(&format!(
                "Program exited with status {}",
                code
            )))),
            None => Some(ExecutionError::Classified(classify(
                "Program was terminated by a signal",
            ))),
        }
    };

    ExecutionResult {
        stdout: output.stdout.trim().to_string(),
        error,
        exited_cleanly: output.exit_code == Some(0),
        timed_out: false,
        truncated: output.truncated,
        executor: Some(executor.to_string()),
        retryable: false,
        duration_ms,
    }
}
