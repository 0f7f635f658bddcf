use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::classifier::DEFAULT_SCRIPT_NAME;
use crate::error::Result;

/// Fixed stderr content reported for an execution cut off by its deadline.
pub const TIMEOUT_SIGNAL: &str = "execution timed out";

/// Capability flags indicating what isolation an executor provides
#[derive(Debug, Clone, Default, Serialize)]
pub struct IsolationCapabilities {
    /// Program runs in its own filesystem/process namespace
    pub isolated_fs: bool,
    /// Network access is disabled
    pub network_disabled: bool,
    /// Memory and CPU are capped
    pub resource_capped: bool,
    /// Program runs as an unprivileged identity
    pub unprivileged: bool,
    /// stdout and stderr are captured separately
    pub separate_streams: bool,
}

/// Raw outcome of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status, `None` when killed by a signal or timed out
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// At least one stream exceeded the capture limit
    pub truncated: bool,
}

impl RunOutput {
    /// Output discarded in favour of the fixed timeout signal.
    pub fn timed_out() -> Self {
        Self {
            stdout: String::new(),
            stderr: TIMEOUT_SIGNAL.to_string(),
            exit_code: None,
            timed_out: true,
            truncated: false,
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Contract shared by every isolation strategy.
///
/// Each call to [`IsolatedExecutor::run`] is a stateless one-shot: it owns its
/// artifacts for the duration of the call and releases them before returning.
#[async_trait]
pub trait IsolatedExecutor: Send + Sync {
    /// Returns the executor name (e.g., "docker", "process")
    fn name(&self) -> &str;

    /// Returns the isolation this executor provides
    fn capabilities(&self) -> IsolationCapabilities;

    /// File name the submitted code is saved under.
    fn script_name(&self) -> &str {
        DEFAULT_SCRIPT_NAME
    }

    /// Whether this executor can run code at all.
    fn is_available(&self) -> bool {
        true
    }

    /// Run `code` with a hard wall-clock deadline.
    ///
    /// A timeout is reported as [`RunOutput::timed_out`], not as an error.
    async fn run(&self, code: &str, timeout: Duration) -> Result<RunOutput>;

    /// Backend-specific details for status reports.
    fn metadata(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}
