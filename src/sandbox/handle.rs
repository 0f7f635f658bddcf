use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{PyrunError, Result};

/// Upper bound on a single `docker rm -f` during cleanup.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(10);

/// A container owned by a handle, removed when the handle is released.
#[derive(Debug, Clone)]
struct OwnedContainer {
    docker_bin: String,
    name: String,
}

/// One in-flight execution.
///
/// Owns the temporary directory holding the submitted script, the deadline,
/// and (on the container path) the name of the container created for it.
/// [`SandboxHandle::release`] removes both; `Drop` repeats the work for any
/// path that skipped it, including cancellation of the request future.
#[derive(Debug)]
pub struct SandboxHandle {
    dir: Option<TempDir>,
    script_path: PathBuf,
    script_name: String,
    deadline: Instant,
    container: Option<OwnedContainer>,
}

impl SandboxHandle {
    /// Write `code` to a fresh, uniquely named directory and start the clock.
    pub async fn create(
        scratch_root: Option<&Path>,
        script_name: &str,
        code: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("pyrun-");
        let dir = match scratch_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };

        let script_path = dir.path().join(script_name);
        tokio::fs::write(&script_path, code).await?;

        debug!(dir = %dir.path().display(), "Created sandbox artifact");

        Ok(Self {
            dir: Some(dir),
            script_path,
            script_name: script_name.to_string(),
            deadline: Instant::now() + timeout,
            container: None,
        })
    }

    pub fn dir(&self) -> &Path {
        self.script_path.parent().unwrap_or(&self.script_path)
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Make the artifact readable by an unprivileged user inside a container.
    ///
    /// The directory stays unwritable for anyone but its owner.
    pub async fn share_read_only(&self) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            tokio::fs::set_permissions(self.dir(), std::fs::Permissions::from_mode(0o755)).await?;
            tokio::fs::set_permissions(&self.script_path, std::fs::Permissions::from_mode(0o644))
                .await?;
        }
        Ok(())
    }

    /// Take ownership of a container so it is removed on release.
    pub fn attach_container(&mut self, docker_bin: &str, name: &str) {
        self.container = Some(OwnedContainer {
            docker_bin: docker_bin.to_string(),
            name: name.to_string(),
        });
    }

    pub fn container_name(&self) -> Option<&str> {
        self.container.as_ref().map(|c| c.name.as_str())
    }

    /// Remove the container (if any) and the artifact directory.
    ///
    /// Failures are logged and never returned.
    pub async fn release(mut self) {
        if let Some(container) = self.container.take() {
            remove_container(&container.docker_bin, &container.name).await;
        }

        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!(dir = %path.display(), "Removed sandbox artifact"),
                Err(e) => {
                    warn!(dir = %path.display(), error = %e, "Failed to remove sandbox artifact")
                }
            }
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if let Some(container) = self.container.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    warn!(container = %container.name, "Handle dropped before release, scheduling container removal");
                    runtime.spawn(async move {
                        remove_container(&container.docker_bin, &container.name).await;
                    });
                }
                Err(_) => {
                    warn!(container = %container.name, "No runtime available to remove container");
                }
            }
        }
        // TempDir removes itself on drop.
    }
}

/// Force-remove a container, tolerating one that is already gone.
pub async fn remove_container(docker_bin: &str, name: &str) {
    let mut cmd = Command::new(docker_bin);
    cmd.args(["rm", "-f", name]);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let result = tokio::time::timeout(REMOVE_TIMEOUT, cmd.output()).await;
    match result {
        Ok(Ok(output)) if output.status.success() => {
            debug!(container = %name, "Container removed");
        }
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                debug!(container = %name, "Container already removed");
            } else {
                warn!(container = %name, error = %stderr.trim(), "Failed to remove container");
            }
        }
        Ok(Err(e)) => {
            let err = PyrunError::Spawn {
                program: docker_bin.to_string(),
                source: e,
            };
            warn!(container = %name, error = %err, "Failed to remove container");
        }
        Err(_) => warn!(container = %name, "Timed out removing container"),
    }
}
