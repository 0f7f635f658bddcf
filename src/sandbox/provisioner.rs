use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::types::DockerConfig;
use crate::error::{PyrunError, Result};

/// Path to the Dockerfile relative to the crate root
const DOCKERFILE_PATH: &str = "docker/Dockerfile.sandbox";

/// Bound on `docker info` / `docker image inspect`
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on `docker build` / `docker pull`
const BUILD_TIMEOUT: Duration = Duration::from_secs(600);

/// What [`ImageProvisioner::ensure_ready`] ended up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The image was already present
    Existing(String),
    /// The image was built from the bundled recipe
    Built(String),
    /// The recipe could not be built; the public fallback image is used
    Fallback(String),
    /// No container can be run
    Unavailable(String),
}

impl ProvisionOutcome {
    pub fn is_ready(&self) -> bool {
        !matches!(self, Self::Unavailable(_))
    }

    /// Image to run containers from, when ready.
    pub fn image(&self) -> Option<&str> {
        match self {
            Self::Existing(image) | Self::Built(image) | Self::Fallback(image) => Some(image.as_str()),
            Self::Unavailable(_) => None,
        }
    }
}

/// Makes sure a runnable sandbox image exists before the first request.
pub struct ImageProvisioner {
    docker_bin: String,
    image: String,
    fallback_image: String,
    build_image: bool,
    dockerfile: Option<PathBuf>,
}

impl ImageProvisioner {
    pub fn new(config: &DockerConfig) -> Self {
        Self {
            docker_bin: config.docker_bin.clone(),
            image: config.image.clone(),
            fallback_image: config.fallback_image.clone(),
            build_image: config.build_image,
            dockerfile: config.dockerfile.clone(),
        }
    }

    /// Best-effort provisioning. Never fails: every problem is logged and
    /// folded into [`ProvisionOutcome::Unavailable`] or a fallback.
    pub async fn ensure_ready(&self) -> ProvisionOutcome {
        if !self.runtime_reachable().await {
            warn!(docker = %self.docker_bin, "Docker daemon is not accessible, container executor disabled");
            return ProvisionOutcome::Unavailable(
                "Docker daemon is not accessible".to_string(),
            );
        }

        if self.image_exists(&self.image).await {
            info!(image = %self.image, "Docker sandbox image already exists");
            return ProvisionOutcome::Existing(self.image.clone());
        }

        if self.build_image {
            match self.build().await {
                Ok(()) => return ProvisionOutcome::Built(self.image.clone()),
                Err(e) => warn!(error = %e, "Failed to build sandbox image, using fallback image"),
            }
        } else {
            info!(image = %self.image, "Image missing and build disabled, using fallback image");
        }

        if self.image_exists(&self.fallback_image).await {
            return ProvisionOutcome::Fallback(self.fallback_image.clone());
        }

        match self.pull(&self.fallback_image).await {
            Ok(()) => ProvisionOutcome::Fallback(self.fallback_image.clone()),
            Err(e) => {
                warn!(image = %self.fallback_image, error = %e, "Failed to pull fallback image");
                ProvisionOutcome::Unavailable(format!(
                    "no sandbox image available ({} or {})",
                    self.image, self.fallback_image
                ))
            }
        }
    }

    /// Check if the Docker daemon answers.
    pub async fn runtime_reachable(&self) -> bool {
        self.quiet_status(&["info"]).await
    }

    /// Check if a Docker image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.quiet_status(&["image", "inspect", image]).await
    }

    async fn quiet_status(&self, args: &[&str]) -> bool {
        let status = Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(PROBE_TIMEOUT, status).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!(docker = %self.docker_bin, error = %e, "Failed to run docker");
                false
            }
            Err(_) => {
                warn!(docker = %self.docker_bin, ?args, "Docker probe timed out");
                false
            }
        }
    }

    /// Build the sandbox image from the bundled Dockerfile.
    async fn build(&self) -> Result<()> {
        let dockerfile = self.find_dockerfile()?;
        let dockerfile = dockerfile.canonicalize().map_err(|e| {
            PyrunError::Infrastructure(format!("Cannot resolve Dockerfile path: {}", e))
        })?;
        let context = dockerfile.parent().ok_or_else(|| {
            PyrunError::Infrastructure("Cannot determine build context".to_string())
        })?;

        info!(image = %self.image, dockerfile = %dockerfile.display(), "Building Docker sandbox image...");

        let mut cmd = Command::new(&self.docker_bin);
        cmd.arg("build")
            .arg("-t")
            .arg(&self.image)
            .arg("-f")
            .arg(&dockerfile)
            .arg(context);

        self.run_long(cmd, "docker build").await?;
        info!(image = %self.image, "Docker sandbox image built successfully");
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        info!(image = %image, "Pulling fallback image...");
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(["pull", image]);
        self.run_long(cmd, "docker pull").await
    }

    async fn run_long(&self, mut cmd: Command, what: &str) -> Result<()> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(BUILD_TIMEOUT, cmd.output())
            .await
            .map_err(|_| PyrunError::Infrastructure(format!("{} timed out", what)))?
            .map_err(|e| PyrunError::Infrastructure(format!("Failed to run {}: {}", what, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PyrunError::Infrastructure(format!(
                "{} failed: {}",
                what,
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Find the Dockerfile: explicit config, then common locations.
    fn find_dockerfile(&self) -> Result<PathBuf> {
        if let Some(path) = &self.dockerfile {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(PyrunError::Infrastructure(format!(
                "Configured Dockerfile not found: {}",
                path.display()
            )));
        }

        let mut candidates = vec![PathBuf::from(DOCKERFILE_PATH)];

        // Next to the executable and its ancestors (development builds)
        if let Ok(exe_path) = std::env::current_exe() {
            candidates.extend(exe_path.ancestors().skip(1).take(5).map(|dir| dir.join(DOCKERFILE_PATH)));
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            candidates.push(Path::new(&manifest_dir).join(DOCKERFILE_PATH));
        }

        candidates
            .into_iter()
            .find(|candidate| candidate.exists())
            .ok_or_else(|| {
                PyrunError::Infrastructure(format!(
                    "Dockerfile not found at {}. Build the image manually with: docker build -t {} -f {} docker",
                    DOCKERFILE_PATH, self.image, DOCKERFILE_PATH
                ))
            })
    }
}
