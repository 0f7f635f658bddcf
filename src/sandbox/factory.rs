use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::types::{BackendType, SandboxConfig};
use crate::error::{PyrunError, Result};
use crate::sandbox::backends::{DockerExecutor, ProcessExecutor};
use crate::sandbox::provisioner::{ImageProvisioner, ProvisionOutcome};
use crate::sandbox::traits::IsolatedExecutor;

/// Result of the one-time start-up probe for container isolation.
///
/// Produced once, then owned by the coordinator and only ever read.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorAvailability {
    pub container_available: bool,
    /// Image containers are created from
    pub image: Option<String>,
    /// Why containers are unavailable
    pub reason: Option<String>,
    pub probed_at: DateTime<Utc>,
}

impl ExecutorAvailability {
    pub fn container(image: &str) -> Self {
        Self {
            container_available: true,
            image: Some(image.to_string()),
            reason: None,
            probed_at: Utc::now(),
        }
    }

    pub fn unavailable(reason: &str) -> Self {
        Self {
            container_available: false,
            image: None,
            reason: Some(reason.to_string()),
            probed_at: Utc::now(),
        }
    }
}

/// Probe container isolation once, provisioning the image if needed.
///
/// Never fails; a broken runtime yields an unavailable result.
pub async fn probe_availability(config: &SandboxConfig) -> ExecutorAvailability {
    if config.backend == BackendType::Process {
        return ExecutorAvailability::unavailable("container isolation disabled by configuration");
    }

    let outcome = ImageProvisioner::new(&config.docker).ensure_ready().await;
    match outcome.image() {
        Some(image) => {
            info!(image = %image, ?outcome, "Container isolation available");
            ExecutorAvailability::container(image)
        }
        None => {
            let reason = match &outcome {
                ProvisionOutcome::Unavailable(reason) => reason.clone(),
                _ => "container runtime unavailable".to_string(),
            };
            warn!(reason = %reason, "Container isolation unavailable");
            ExecutorAvailability::unavailable(&reason)
        }
    }
}

/// The executors a coordinator may choose between.
#[derive(Clone, Default)]
pub struct Executors {
    pub container: Option<Arc<dyn IsolatedExecutor>>,
    pub process: Option<Arc<dyn IsolatedExecutor>>,
    /// Interpreter version reported by the process executor
    pub interpreter_version: Option<String>,
}

/// Create the executors allowed by the configured backend type.
///
/// - `docker`: only the container executor, which reports itself unavailable
///   when the probe failed instead of silently running less isolated.
/// - `process`: only the bare-process executor.
/// - `auto`: the container executor when the probe succeeded, plus the
///   process executor as the fallback.
pub async fn create_executors(
    config: &SandboxConfig,
    availability: &ExecutorAvailability,
) -> Result<Executors> {
    let docker = || -> Arc<dyn IsolatedExecutor> {
        Arc::new(DockerExecutor::new(
            &config.docker,
            availability,
            config.scratch_dir.clone(),
            config.max_output_bytes,
        ))
    };

    let mut executors = Executors::default();

    match config.backend {
        BackendType::Docker => {
            executors.container = Some(docker());
        }
        BackendType::Process => {
            let process = ProcessExecutor::new(
                &config.process,
                config.scratch_dir.clone(),
                config.max_output_bytes,
            )?;
            executors.interpreter_version = process.interpreter_version().await;
            executors.process = Some(Arc::new(process));
        }
        BackendType::Auto => {
            if availability.container_available {
                executors.container = Some(docker());
            }
            match ProcessExecutor::new(
                &config.process,
                config.scratch_dir.clone(),
                config.max_output_bytes,
            ) {
                Ok(process) => {
                    executors.interpreter_version = process.interpreter_version().await;
                    executors.process = Some(Arc::new(process));
                }
                Err(e) if executors.container.is_some() => {
                    warn!(error = %e, "Process executor unavailable, relying on containers only");
                }
                Err(e) => {
                    return Err(PyrunError::ExecutorUnavailable {
                        executor: "auto".to_string(),
                        reason: format!("no sandbox backends available: {}", e),
                    });
                }
            }
        }
    }

    Ok(executors)
}

/// Information about a sandbox backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub name: &'static str,
    pub available: bool,
    pub description: &'static str,
    pub unavailable_reason: Option<String>,
}

/// Describe both backends on this system.
pub fn available_backends(executors: &Executors, availability: &ExecutorAvailability) -> Vec<BackendInfo> {
    vec![
        BackendInfo {
            name: "docker",
            available: executors
                .container
                .as_ref()
                .is_some_and(|executor| executor.is_available()),
            description: "Single-use container (memory/CPU capped, no network, non-root)",
            unavailable_reason: availability.reason.clone(),
        },
        BackendInfo {
            name: "process",
            available: executors.process.is_some(),
            description: "Bare child process on the host (cleared environment only)",
            unavailable_reason: if executors.process.is_some() {
                None
            } else {
                Some("disabled by configuration or interpreter not found".to_string())
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ProcessConfig;

    fn sh_config(backend: BackendType) -> SandboxConfig {
        SandboxConfig {
            backend,
            process: ProcessConfig {
                interpreter: "sh".to_string(),
                interpreter_args: vec![],
                script_name: "main.sh".to_string(),
            },
            ..SandboxConfig::default()
        }
    }

    #[tokio::test]
    async fn test_process_backend_skips_probe() {
        let availability = probe_availability(&sh_config(BackendType::Process)).await;
        assert!(!availability.container_available);
        assert!(availability.reason.unwrap().contains("disabled"));
    }

    #[tokio::test]
    async fn test_auto_without_docker_falls_back_to_process() {
        let mut config = sh_config(BackendType::Auto);
        config.docker.docker_bin = "/nonexistent/docker-xyz".to_string();

        let availability = probe_availability(&config).await;
        assert!(!availability.container_available);

        let executors = create_executors(&config, &availability).await.unwrap();
        assert!(executors.container.is_none());
        assert_eq!(executors.process.as_ref().unwrap().name(), "process");

        let backends = available_backends(&executors, &availability);
        assert!(!backends[0].available);
        assert!(backends[1].available);
    }

    #[tokio::test]
    async fn test_forced_docker_reports_unavailable() {
        let config = sh_config(BackendType::Docker);
        let availability = ExecutorAvailability::unavailable("Docker daemon is not accessible");

        let executors = create_executors(&config, &availability).await.unwrap();
        assert!(executors.process.is_none());
        assert!(!executors.container.unwrap().is_available());
    }

    #[tokio::test]
    async fn test_auto_with_nothing_available_fails() {
        let mut config = sh_config(BackendType::Auto);
        config.process.interpreter = "definitely-not-an-interpreter-xyz".to_string();
        let availability = ExecutorAvailability::unavailable("no docker");

        let err = create_executors(&config, &availability).await.err().unwrap();
        assert!(matches!(err, PyrunError::ExecutorUnavailable { .. }));
    }
}
