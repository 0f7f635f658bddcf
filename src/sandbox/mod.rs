mod backends;
mod child;
mod factory;
mod handle;
mod provisioner;
mod traits;

pub use backends::{DockerExecutor, ProcessExecutor};
pub use child::{read_capped, run_child};
pub use factory::{
    available_backends, create_executors, probe_availability, BackendInfo, ExecutorAvailability,
    Executors,
};
pub use handle::SandboxHandle;
pub use provisioner::{ImageProvisioner, ProvisionOutcome};
pub use traits::{IsolatedExecutor, IsolationCapabilities, RunOutput, TIMEOUT_SIGNAL};
