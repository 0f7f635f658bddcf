mod docker;
mod process;

pub use docker::DockerExecutor;
pub use process::ProcessExecutor;
