pub mod classifier;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod sandbox;

pub use classifier::{classify, classify_script, ClassifiedError, ErrorKind};
pub use coordinator::{Coordinator, ExecutionRequest, ExecutionResult, ExecutorStatus};
pub use error::{PyrunError, Result};
