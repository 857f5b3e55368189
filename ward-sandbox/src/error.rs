//! Crate-level errors
//!
//! Only programmer-contract violations surface as `Err`; every failure of
//! the executed program itself is reported inside an `ExecutionResult`.

use crate::config::ConfigError;
use crate::execution::ExecutionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("invalid sandbox configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    #[error("the process-wide sandbox manager has been shut down")]
    ShutDown,

    #[error("a sandbox manager is already installed")]
    AlreadyInstalled,

    /// The context's id belongs to an execution that is still active
    #[error("execution {0} is already active")]
    DuplicateExecution(ExecutionId),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
