//! Error types for the runner.
//!
//! Client-input failures (`RunError::Validation`) and program failures
//! (`Outcome::RuntimeError` and friends in `sandbox`) are kept apart on purpose:
//! only the former is an error, the latter is a normal result.

use thiserror::Error;

/// Failures reported by a container engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("container {0} not found")]
    NotFound(String),
    #[error("engine: {0}")]
    Other(String),
}

/// Failures of a single sandboxed execution that are not the program's fault.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("staging workspace: {0}")]
    Staging(#[from] std::io::Error),
    #[error("container engine: {0}")]
    Infrastructure(#[from] EngineError),
    #[error("execution cancelled")]
    Cancelled,
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Request-level failures surfaced over HTTP.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    #[error("{0}")]
    Validation(String),
    #[error("Request body is too large.")]
    PayloadTooLarge,
    #[error("Server is busy, please try again later.")]
    Backpressure,
    #[error("Server error: the execution environment is unavailable.")]
    Infrastructure,
}
