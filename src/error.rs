//! Engine-wide error taxonomy.
//!
//! Each module owns a `thiserror`-derived error enum for its own internal
//! failure modes (`ResourceError`, `RegistryError`, `SubscriptionError`,
//! `EventError`, `TemplateError`, `SecurityError`); at a module's public
//! boundary those are mapped onto one of the variants below, matching the
//! categories the spec describes (Validation / Configuration / Resource /
//! Runtime / Cancellation / Fatal).

use thiserror::Error;

/// The top-level error type returned from every public engine entry point.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad inputs, bad paths, bad image names, bad capabilities, bad semver,
    /// bad filter expressions, enum violations. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or unparseable `tako.yml`, unknown workflow name.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Quota violation or lock-contention timeout.
    #[error("resource error: {0}")]
    Resource(String),

    /// Subprocess/container non-zero exit, or other command execution failure.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Context cancelled or its deadline elapsed.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Context deadline exceeded specifically (distinguished from an explicit cancel).
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Corrupted state, unable to create a workspace, or other unrecoverable
    /// condition encountered at construction/load time.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Catch-all for I/O failures that don't otherwise fit a category above.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// True for categories the spec says must never be retried automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Configuration(_) | Self::Fatal(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
