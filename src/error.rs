use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Validation and resolution errors are raised before the function body is
/// invoked, so they never leave partial side effects behind. Execution errors
/// carry the body's own error unmodified and suppress record storage.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("missing required input file: {0}")]
    MissingRequiredInput(String),

    #[error("missing required output file: {0}")]
    MissingRequiredOutput(String),

    #[error("missing required parameter: {0}")]
    MissingRequiredParameter(String),

    #[error("unable to resolve input file {name}: {reference}")]
    UnresolvableInputFile { name: String, reference: String },

    #[error("output file {name} cannot be a content reference")]
    InvalidOutputTarget { name: String },

    #[error("function not registered: {name} (version {version})")]
    FunctionNotRegistered { name: String, version: String },

    #[error("function {name} has no source unit and cannot run in a container")]
    SourceUnavailable { name: String },

    #[error("non-zero exit code ({code}) from container engine")]
    ContainerExecutionFailed { code: i32 },

    #[error("sandbox preparation failed: {0:#}")]
    Sandbox(anyhow::Error),

    #[error("configuration unavailable: {0}")]
    ConfigUnavailable(String),

    #[error("failed to fetch {url} after {attempts} attempts")]
    RemoteFetchFailed { url: String, attempts: usize },

    #[error("invalid config file {path}: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    #[error("function execution failed: {0:#}")]
    Execution(anyhow::Error),

    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

impl EngineError {
    /// True for contract-validation failures that are guaranteed to occur
    /// before any execution side effects.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::MissingRequiredInput(_)
                | EngineError::MissingRequiredOutput(_)
                | EngineError::MissingRequiredParameter(_)
                | EngineError::InvalidOutputTarget { .. }
        )
    }
}
