/// Error types for the Stepwise workflow engine.
use thiserror::Error;

/// Errors raised while talking to the sequence/feedback backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors raised while loading, validating or editing a workflow template.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Step not found: {stage_id}/{step_id}")]
    StepNotFound { stage_id: String, step_id: String },

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Invalid template: {0}")]
    Invalid(String),

    #[error("Unsupported template format: {0}")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlDecode(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlEncode(#[from] toml::ser::Error),
}

/// Result type for template operations.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Errors raised by effects and by the runner that drives them.
///
/// Effect errors never escape the dispatcher; they are converted into a
/// `Fail` event carrying `to_string()` of the error.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("No current {0} in execution context")]
    MissingContext(&'static str),

    #[error("Action index {index} out of range for {len} actions")]
    ActionOutOfRange { index: usize, len: usize },

    #[error("Action execution failed: {0}")]
    ActionFailed(String),

    #[error("Effect task failed: {0}")]
    EffectPanicked(String),

    #[error("No effect is defined for state {0}")]
    NoEffect(String),

    #[error("Workflow runner has shut down")]
    RunnerClosed,
}

/// Result type for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadFailed(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
