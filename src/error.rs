use thiserror::Error;

/// Error type used throughout the processing model and the scheduler.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or inconsistent configuration, fatal at build time
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No entity is registered under the given path
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// No entity is registered under the given external id
    #[error("Unknown entity id: {0}")]
    UnknownId(i32),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Check error: {0}")]
    Check(String),

    /// Activity invocation rejected or could not be forwarded
    #[error("Activity error: {0}")]
    Activity(String),

    /// Scheduling request rejected; the schedule is left untouched
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Value type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// The admission queue has no room for another batch
    #[error("Admission queue full")]
    QueueFull,

    /// The processing model or the scheduler service has been stopped
    #[error("Service shut down")]
    Shutdown,
}

/// Convenient alias over [`Result`] using [`ProcessingError`]
pub type Result<T> = std::result::Result<T, ProcessingError>;
