use thiserror::Error;

/// Errors surfaced across the public API.
///
/// Internal invariant violations are not represented here; those assert and
/// abort with a diagnostic. Task-side aborts propagate only as cancellation
/// and never cross the public API as an error value.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Transient condition, the caller may retry or defer. Used for a full
    /// message queue and for a busy processing mutex.
    #[error("resource temporarily unavailable, retry")]
    Again,

    /// Misuse: nullable argument, wrong state, oversized payload.
    #[error("invalid argument or state: {0}")]
    Inval(&'static str),

    /// Transport or OS failure.
    #[error("transport or OS failure: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TaskError>;

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Other(e.to_string())
    }
}
