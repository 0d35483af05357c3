//! Error surface shared by the whole crate.
//!
//! Errors are plain values returned through [`Result`]; nothing in the core
//! aborts on a task failure. The enum is `Clone` because a task's terminal
//! result is delivered to three places (the result slot, the wait handle and
//! the callback) that each get their own copy.

/// Errors produced by the scheduling core and the model registry.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// Malformed request: shape/dtype mismatch, unknown or duplicate id,
    /// illegal dependency.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Allocation failure reported by a backend.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Unknown factory key or registry id.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Opaque backend failure, message passed through verbatim.
    #[error("backend error: {0}")]
    BackendError(String),

    /// The ready queue is at capacity.
    #[error("ready queue full")]
    QueueFull,

    /// A wait or per-task deadline elapsed.
    #[error("timed out")]
    Timeout,

    /// The task was cancelled before the backend was invoked.
    #[error("cancelled")]
    Cancelled,

    /// An upstream dependency failed or was cancelled.
    #[error("dependency failed: {0}")]
    DependencyFailed(String),

    /// Submit or wait against a scheduler that is no longer running.
    #[error("scheduler stopped")]
    SchedulerStopped,

    /// Unload (or reload) of a model that in-flight tasks still reference.
    #[error("resource busy: {0}")]
    BusyResource(String),

    /// Reserved for backends that do not implement an optional capability.
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::InvalidArgument("bad shape".into()).to_string(),
            "invalid argument: bad shape"
        );
        assert_eq!(Error::QueueFull.to_string(), "ready queue full");
        assert_eq!(Error::Timeout.to_string(), "timed out");
    }

    #[test]
    fn test_clone_preserves_kind() {
        let err = Error::DependencyFailed("task 3".into());
        assert!(matches!(err.clone(), Error::DependencyFailed(_)));
    }
}
