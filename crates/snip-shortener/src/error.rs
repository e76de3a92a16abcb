use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The pool is not accepting jobs: not started yet, or shutting down.
    #[error("deletion pool is not running")]
    NotRunning,
    #[error("deletion pool was already started")]
    AlreadyStarted,
}
