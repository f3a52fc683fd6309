/// Errors reported by reactive handles, the scheduler and the event loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Write through a readonly handle.
    #[error("set operation on key \"{key}\" failed: target is readonly")]
    ReadonlyTarget {
        /// The rejected key.
        key: String,
    },
    /// List write past the end of the list.
    #[error("index {index} is out of bounds for a list of length {len}")]
    IndexOutOfBounds {
        /// The rejected index.
        index: usize,
        /// Length of the list at the time of the write.
        len: usize,
    },
    /// Write to a computed value that has no setter.
    #[error("write operation failed: computed value is readonly")]
    ReadonlyComputed,
    /// A job kept re-queueing itself within one flush and was dropped.
    #[error(
        "maximum recursive updates exceeded in {job}: a job is mutating state it depends on, \
         possibly triggering itself recursively (limit {limit})"
    )]
    RecursionLimit {
        /// Description of the offending job.
        job: String,
        /// The configured limit.
        limit: usize,
    },
    /// The event loop thread has exited.
    #[error("event loop is closed")]
    LoopClosed,
    /// Malformed JSON input.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// The event loop thread could not be started.
    #[error("failed to spawn event loop thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
