//! CombiError: unified error type for the combination engine public APIs.
//!
//! Workers never propagate these across the signal boundary; they encode
//! failure into the group status and return to `wait()`. The process manager
//! is the single place where errors become run-level decisions.

use thiserror::Error;

use crate::manager::signals::Signal;
use crate::scheme::LevelVector;

/// Unified error type for combination engine operations.
#[derive(Debug, Error)]
pub enum CombiError {
    /// Empty or malformed combination scheme; fatal for the run.
    #[error("invalid combination scheme: {0}")]
    InvalidScheme(String),

    /// Incompatible configuration options detected at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A communicator transfer failed or returned nothing.
    #[error("communication with rank {peer} failed: {reason}")]
    Comm { peer: usize, reason: String },

    /// Received buffer length does not match the expected layout.
    #[error("buffer size mismatch from rank {peer}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        peer: usize,
        expected: usize,
        got: usize,
    },

    /// Malformed record on a wire channel.
    #[error("wire decode error: {0}")]
    Wire(String),

    /// A signal arrived that the worker cannot service in its current state.
    #[error("signal {signal:?} not serviceable: {reason}")]
    SignalOrder { signal: Signal, reason: String },

    /// A task reported failure while running.
    #[error("task {task} failed on level {level:?}")]
    TaskFailure { task: u64, level: LevelVector },

    /// An unknown task kind tag was found on the wire.
    #[error("no task kind registered for tag {tag}")]
    UnknownTaskKind { tag: u16 },

    /// A whole process group became unresponsive past the deadline.
    #[error("process group {group} unresponsive, removed from the run")]
    GroupFailure { group: usize },

    /// The third-level relay connection failed; the combine step falls back
    /// to local+global reduction.
    #[error("third-level relay error: {0}")]
    Relay(String),

    /// The two systems disagree on the third-level subspace layout.
    #[error("third-level layout mismatch: {0}")]
    ThirdLevelLayout(String),

    /// Underlying MPI communicator is in an error state; fatal.
    #[error("MPI failure: {0}")]
    Mpi(String),

    /// Checkpoint or scheme file I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Scheme file or checkpoint header failed to (de)serialize.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CombiError {
    /// Shorthand used by the collectives for a failed receive.
    pub(crate) fn comm(peer: usize, reason: impl Into<String>) -> Self {
        CombiError::Comm {
            peer,
            reason: reason.into(),
        }
    }
}
