//! 💥 Errors: every way an export can go sideways, with a name tag attached.
//!
//! 🎯 Backends speak `anyhow` (duct tape, universally compatible). The engine
//! speaks `ExportError` (labelled boxes, one per failure kind). The conversion
//! happens at the seam, where we still know which segment and which file we
//! were staring at when things caught fire.
//!
//! 🦆 The duck reviewed every variant. It had notes. We ignored them.

use thiserror::Error;

/// 📦 The boxed cause we carry around. `anyhow::Error` converts into this
/// for free, and so does every `std::error::Error + Send + Sync`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 🚨 A table read went wrong. Two flavours: "slow down" and "no".
#[derive(Debug, Error)]
pub enum TableError {
    /// 🐢 The table asked us to back off. Retry the same token after sleeping.
    #[error("throughput exceeded: {message}")]
    Throttled { message: String },

    /// 💀 Anything else. Fatal for the segment.
    #[error(transparent)]
    Other(BoxError),
}

impl TableError {
    pub fn throttled(message: impl Into<String>) -> Self {
        TableError::Throttled {
            message: message.into(),
        }
    }

    pub fn other(err: impl Into<BoxError>) -> Self {
        TableError::Other(err.into())
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, TableError::Throttled { .. })
    }
}

impl From<anyhow::Error> for TableError {
    fn from(err: anyhow::Error) -> Self {
        TableError::Other(err.into())
    }
}

/// 🧮 A record had a value we refuse to squash into one cell.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("column `{column}` holds an unsupported {kind} value")]
pub struct ProjectionError {
    pub column: String,
    pub kind: &'static str,
}

/// 🚨 Everything that can end an export, segment, or worker.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("segment {segment}: table read failed")]
    Read {
        segment: u32,
        #[source]
        source: BoxError,
    },

    #[error("segment {segment}: could not open {location}")]
    SinkOpen {
        segment: u32,
        location: String,
        #[source]
        source: BoxError,
    },

    #[error("segment {segment}: write to {location} failed")]
    SinkWrite {
        segment: u32,
        location: String,
        #[source]
        source: BoxError,
    },

    #[error("segment {segment}: could not finalize {location}")]
    SinkClose {
        segment: u32,
        location: String,
        #[source]
        source: BoxError,
    },

    #[error("segment {segment}: could not project record into {location}")]
    Projection {
        segment: u32,
        location: String,
        #[source]
        source: ProjectionError,
    },

    #[error("could not prepare destination for table `{table}`")]
    Prepare {
        table: String,
        #[source]
        source: BoxError,
    },

    #[error("invalid export job: {0}")]
    InvalidJob(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("segment {segment}: could not spawn worker process")]
    WorkerSpawn {
        segment: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("segment {segment}: worker process failed ({status})")]
    WorkerFailed { segment: u32, status: String },

    #[error("segment {segment}: worker protocol violation: {message}")]
    WorkerProtocol { segment: u32, message: String },

    #[error("segment {segment}: worker task did not finish")]
    TaskFailed {
        segment: u32,
        #[source]
        source: tokio::task::JoinError,
    },
}

impl ExportError {
    /// 🔢 The segment this error belongs to, when it belongs to one.
    pub fn segment(&self) -> Option<u32> {
        match self {
            ExportError::Read { segment, .. }
            | ExportError::SinkOpen { segment, .. }
            | ExportError::SinkWrite { segment, .. }
            | ExportError::SinkClose { segment, .. }
            | ExportError::Projection { segment, .. }
            | ExportError::WorkerSpawn { segment, .. }
            | ExportError::WorkerFailed { segment, .. }
            | ExportError::WorkerProtocol { segment, .. }
            | ExportError::TaskFailed { segment, .. } => Some(*segment),
            ExportError::Prepare { .. }
            | ExportError::InvalidJob(_)
            | ExportError::InvalidConfig(_) => None,
        }
    }

    /// 📜 The whole cause chain on one line, `outer: inner: innermost`.
    /// Events and worker stderr carry this, since they can't carry the error itself.
    pub fn chain_message(&self) -> String {
        let mut message = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            message.push_str(": ");
            message.push_str(&err.to_string());
            cause = err.source();
        }
        message
    }
}
