//! Error taxonomy for the dispatch pipeline.
//!
//! Build-stage failures abort the whole request; host-stage failures stay
//! local to their host and feed the resumable failure set. `Aborted` marks
//! errors whose text already reached the log channel, so callers can
//! propagate them without logging twice.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("{0}")]
    Validation(String),

    #[error("ambiguous configuration: {0}")]
    AmbiguousConfig(String),

    #[error("command failed on {host} with exit code {code}: {command}")]
    RemoteExecution {
        host: String,
        command: String,
        code: i32,
    },

    #[error("file transfer to {host} failed: {reason}")]
    Transfer { host: String, reason: String },

    /// Refused to replace an already-published image version.
    #[error("image {image} already published")]
    Overwrite { image: String },

    #[error("template rendering failed: {0}")]
    Template(String),

    /// Already written to the log channel; carries the logged text.
    #[error("{0}")]
    Aborted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl DeployError {
    /// Whether the error text already reached the log channel.
    pub fn is_reported(&self) -> bool {
        matches!(self, DeployError::Aborted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_aborted_counts_as_reported() {
        assert!(DeployError::Aborted("no such host".into()).is_reported());
        assert!(!DeployError::Validation("bad input".into()).is_reported());
        assert!(!DeployError::RemoteExecution {
            host: "web-1".into(),
            command: "true".into(),
            code: 1,
        }
        .is_reported());
    }
}
