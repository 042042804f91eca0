use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures that end a run. Parse problems are not here: the instruction
/// parser absorbs them (see [`crate::instruction::ParseFallback`]).
#[derive(Debug, Error, Clone, PartialEq, Serialize)]
pub enum LoopError {
    #[error("capture grant unavailable after {attempts} attempts")]
    GrantUnavailable { attempts: u32 },
    #[error("artifact {path:?} not ready after {waited:?}")]
    ArtifactTimeout { path: PathBuf, waited: Duration },
    #[error("capability not enabled: {0}")]
    CapabilityDisabled(String),
    #[error("target dismissed before confirmation")]
    TargetDismissed,
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("capture error: {0}")]
    Capture(String),
}

impl LoopError {
    /// Short machine-friendly tag for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            LoopError::GrantUnavailable { .. } => "grant_unavailable",
            LoopError::ArtifactTimeout { .. } => "artifact_timeout",
            LoopError::CapabilityDisabled(_) => "capability_disabled",
            LoopError::TargetDismissed => "target_dismissed",
            LoopError::NetworkFailure(_) => "network_failure",
            LoopError::Capture(_) => "capture",
        }
    }
}

impl From<reqwest::Error> for LoopError {
    fn from(e: reqwest::Error) -> Self {
        LoopError::NetworkFailure(e.to_string())
    }
}
