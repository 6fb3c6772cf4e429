use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the sandbox lifecycle core.
///
/// Runtime failures are classified once, where the daemon call is made.
/// Only `NotFound`, `UnhealthyNode` and `Conflict` are ever absorbed
/// locally; everything else propagates to the caller.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("node hosting {0} is unreachable")]
    UnhealthyNode(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Policy(String),

    #[error("docker daemon returned {status}: {message}")]
    Runtime { status: u16, message: String },

    #[error("docker daemon unavailable: {0}")]
    Transport(String),

    #[error("{subject} was not ready after {timeout:?}")]
    Timeout { subject: String, timeout: Duration },

    #[error("{subject} failed to start: {reason}")]
    StartFailed { subject: String, reason: String },

    #[error("unexpected runtime state: {0}")]
    Unexpected(String),

    #[error(transparent)]
    Hub(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SpawnError>;

/// Coarse failure classes a UI can map to distinct messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The request or the deployment configuration is wrong; retrying won't help.
    InvalidRequest,
    /// The runtime could not be reached or did not answer in time.
    Unavailable,
    /// The runtime refused for lack of memory, CPU or placement capacity.
    ResourceExhausted,
}

const RESOURCE_MARKERS: &[&str] = &[
    "insufficient resources",
    "no suitable node",
    "out of memory",
    "oomkilled",
    "cannot allocate memory",
    "minimum memory limit",
    "nanocpus",
    "range of cpus",
];

fn mentions_resources(text: &str) -> bool {
    let text = text.to_lowercase();
    RESOURCE_MARKERS.iter().any(|marker| text.contains(marker))
}

impl SpawnError {
    /// True for errors that mean "the object is not there": a lookup
    /// failing this way is treated as `NoObject`, never as a failure.
    pub fn is_absent(&self) -> bool {
        matches!(self, SpawnError::NotFound(_) | SpawnError::UnhealthyNode(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SpawnError::Conflict(_))
    }

    pub fn class(&self) -> FailureClass {
        match self {
            SpawnError::Runtime { message, .. } if mentions_resources(message) => {
                FailureClass::ResourceExhausted
            }
            SpawnError::StartFailed { reason, .. } if mentions_resources(reason) => {
                FailureClass::ResourceExhausted
            }
            SpawnError::Runtime { status, .. } if *status >= 500 => FailureClass::Unavailable,
            SpawnError::Runtime { .. } => FailureClass::InvalidRequest,
            SpawnError::Transport(_)
            | SpawnError::Timeout { .. }
            | SpawnError::UnhealthyNode(_)
            | SpawnError::Unexpected(_)
            | SpawnError::Hub(_) => FailureClass::Unavailable,
            SpawnError::NotFound(_)
            | SpawnError::Conflict(_)
            | SpawnError::Config(_)
            | SpawnError::Policy(_)
            | SpawnError::StartFailed { .. } => FailureClass::InvalidRequest,
        }
    }

    /// Human-readable explanation suitable for end users.
    pub fn user_message(&self) -> String {
        match self.class() {
            FailureClass::InvalidRequest => {
                format!("The sandbox could not be started; check the requested image and settings. ({self})")
            }
            FailureClass::Unavailable => {
                format!("The container runtime is currently unavailable; please try again later. ({self})")
            }
            FailureClass::ResourceExhausted => {
                format!("Not enough resources are available to start the sandbox. ({self})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_errors() {
        assert!(SpawnError::NotFound("container x".into()).is_absent());
        assert!(SpawnError::UnhealthyNode("container x".into()).is_absent());
        assert!(!SpawnError::Conflict("x".into()).is_absent());
        assert!(!SpawnError::Transport("socket".into()).is_absent());
    }

    #[test]
    fn classifies_for_users() {
        assert_eq!(
            SpawnError::Policy("image not allowed".into()).class(),
            FailureClass::InvalidRequest
        );
        assert_eq!(
            SpawnError::Transport("connection refused".into()).class(),
            FailureClass::Unavailable
        );
        assert_eq!(
            SpawnError::Runtime {
                status: 500,
                message: "Minimum memory limit allowed is 6MB".into()
            }
            .class(),
            FailureClass::ResourceExhausted
        );
        assert_eq!(
            SpawnError::StartFailed {
                subject: "service jupyter-bob".into(),
                reason: "no suitable node (insufficient resources on 3 nodes)".into()
            }
            .class(),
            FailureClass::ResourceExhausted
        );
        assert_eq!(
            SpawnError::Runtime {
                status: 400,
                message: "invalid reference format".into()
            }
            .class(),
            FailureClass::InvalidRequest
        );
    }
}
