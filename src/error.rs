//! Error taxonomy shared by every component.
//!
//! Components return `anyhow::Result` and attach an [`EdgeError`] when the
//! failure kind matters to the caller. Boundaries recover the kind with
//! [`EdgeError::classify`]; anything untyped is treated as a transient I/O
//! failure so the caller retries instead of dropping work.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EdgeError {
    /// Malformed input. Rejected immediately, never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Network or device failure expected to clear on its own.
    #[error("transient i/o failure: {0}")]
    TransientIo(String),
    /// The referenced resource is gone; retrying cannot help.
    #[error("permanent resource failure: {0}")]
    PermanentResource(String),
    /// A component is misconfigured and cannot start.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Coarse failure kind, used where only the retry decision matters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    TransientIo,
    PermanentResource,
    Configuration,
}

impl EdgeError {
    pub fn invalid_input(msg: impl Into<String>) -> anyhow::Error {
        EdgeError::InvalidInput(msg.into()).into()
    }

    pub fn transient(msg: impl Into<String>) -> anyhow::Error {
        EdgeError::TransientIo(msg.into()).into()
    }

    pub fn permanent(msg: impl Into<String>) -> anyhow::Error {
        EdgeError::PermanentResource(msg.into()).into()
    }

    pub fn configuration(msg: impl Into<String>) -> anyhow::Error {
        EdgeError::Configuration(msg.into()).into()
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EdgeError::InvalidInput(_) => ErrorKind::InvalidInput,
            EdgeError::TransientIo(_) => ErrorKind::TransientIo,
            EdgeError::PermanentResource(_) => ErrorKind::PermanentResource,
            EdgeError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Recover the failure kind from an error chain.
    pub fn classify(err: &anyhow::Error) -> ErrorKind {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<EdgeError>())
            .map(EdgeError::kind)
            .unwrap_or(ErrorKind::TransientIo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_finds_kind_through_context() {
        let err = Err::<(), _>(EdgeError::permanent("missing file"))
            .context("upload faces/abc/1.jpg")
            .unwrap_err();
        assert_eq!(EdgeError::classify(&err), ErrorKind::PermanentResource);
    }

    #[test]
    fn untyped_errors_are_transient() {
        let err = anyhow::anyhow!("connection reset");
        assert_eq!(EdgeError::classify(&err), ErrorKind::TransientIo);
    }
}
