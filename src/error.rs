use std::io;

/// Error taxonomy for the appliance (§7): device-access failures, protocol
/// violations, timing failures, validation failures, child-process failures
/// and signal-initiated shutdown. Every fallible operation in this crate
/// returns one of these — no partial-success reporting crosses an
/// interface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("device access failed: {0}")]
    Device(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("timing failure: {0}")]
    Timing(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("child process failed: {0}")]
    Child(String),

    #[error("shutdown requested by signal")]
    Signal,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Device(e.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Device(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
