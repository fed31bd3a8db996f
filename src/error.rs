use std::time::Duration;
use thiserror::Error;

/// Errors that are visible to code using the bus.
///
/// Routing failures are not among them: a message without a reachable target is logged and
///  answered with a negative ack, but never reported back to the sending code.
#[derive(Debug, Error)]
pub enum CluckError {
    #[error("link name already used: {0}")]
    DuplicateName(String),
    #[error("invalid link name: {0:?}")]
    InvalidLinkName(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("remote procedure call to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },
    #[error("the node was dropped")]
    NodeDropped,
    #[error("no tokio runtime available: {0}")]
    Runtime(String),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}
