use std::io;
use std::result;

use thiserror::Error;

/// Errors surfaced by a `Node`.
///
/// Nothing raised while the node is running is fatal; only `InvalidConfig` stops a node from
/// starting.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("no bootstrap seed responded")]
    BootstrapFailed,
}

/// The failure of a single outbound request.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No correlated response arrived before the request deadline.
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("could not encode message: {0}")]
    Encode(#[from] bincode::Error),

    /// The peer answered with a response kind that does not match the request.
    #[error("unexpected response payload")]
    UnexpectedResponse,
}

pub type Result<T> = result::Result<T, Error>;
