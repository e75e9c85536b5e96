use thiserror::Error;

/// Crate-wide error type for the gateway core.
///
/// Every fallible path in the connection manager, staging buffer, analytics
/// worker, and storage worker returns one of these variants. IO and protocol
/// errors on a single client connection are handled locally (the offending
/// client is dropped); only the variants the orchestrator needs to react to
/// propagate further.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("staging buffer is shut down")]
    BufferShutdown,

    #[error("database connection failed: {0}")]
    DbConnect(String),

    #[error("database insert failed: {0}")]
    DbInsert(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}
