use thiserror::Error;

#[derive(Debug, Error)]
pub enum StackError {
    // Transport layer errors
    #[error("CAN TP error: {0}")]
    CanTpError(String),
    #[error("transport protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // Network management errors
    #[error("NM error: {0}")]
    NmError(String),

    // Diagnostic layer errors
    #[error("UDS error: {0}")]
    UdsError(String),

    // Generic errors
    #[error("operation timed out")]
    Timeout,
    #[error("queue full")]
    QueueFull,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("component not initialized")]
    NotInitialized,
    #[error("busy with a previous transfer")]
    Busy,
    #[error("driver error: {0}")]
    DriverError(String),
}

pub type Result<T> = std::result::Result<T, StackError>;
