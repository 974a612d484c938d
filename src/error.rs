use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Value out of 16-bit range: {0}")]
    Range(i64),

    #[error("Invalid hex token: {0:?}")]
    InvalidHex(String),

    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("No response for request: {0}")]
    ResponseTimeout(String),

    #[error("Empty response for request: {0}")]
    EmptyResponse(String),

    #[error("Not connected to device")]
    NotConnected,

    #[error("Response out of step with request {request}: {response}")]
    Desync { request: String, response: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device error: {reason} ({})", .tokens.join("_"))]
    Device {
        code: String,
        reason: &'static str,
        tokens: Vec<String>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Command {command} rejected: {response}")]
    CommandRejected { command: String, response: String },

    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
}

impl AppError {
    /// Errors after which the session can no longer be trusted and must be
    /// torn down before the next request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AppError::ConnectFailed { .. }
                | AppError::ConnectTimeout { .. }
                | AppError::ResponseTimeout(_)
                | AppError::EmptyResponse(_)
                | AppError::NotConnected
                | AppError::Desync { .. }
                | AppError::Io(_)
        )
    }

    /// Errors meaning the device answered something our decoder did not expect.
    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(self, AppError::Protocol(_) | AppError::InvalidHex(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
