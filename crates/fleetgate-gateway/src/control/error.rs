//! Control channel error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Stream error: {0}")]
    Stream(String),
}
