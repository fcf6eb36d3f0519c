//! Error types for protocol parsing and encoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding or encoding protocol data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A status code that is not part of the batch state machine.
    #[error("unknown batch status: {0}")]
    UnknownStatus(String),

    /// A malformed acknowledgment line.
    #[error("malformed ack line: {0}")]
    MalformedAck(String),

    /// A staged payload frame could not be decoded.
    #[error("malformed frame at line {line}: {message}")]
    MalformedFrame {
        /// One-based line number in the payload.
        line: usize,
        /// Decoder message.
        message: String,
    },

    /// Frames arrived in an order that does not describe a batch.
    #[error("unexpected frame at line {line}: {message}")]
    UnexpectedFrame {
        /// One-based line number in the payload.
        line: usize,
        /// What was wrong.
        message: String,
    },

    /// JSON encoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::UnknownStatus("XX".into());
        assert_eq!(err.to_string(), "unknown batch status: XX");

        let err = ProtocolError::MalformedFrame {
            line: 3,
            message: "eof".into(),
        };
        assert!(err.to_string().contains("line 3"));
    }
}
