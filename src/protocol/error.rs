use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Frame does not start with STX")]
    MissingStx,

    #[error("Frame truncated before trailer")]
    Truncated,

    #[error("Invalid frame trailer")]
    BadTrailer,

    #[error("Invalid checksum: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Link establishment failed: {0}")]
    EstablishmentFailed(String),

    #[error("Remote not ready (NAK after ENQ)")]
    NotReady,

    #[error("Frame retransmission attempts exhausted")]
    RetryExhausted,

    #[error("Invalid record format: {0}")]
    InvalidRecordFormat(String),

    #[error("Invalid HL7 message: {0}")]
    InvalidHl7(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
