//! Gateway Error Types
//!
//! Codec, queue and gateway-level errors. None of them is fatal: the engine
//! always returns to idle and keeps serving the queue.

use thiserror::Error;

/// Result type for rtu-gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Frame codec errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes than the smallest valid frame
    #[error("Frame truncated")]
    Truncated,

    /// RTU CRC-16 does not match the frame contents
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{received:04X}")]
    CrcMismatch { expected: u16, received: u16 },

    /// Function code 0 or a bare exception bit
    #[error("Invalid function code: 0x{0:02X}")]
    InvalidFunction(u8),

    /// Frame exceeds the fixed buffer size
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    /// MBAP protocol identifier other than 0
    #[error("Invalid protocol ID: expected 0, got {0}")]
    InvalidProtocolId(u16),

    /// MBAP length field disagrees with the received length
    #[error("Invalid ADU length: declared {declared}, received {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Unit identifier outside 0-247
    #[error("Invalid unit ID: {0}")]
    InvalidUnitId(u8),
}

/// Request queue errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Entry count or byte budget would be exceeded
    #[error("Request queue full")]
    Full,

    /// Nothing to dequeue
    #[error("Request queue empty")]
    Empty,
}

/// Gateway errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Frame codec errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Request queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Operation refused while a transaction or scan is active
    #[error("Busy: {0}")]
    Busy(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serial IO errors
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

// Helper methods for creating errors
impl GatewayError {
    pub fn busy(msg: impl Into<String>) -> Self {
        GatewayError::Busy(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Config(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        GatewayError::Io(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_messages() {
        let err = CodecError::CrcMismatch {
            expected: 0x0A84,
            received: 0xFFFF,
        };
        assert_eq!(
            err.to_string(),
            "CRC mismatch: expected 0x0A84, got 0xFFFF"
        );
        assert_eq!(
            CodecError::FrameTooLarge { len: 300, max: 256 }.to_string(),
            "Frame too large: 300 bytes (max 256)"
        );
    }

    #[test]
    fn test_gateway_error_conversions() {
        let err: GatewayError = QueueError::Full.into();
        assert_eq!(err, GatewayError::Queue(QueueError::Full));

        let err: GatewayError = CodecError::Truncated.into();
        assert!(err.to_string().contains("truncated"));

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "port gone");
        let err: GatewayError = io.into();
        assert!(matches!(err, GatewayError::Io(msg) if msg.contains("port gone")));
    }
}
