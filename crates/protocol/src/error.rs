//! Protocol error types

use thiserror::Error;

/// Protocol-level errors, each fatal for the connection that produced it
/// unless documented otherwise.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Header magic did not match [`crate::constants::MAGIC`].
    #[error("bad magic: {0:#010x}")]
    BadMagic(u32),

    /// Header version did not match the version this peer speaks.
    #[error("unsupported version: {0:#06x}")]
    UnsupportedVersion(u16),

    /// `payload_len` declared in the header exceeds [`crate::constants::MAX_PAYLOAD`].
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The socket closed or returned fewer bytes than the frame declared.
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// A payload that decoded structurally but failed a semantic check
    /// (e.g. an inner length field that claims more bytes than remain in
    /// the frame, or a string field that isn't valid UTF-8 up to its NUL).
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// I/O error while reading or writing a frame.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnsupportedVersion(0x0200);
        let msg = format!("{err}");
        assert!(msg.contains("unsupported version"));
    }

    #[test]
    fn test_payload_too_large_error() {
        let err = ProtocolError::PayloadTooLarge {
            size: 1_000_000,
            max: 65_520,
        };
        let msg = format!("{err}");
        assert!(msg.contains("payload too large"));
    }
}
