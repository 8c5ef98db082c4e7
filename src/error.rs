//! Error types and result definitions for the tuya2mqtt crate.
//! Frame-level failures are kept apart from session and routing failures so a
//! worker can tell a single bad frame from a dead connection.

use thiserror::Error;

/// Reasons a frame could not be encoded or decoded.
///
/// Decoding checks markers, then length, then integrity, then decryption, and
/// reports the first failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Prefix or suffix marker missing, or header truncated
    #[error("Malformed header: {0}")]
    MalformedHeader(&'static str),

    /// Declared length disagrees with the bytes available
    #[error("Bad length: declared {declared}, available {available}")]
    BadLength { declared: usize, available: usize },

    /// CRC32, HMAC or GCM tag did not validate
    #[error("Integrity check failed")]
    IntegrityMismatch,

    /// Ciphertext could not be decrypted (wrong key, padding or encoding)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Plaintext could not be encrypted
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Keys must be exactly 16 bytes
    #[error("Invalid key length {0}, expected 16")]
    InvalidKey(usize),
}

impl FrameError {
    /// True when the byte stream can no longer be trusted to be aligned on
    /// frame boundaries.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            FrameError::MalformedHeader(_) | FrameError::BadLength { .. }
        )
    }
}

/// Represents all errors raised by the bridge.
#[derive(Error, Debug, Clone)]
pub enum TuyaError {
    /// Standard IO error (network reset, broken pipe, ...)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Frame could not be encoded or decoded
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Connect, read or handshake step timed out
    #[error("Timeout waiting for device")]
    Timeout,

    /// TCP connection could not be established
    #[error("Socket connection failed: {0}")]
    ConnectionFailed(String),

    /// Session key negotiation failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Device is not in the Ready state
    #[error("Device offline")]
    Offline,

    /// Too many undecodable frames in a row
    #[error("Check device key or version")]
    KeyOrVersionError,

    /// Device name or identifier not present in the registry
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),

    /// Sub-device identifier or addressing token not present in the registry
    #[error("Sub-device '{0}' not found")]
    SubDeviceNotFound(String),

    /// Topic does not follow the command schema
    #[error("Invalid topic '{0}'")]
    InvalidTopic(String),

    /// Registry or broker configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device name or identifier appears twice in the registry
    #[error("Device '{0}' already exists")]
    DuplicateDevice(String),

    /// Messaging collaborator rejected a call
    #[error("Messaging error: {0}")]
    Messaging(String),

    /// A bounded queue between workers had no room
    #[error("Queue full: {0}")]
    QueueFull(String),
}

/// A specialized Result type for bridge operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TuyaError::Timeout,
            _ => TuyaError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl TuyaError {
    /// Errors that end the current connection and send the session into
    /// reconnect backoff.
    pub fn is_transport(&self) -> bool {
        match self {
            TuyaError::Io(_)
            | TuyaError::Timeout
            | TuyaError::ConnectionFailed(_)
            | TuyaError::Handshake(_)
            | TuyaError::Offline
            | TuyaError::KeyOrVersionError => true,
            TuyaError::Frame(e) => e.is_desync(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desync_frames_are_transport_errors() {
        let e: TuyaError = FrameError::BadLength {
            declared: 40,
            available: 12,
        }
        .into();
        assert!(e.is_transport());

        let e: TuyaError = FrameError::IntegrityMismatch.into();
        assert!(!e.is_transport());
    }

    #[test]
    fn io_timeouts_map_to_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(TuyaError::from(io), TuyaError::Timeout));
    }

    #[test]
    fn routing_errors_stay_local() {
        assert!(!TuyaError::DeviceNotFound("lamp".into()).is_transport());
        assert!(!TuyaError::InvalidTopic("x/y".into()).is_transport());
    }
}
