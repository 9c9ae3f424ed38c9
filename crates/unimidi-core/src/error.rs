//! Error types shared by every unimidi crate.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("MIDI port unavailable: {0}")]
    PortUnavailable(String),

    #[error("MIDI port already open: {0}")]
    AlreadyOpen(String),

    #[error("MIDI port is not open")]
    NotOpen,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unknown MIDI API: {0}")]
    UnknownApi(String),

    #[error("Backend I/O error: {0}")]
    BackendIo(String),

    #[error("Malformed MIDI message {bytes:02X?}: {reason}")]
    MalformedMessage { bytes: Vec<u8>, reason: String },

    #[error("Malformed UMP packet {words:08X?}: {reason}")]
    MalformedUmp { words: Vec<u32>, reason: String },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

/// Fieldless discriminant of [`Error`], for callers that only branch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PortUnavailable,
    AlreadyOpen,
    NotOpen,
    PermissionDenied,
    UnknownApi,
    BackendIo,
    MalformedMessage,
    Unsupported,
    InvalidConfig,
}

impl Error {
    pub fn malformed(bytes: &[u8], reason: impl Into<String>) -> Self {
        Error::MalformedMessage {
            bytes: bytes.to_vec(),
            reason: reason.into(),
        }
    }

    pub fn malformed_ump(words: &[u32], reason: impl Into<String>) -> Self {
        Error::MalformedUmp {
            words: words.to_vec(),
            reason: reason.into(),
        }
    }

    /// UMP decode failures share the `MalformedMessage` kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PortUnavailable(_) => ErrorKind::PortUnavailable,
            Error::AlreadyOpen(_) => ErrorKind::AlreadyOpen,
            Error::NotOpen => ErrorKind::NotOpen,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::UnknownApi(_) => ErrorKind::UnknownApi,
            Error::BackendIo(_) => ErrorKind::BackendIo,
            Error::MalformedMessage { .. } | Error::MalformedUmp { .. } => {
                ErrorKind::MalformedMessage
            }
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_display_shows_bytes_in_hex() {
        let err = Error::malformed(&[0x90, 0x40], "truncated");
        assert_eq!(
            err.to_string(),
            "Malformed MIDI message [90, 40]: truncated"
        );
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
    }

    #[test]
    fn test_ump_errors_share_malformed_kind() {
        let err = Error::malformed_ump(&[0x4090_0000], "short packet");
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
        assert!(err.to_string().contains("40900000"));
    }
}
