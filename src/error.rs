//! Error types shared by the codec, the sync engine and the transport.

use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::MessageType;

/// Corrupted or malformed wire data. Fatal to the connection it arrived on,
/// never to the node.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid frame magic: 0x{0:08x}")]
    BadMagic(u32),

    #[error("protocol version mismatch: got {got}, need {need}")]
    VersionMismatch { got: u16, need: u16 },

    #[error("unexpected header length {0}")]
    BadHeaderLength(u8),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("frame payload too large: {len} bytes (max: {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("message too large: {len} bytes (max: {max})")]
    MessageTooLarge { len: usize, max: usize },

    #[error("{what} truncated: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("{what} length mismatch: declared {declared}, got {actual}")]
    LengthMismatch {
        what: &'static str,
        declared: usize,
        actual: usize,
    },

    #[error("{0} name is not NUL-terminated")]
    MissingNul(&'static str),

    #[error("invalid file name on the wire: {0}")]
    InvalidName(String),

    #[error("snapshot entries are not sorted at {0}")]
    Unsorted(String),

    #[error("continuation frame without a start-of-message frame")]
    NoAssembly,

    #[error("message type changed mid-assembly: {started:?} -> {got:?}")]
    TypeSwitch {
        started: MessageType,
        got: MessageType,
    },

    #[error("{0:?} must fit in a single frame")]
    Segmented(MessageType),
}

/// Top-level failure taxonomy for a node.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("filesystem: {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("path {0:?} escapes the sync root")]
    InvalidPath(String),
}

impl SyncError {
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_error_names_path() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e = SyncError::fs("dir/a.txt", io);
        assert_eq!(e.to_string(), "filesystem: dir/a.txt: gone");
        let e: SyncError = ProtocolError::NoAssembly.into();
        assert!(matches!(e, SyncError::Protocol(_)));
    }

    #[test]
    fn test_display() {
        let e = ProtocolError::FrameTooLarge { len: 10, max: 4 };
        assert_eq!(e.to_string(), "frame payload too large: 10 bytes (max: 4)");
        assert_eq!(
            ProtocolError::BadMagic(0xdeadbeef).to_string(),
            "invalid frame magic: 0xdeadbeef"
        );
    }
}
