//! Shared protocol logic: frame header layout, message splitting and
//! path handling used by both node roles.

use bytes::{BufMut, Bytes, BytesMut};
use std::path::{Component, Path, PathBuf};

use crate::error::{ProtocolError, SyncError, SyncResult};
use crate::protocol::{MessageType, FRAME_LEN_FIELD_MAX, HEADER_LEN, MAGIC, VERSION};

const LEN_MASK: u64 = (1 << 22) - 1;
const START_BIT: u64 = 1 << 54;
const END_BIT: u64 = 1 << 55;

/// Decoded frame header.
///
/// Layout (16 bytes, little-endian): MAGIC (4) | TOTAL_LEN (4) | packed u64
/// with VERSION (16 bits) | HEADER_LEN (8) | TYPE (8) | FRAME_LEN (22) |
/// START (1) | END (1) | reserved (8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub total_len: u32,
    pub version: u16,
    pub header_len: u8,
    pub msg_type: u8,
    pub len: u32,
    pub start: bool,
    pub end: bool,
}

impl FrameHeader {
    pub fn new(kind: MessageType, total_len: u32, len: u32, start: bool, end: bool) -> Self {
        Self {
            magic: MAGIC,
            total_len,
            version: VERSION,
            header_len: HEADER_LEN as u8,
            msg_type: kind as u8,
            len,
            start,
            end,
        }
    }

    /// Payload length of this frame alone
    pub fn frame_len(&self) -> usize {
        self.len as usize
    }

    pub fn is_single(&self) -> bool {
        self.start && self.end
    }

    /// Check everything the header can tell about itself. `BadMagic` is
    /// the one error a receiver may shrug off by dropping the frame.
    pub fn validate(&self, max_frame: usize) -> Result<MessageType, ProtocolError> {
        if self.magic != MAGIC {
            return Err(ProtocolError::BadMagic(self.magic));
        }
        if self.version != VERSION {
            return Err(ProtocolError::VersionMismatch {
                got: self.version,
                need: VERSION,
            });
        }
        if self.header_len as usize != HEADER_LEN {
            return Err(ProtocolError::BadHeaderLength(self.header_len));
        }
        validate_frame_size(self.frame_len(), max_frame)?;
        MessageType::from_u8(self.msg_type).ok_or(ProtocolError::UnknownMessageType(self.msg_type))
    }
}

/// Validate frame payload size against the configured cap
pub fn validate_frame_size(size: usize, max_frame: usize) -> Result<(), ProtocolError> {
    let max = max_frame.min(FRAME_LEN_FIELD_MAX);
    if size > max {
        return Err(ProtocolError::FrameTooLarge { len: size, max });
    }
    Ok(())
}

/// Build frame header (16 bytes)
pub fn build_frame_header(h: &FrameHeader) -> [u8; HEADER_LEN] {
    let packed = u64::from(h.version)
        | u64::from(h.header_len) << 16
        | u64::from(h.msg_type) << 24
        | (u64::from(h.len) & LEN_MASK) << 32
        | if h.start { START_BIT } else { 0 }
        | if h.end { END_BIT } else { 0 };

    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&h.magic.to_le_bytes());
    header[4..8].copy_from_slice(&h.total_len.to_le_bytes());
    header[8..16].copy_from_slice(&packed.to_le_bytes());
    header
}

/// Parse frame header. Pure bit extraction; see [`FrameHeader::validate`].
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> FrameHeader {
    let word = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let mut packed = [0u8; 8];
    packed.copy_from_slice(&header[8..16]);
    let packed = u64::from_le_bytes(packed);

    FrameHeader {
        magic: word(0),
        total_len: word(4),
        version: (packed & 0xffff) as u16,
        header_len: (packed >> 16 & 0xff) as u8,
        msg_type: (packed >> 24 & 0xff) as u8,
        len: (packed >> 32 & LEN_MASK) as u32,
        start: packed & START_BIT != 0,
        end: packed & END_BIT != 0,
    }
}

/// One frame: header plus its slice of the message payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

/// Split a logical message into frames of at most `max_frame` payload bytes.
/// An empty payload still produces one frame carrying both flags.
pub fn split_message(
    kind: MessageType,
    payload: Bytes,
    max_frame: usize,
) -> Result<Vec<Frame>, ProtocolError> {
    let total = payload.len();
    let total_len = u32::try_from(total).map_err(|_| ProtocolError::MessageTooLarge {
        len: total,
        max: u32::MAX as usize,
    })?;
    let chunk = max_frame.clamp(1, FRAME_LEN_FIELD_MAX);

    let mut frames = Vec::with_capacity(total.div_ceil(chunk).max(1));
    let mut offset = 0;
    loop {
        let cur = (total - offset).min(chunk);
        let start = offset == 0;
        let end = offset + cur == total;
        frames.push(Frame {
            header: FrameHeader::new(kind, total_len, cur as u32, start, end),
            payload: payload.slice(offset..offset + cur),
        });
        offset += cur;
        if end {
            break;
        }
    }
    Ok(frames)
}

/// Concatenate frames into one wire buffer so a whole message is queued at once
pub fn encode_frames(frames: &[Frame]) -> Bytes {
    let size = frames.iter().map(|f| HEADER_LEN + f.payload.len()).sum();
    let mut buf = BytesMut::with_capacity(size);
    for f in frames {
        buf.put_slice(&build_frame_header(&f.header));
        buf.put_slice(&f.payload);
    }
    buf.freeze()
}

/// Resolve a relative name received from a peer to a path under `root`.
/// Rejects absolute paths, parent components and NUL bytes; does not touch
/// the filesystem.
pub fn normalize_under_root(root: &Path, name: &str) -> SyncResult<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if name.is_empty() || name.contains('\0') {
        return Err(SyncError::InvalidPath(name.to_string()));
    }

    let mut safe = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => {
                return Err(SyncError::InvalidPath(name.to_string()));
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(SyncError::InvalidPath(name.to_string()));
    }
    Ok(root.join(safe))
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> SyncResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::fs(parent, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_FRAME_SIZE;
    use tempfile::TempDir;

    #[test]
    fn test_frame_header_round_trip() {
        let h = FrameHeader::new(MessageType::FileResponse, 3_000_000, 1_048_576, true, false);
        let parsed = parse_frame_header(&build_frame_header(&h));
        assert_eq!(parsed, h);
        assert_eq!(parsed.validate(MAX_FRAME_SIZE).unwrap(), MessageType::FileResponse);
    }

    #[test]
    fn test_frame_header_bit_layout() {
        let h = FrameHeader::new(MessageType::MetaResponse, 0x0102_0304, 0x3f_ffff, true, true);
        let raw = build_frame_header(&h);
        assert_eq!(&raw[0..4], &[0xe0, 0xac, 0xe0, 0xac]);
        assert_eq!(&raw[4..8], &[0x04, 0x03, 0x02, 0x01]);
        // version 0, hlen 16, type 2
        assert_eq!(&raw[8..12], &[0x00, 0x00, 0x10, 0x02]);
        // 22-bit length all ones, then sop/eop in bits 22/23 of the upper word
        let upper = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);
        assert_eq!(upper, 0x3f_ffff | 1 << 22 | 1 << 23);
    }

    #[test]
    fn test_parse_frame_header_invalid_magic() {
        let mut h = FrameHeader::new(MessageType::MetaDigest, 8, 8, true, true);
        h.magic = 0xdead_beef;
        let parsed = parse_frame_header(&build_frame_header(&h));
        assert_eq!(
            parsed.validate(MAX_FRAME_SIZE),
            Err(ProtocolError::BadMagic(0xdead_beef))
        );
    }

    #[test]
    fn test_parse_frame_header_wrong_version_and_type() {
        let mut h = FrameHeader::new(MessageType::MetaDigest, 8, 8, true, true);
        h.version = 999;
        assert!(matches!(
            h.validate(MAX_FRAME_SIZE),
            Err(ProtocolError::VersionMismatch { got: 999, .. })
        ));

        let mut h = FrameHeader::new(MessageType::MetaDigest, 8, 8, true, true);
        h.msg_type = 9;
        assert_eq!(
            h.validate(MAX_FRAME_SIZE),
            Err(ProtocolError::UnknownMessageType(9))
        );

        let mut h = FrameHeader::new(MessageType::MetaDigest, 8, 8, true, true);
        h.header_len = 24;
        assert_eq!(h.validate(MAX_FRAME_SIZE), Err(ProtocolError::BadHeaderLength(24)));
    }

    #[test]
    fn test_validate_frame_size() {
        assert!(validate_frame_size(0, MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE, MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE + 1, MAX_FRAME_SIZE).is_err());
        assert!(validate_frame_size(usize::MAX, usize::MAX).is_err());
    }

    #[test]
    fn test_split_single_frame() {
        let frames = split_message(MessageType::MetaDigest, Bytes::from_static(&[0u8; 8]), 1024).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].header.is_single());
        assert_eq!(frames[0].header.total_len, 8);
        assert_eq!(frames[0].header.len, 8);
    }

    #[test]
    fn test_split_empty_payload() {
        let frames = split_message(MessageType::MetaRequest, Bytes::new(), 1024).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].header.is_single());
        assert_eq!(frames[0].header.len, 0);
    }

    #[test]
    fn test_split_multi_frame() {
        let payload: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let frames = split_message(MessageType::FileResponse, Bytes::from(payload.clone()), 1000).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].header.start && !frames[0].header.end);
        assert!(!frames[1].header.start && !frames[1].header.end);
        assert!(!frames[2].header.start && frames[2].header.end);
        assert_eq!(frames[2].header.len, 500);
        assert!(frames.iter().all(|f| f.header.total_len == 2500));
        let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_split_exact_multiple() {
        let frames = split_message(MessageType::FileResponse, Bytes::from(vec![7u8; 2000]), 1000).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[1].header.end);
    }

    #[test]
    fn test_encode_frames_layout() {
        let frames = split_message(MessageType::FileRequest, Bytes::from_static(b"abc"), 2).unwrap();
        let wire = encode_frames(&frames);
        assert_eq!(wire.len(), 2 * HEADER_LEN + 3);
        let mut first = [0u8; HEADER_LEN];
        first.copy_from_slice(&wire[..HEADER_LEN]);
        assert_eq!(parse_frame_header(&first), frames[0].header);
        assert_eq!(&wire[HEADER_LEN..HEADER_LEN + 2], b"ab");
    }

    #[test]
    fn test_normalize_under_root_safe_paths() {
        let root = Path::new("/srv/tree");
        assert_eq!(
            normalize_under_root(root, "subdir/file.txt").unwrap(),
            root.join("subdir/file.txt")
        );
        assert_eq!(
            normalize_under_root(root, "./subdir/./file.txt").unwrap(),
            root.join("subdir/file.txt")
        );
    }

    #[test]
    fn test_normalize_under_root_unsafe_paths() {
        let root = Path::new("/srv/tree");
        assert!(normalize_under_root(root, "../etc/passwd").is_err());
        assert!(normalize_under_root(root, "subdir/../../etc/passwd").is_err());
        assert!(normalize_under_root(root, "/etc/passwd").is_err());
        assert!(normalize_under_root(root, "file\0.txt").is_err());
        assert!(normalize_under_root(root, "").is_err());
        assert!(normalize_under_root(root, ".").is_err());
    }

    #[test]
    fn test_ensure_parent_exists() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("new").join("nested").join("file.txt");

        assert!(!file_path.parent().unwrap().exists());
        ensure_parent_exists(&file_path).unwrap();
        assert!(file_path.parent().unwrap().is_dir());
        // Should be idempotent
        ensure_parent_exists(&file_path).unwrap();
    }
}
