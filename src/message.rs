//! Typed payloads for the five message kinds.
//!
//! Wire format: all integers little-endian. Names are NUL-terminated UTF-8.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::MessageType;
use crate::protocol_core::{encode_frames, split_message, Frame};
use crate::snapshot::Snapshot;

/// MetaRequest carries no data but the reference peer declares 8 bytes
const META_REQUEST_LEN: usize = 8;
const META_DIGEST_LEN: usize = 8;
/// flags u32 | data_len u32 | mtime i64
const FILE_RESPONSE_HEAD_LEN: usize = 16;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileResponseFlags: u32 {
        /// The name is in the server's current snapshot
        const VALID = 0x1;
        /// The file could be opened and read when the response was built
        const EXISTS = 0x2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaDigest {
    pub file_count: u32,
    pub digest: u32,
}

impl MetaDigest {
    pub fn of(snapshot: &Snapshot) -> Self {
        Self {
            file_count: snapshot.len() as u32,
            digest: snapshot.digest(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResponse {
    pub flags: FileResponseFlags,
    pub mtime: i64,
    pub name: String,
    pub data: Bytes,
}

impl FileResponse {
    /// Name is unknown to the server
    pub fn stale(name: impl Into<String>) -> Self {
        Self {
            flags: FileResponseFlags::empty(),
            mtime: 0,
            name: name.into(),
            data: Bytes::new(),
        }
    }

    /// Both flags set: the payload is the file's current content
    pub fn is_present(&self) -> bool {
        self.flags.contains(FileResponseFlags::VALID | FileResponseFlags::EXISTS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    MetaDigest(MetaDigest),
    MetaRequest,
    MetaResponse(Snapshot),
    FileRequest(FileRequest),
    FileResponse(FileResponse),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::MetaDigest(_) => MessageType::MetaDigest,
            Self::MetaRequest => MessageType::MetaRequest,
            Self::MetaResponse(_) => MessageType::MetaResponse,
            Self::FileRequest(_) => MessageType::FileRequest,
            Self::FileResponse(_) => MessageType::FileResponse,
        }
    }

    pub fn encode_payload(&self) -> Bytes {
        match self {
            Self::MetaDigest(md) => {
                let mut buf = BytesMut::with_capacity(META_DIGEST_LEN);
                buf.put_u32_le(md.file_count);
                buf.put_u32_le(md.digest);
                buf.freeze()
            }
            Self::MetaRequest => Bytes::from_static(&[0u8; META_REQUEST_LEN]),
            Self::MetaResponse(snapshot) => snapshot.serialize(),
            Self::FileRequest(req) => {
                let name = req.name.as_bytes();
                let mut buf = BytesMut::with_capacity(4 + name.len() + 1);
                buf.put_u32_le((name.len() + 1) as u32);
                buf.put_slice(name);
                buf.put_u8(0);
                buf.freeze()
            }
            Self::FileResponse(res) => {
                let name = res.name.as_bytes();
                let mut buf =
                    BytesMut::with_capacity(FILE_RESPONSE_HEAD_LEN + name.len() + 1 + res.data.len());
                buf.put_u32_le(res.flags.bits());
                buf.put_u32_le(res.data.len() as u32);
                buf.put_i64_le(res.mtime);
                buf.put_slice(name);
                buf.put_u8(0);
                buf.put_slice(&res.data);
                buf.freeze()
            }
        }
    }

    /// Decode a complete (reassembled) payload of the given kind
    pub fn decode(kind: MessageType, mut payload: Bytes) -> Result<Self, ProtocolError> {
        match kind {
            MessageType::MetaDigest => {
                expect_len("MetaDigest", &payload, META_DIGEST_LEN)?;
                Ok(Self::MetaDigest(MetaDigest {
                    file_count: payload.get_u32_le(),
                    digest: payload.get_u32_le(),
                }))
            }
            MessageType::MetaRequest => {
                expect_len("MetaRequest", &payload, META_REQUEST_LEN)?;
                Ok(Self::MetaRequest)
            }
            MessageType::MetaResponse => Ok(Self::MetaResponse(Snapshot::deserialize(&payload)?)),
            MessageType::FileRequest => {
                need("FileRequest", &payload, 4)?;
                // declared name length is informational only
                let _declared = payload.get_u32_le();
                let name = take_name("FileRequest", &mut payload)?;
                if payload.has_remaining() {
                    return Err(ProtocolError::LengthMismatch {
                        what: "FileRequest",
                        declared: 0,
                        actual: payload.remaining(),
                    });
                }
                Ok(Self::FileRequest(FileRequest { name }))
            }
            MessageType::FileResponse => {
                let total = payload.len();
                need("FileResponse", &payload, FILE_RESPONSE_HEAD_LEN)?;
                let flags = FileResponseFlags::from_bits_truncate(payload.get_u32_le());
                let data_len = payload.get_u32_le() as usize;
                let mtime = payload.get_i64_le();
                let name = take_name("FileResponse", &mut payload)?;
                let expected = FILE_RESPONSE_HEAD_LEN + name.len() + 1 + data_len;
                if expected != total {
                    return Err(ProtocolError::LengthMismatch {
                        what: "FileResponse",
                        declared: total,
                        actual: expected,
                    });
                }
                Ok(Self::FileResponse(FileResponse {
                    flags,
                    mtime,
                    name,
                    data: payload,
                }))
            }
        }
    }

    pub fn to_frames(&self, max_frame: usize) -> Result<Vec<Frame>, ProtocolError> {
        split_message(self.kind(), self.encode_payload(), max_frame)
    }

    /// All frames of this message as one contiguous wire buffer
    pub fn to_wire(&self, max_frame: usize) -> Result<Bytes, ProtocolError> {
        Ok(encode_frames(&self.to_frames(max_frame)?))
    }
}

fn need(what: &'static str, buf: &Bytes, n: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        return Err(ProtocolError::Truncated {
            what,
            need: n,
            have: buf.remaining(),
        });
    }
    Ok(())
}

fn expect_len(what: &'static str, buf: &Bytes, n: usize) -> Result<(), ProtocolError> {
    if buf.len() != n {
        return Err(ProtocolError::LengthMismatch {
            what,
            declared: n,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Split a NUL-terminated UTF-8 name off the front of `buf`
fn take_name(what: &'static str, buf: &mut Bytes) -> Result<String, ProtocolError> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::MissingNul(what))?;
    let raw = buf.split_to(nul);
    buf.advance(1);
    let name = String::from_utf8(raw.to_vec())
        .map_err(|_| ProtocolError::InvalidName(String::from_utf8_lossy(&raw).into_owned()))?;
    if name.is_empty() {
        return Err(ProtocolError::InvalidName(name));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::FileEntry;

    fn round_trip(msg: &Message) -> Message {
        Message::decode(msg.kind(), msg.encode_payload()).unwrap()
    }

    #[test]
    fn test_meta_digest_layout() {
        let msg = Message::MetaDigest(MetaDigest {
            file_count: 2,
            digest: 0x7E81_CE28,
        });
        let wire = msg.encode_payload();
        assert_eq!(&wire[..], &[2, 0, 0, 0, 0x28, 0xce, 0x81, 0x7e]);
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_meta_request_is_eight_reserved_bytes() {
        assert_eq!(Message::MetaRequest.encode_payload().len(), 8);
        assert_eq!(round_trip(&Message::MetaRequest), Message::MetaRequest);
        assert!(Message::decode(MessageType::MetaRequest, Bytes::from_static(&[0; 4])).is_err());
    }

    #[test]
    fn test_meta_response_carries_snapshot() {
        let snap = Snapshot::from_entries(
            vec![FileEntry::new("a.txt", 100), FileEntry::new("b.txt", 100)],
            2,
        );
        let msg = Message::MetaResponse(snap.clone());
        match round_trip(&msg) {
            Message::MetaResponse(back) => {
                assert_eq!(back.entries(), snap.entries());
                assert_eq!(back.digest(), snap.digest());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_file_request_layout() {
        let msg = Message::FileRequest(FileRequest {
            name: "dir/a.txt".into(),
        });
        let wire = msg.encode_payload();
        assert_eq!(&wire[..4], &10u32.to_le_bytes());
        assert_eq!(&wire[4..], b"dir/a.txt\0");
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_file_request_rejects_missing_nul_and_trailing() {
        let mut raw = 3u32.to_le_bytes().to_vec();
        raw.extend_from_slice(b"abc");
        assert_eq!(
            Message::decode(MessageType::FileRequest, Bytes::from(raw.clone())),
            Err(ProtocolError::MissingNul("FileRequest"))
        );
        raw.extend_from_slice(b"\0x");
        assert!(Message::decode(MessageType::FileRequest, Bytes::from(raw)).is_err());
    }

    #[test]
    fn test_file_response_round_trip() {
        let msg = Message::FileResponse(FileResponse {
            flags: FileResponseFlags::VALID | FileResponseFlags::EXISTS,
            mtime: 1_700_000_000,
            name: "a.txt".into(),
            data: Bytes::from_static(b"hello"),
        });
        let wire = msg.encode_payload();
        assert_eq!(wire.len(), 16 + 6 + 5);
        assert_eq!(&wire[..4], &3u32.to_le_bytes());
        assert_eq!(&wire[4..8], &5u32.to_le_bytes());
        let back = round_trip(&msg);
        assert_eq!(back, msg);
        match back {
            Message::FileResponse(r) => assert!(r.is_present()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_file_response_flag_states() {
        let stale = FileResponse::stale("gone.txt");
        assert!(!stale.is_present());
        assert!(stale.flags.is_empty());

        let mut vanished = FileResponse::stale("gone.txt");
        vanished.flags = FileResponseFlags::VALID;
        assert!(!vanished.is_present());
        let back = round_trip(&Message::FileResponse(vanished.clone()));
        assert_eq!(back, Message::FileResponse(vanished));
    }

    #[test]
    fn test_file_response_length_mismatch() {
        let msg = Message::FileResponse(FileResponse {
            flags: FileResponseFlags::VALID | FileResponseFlags::EXISTS,
            mtime: 1,
            name: "a".into(),
            data: Bytes::from_static(b"xyz"),
        });
        let wire = msg.encode_payload();
        let short = wire.slice(..wire.len() - 1);
        assert!(matches!(
            Message::decode(MessageType::FileResponse, short),
            Err(ProtocolError::LengthMismatch { .. })
        ));
        assert!(matches!(
            Message::decode(MessageType::FileResponse, wire.slice(..10)),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_to_frames_splits_large_response() {
        let msg = Message::FileResponse(FileResponse {
            flags: FileResponseFlags::VALID | FileResponseFlags::EXISTS,
            mtime: 1,
            name: "big.bin".into(),
            data: Bytes::from(vec![0xabu8; 3000]),
        });
        let frames = msg.to_frames(1024).unwrap();
        assert_eq!(frames.len(), 3);
        let total = 16 + 8 + 3000;
        assert!(frames.iter().all(|f| f.header.total_len == total as u32));
        assert_eq!(
            frames.iter().map(|f| f.header.len as usize).sum::<usize>(),
            total
        );
        let wire = msg.to_wire(1024).unwrap();
        assert_eq!(wire.len(), total + 3 * crate::protocol::HEADER_LEN);
    }
}
