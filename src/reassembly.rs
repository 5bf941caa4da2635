//! Per-connection segment reassembly: frames of one logical message are
//! collected until the end-of-message frame arrives.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::{MessageType, DEFAULT_MAX_MESSAGE_SIZE};
use crate::protocol_core::FrameHeader;

#[derive(Debug)]
struct Assembly {
    kind: MessageType,
    total_len: usize,
    buffer: BytesMut,
}

/// At most one message in flight per connection. A start frame abandons
/// whatever partial message came before it.
#[derive(Debug)]
pub struct SegmentAssembler {
    current: Option<Assembly>,
    max_message_size: usize,
}

impl Default for SegmentAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl SegmentAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            current: None,
            max_message_size,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// Drop any partial message (connection closed, or failed mid-message).
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Feed one frame. Returns the whole payload on the end-of-message frame.
    pub fn push(
        &mut self,
        kind: MessageType,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<Option<Bytes>, ProtocolError> {
        let result = self.push_inner(kind, header, payload);
        if result.is_err() {
            self.current = None;
        }
        result
    }

    fn push_inner(
        &mut self,
        kind: MessageType,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<Option<Bytes>, ProtocolError> {
        if payload.len() != header.frame_len() {
            return Err(ProtocolError::LengthMismatch {
                what: "frame",
                declared: header.frame_len(),
                actual: payload.len(),
            });
        }

        if header.start {
            if let Some(old) = self.current.take() {
                tracing::debug!(
                    "abandoning partial {:?} ({}/{} bytes)",
                    old.kind,
                    old.buffer.len(),
                    old.total_len
                );
            }
            let total_len = header.total_len as usize;
            if total_len > self.max_message_size {
                return Err(ProtocolError::MessageTooLarge {
                    len: total_len,
                    max: self.max_message_size,
                });
            }
            self.current = Some(Assembly {
                kind,
                total_len,
                buffer: BytesMut::with_capacity(total_len),
            });
        }

        let asm = self.current.as_mut().ok_or(ProtocolError::NoAssembly)?;
        if asm.kind != kind {
            return Err(ProtocolError::TypeSwitch {
                started: asm.kind,
                got: kind,
            });
        }
        if header.total_len as usize != asm.total_len {
            return Err(ProtocolError::LengthMismatch {
                what: "message total",
                declared: asm.total_len,
                actual: header.total_len as usize,
            });
        }
        if asm.buffer.len() + payload.len() > asm.total_len {
            return Err(ProtocolError::LengthMismatch {
                what: "message",
                declared: asm.total_len,
                actual: asm.buffer.len() + payload.len(),
            });
        }
        asm.buffer.put_slice(payload);

        if !header.end {
            return Ok(None);
        }

        let asm = self.current.take().ok_or(ProtocolError::NoAssembly)?;
        if asm.buffer.len() != asm.total_len {
            return Err(ProtocolError::LengthMismatch {
                what: "message",
                declared: asm.total_len,
                actual: asm.buffer.len(),
            });
        }
        Ok(Some(asm.buffer.freeze()))
    }
}
