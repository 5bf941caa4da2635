//! Server side: owns the authoritative snapshot of the served tree and
//! answers client requests from it.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::error::ProtocolError;
use crate::fs_enum::{file_mtime, FileFilter};
use crate::logger::Logger;
use crate::message::{FileResponse, FileResponseFlags, MetaDigest, Message};
use crate::protocol::MessageType;
use crate::protocol_core::{normalize_under_root, FrameHeader};
use crate::snapshot::{ScanLimits, Snapshot};

/// flags + data_len + mtime ahead of the name in a FileResponse
const FILE_RESPONSE_OVERHEAD: usize = 16;

pub struct ServerNode {
    root: PathBuf,
    filter: FileFilter,
    limits: ScanLimits,
    rescan_cycle: u64,
    max_frame: usize,
    max_message: usize,
    snapshot: Option<Snapshot>,
    ticks: u64,
    logger: Arc<dyn Logger>,
}

impl ServerNode {
    pub fn new(config: &Config, logger: Arc<dyn Logger>) -> Self {
        Self {
            root: config.root.clone(),
            filter: config.filter.clone(),
            limits: config.scan_limits(),
            rescan_cycle: config.rescan_cycle.max(1),
            max_frame: config.max_frame_size,
            max_message: config.max_message_size,
            snapshot: None,
            ticks: 0,
            logger,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Current digest, for broadcasting or greeting a new peer
    pub fn digest_message(&self) -> Option<Message> {
        self.snapshot
            .as_ref()
            .map(|s| Message::MetaDigest(MetaDigest::of(s)))
    }

    /// Periodic tick: full rescan every `rescan_cycle` ticks (the first one
    /// included), a cheap re-stat otherwise. Returns the digest to broadcast.
    pub fn on_tick(&mut self) -> Option<Message> {
        if self.ticks % self.rescan_cycle == 0 {
            self.rescan();
        }
        self.ticks = self.ticks.wrapping_add(1);

        if let Some(snapshot) = self.snapshot.as_mut() {
            let removed = snapshot.refresh(&self.root, true);
            if removed > 0 {
                tracing::debug!("{} file(s) vanished since last scan", removed);
            }
        }
        self.digest_message()
    }

    fn rescan(&mut self) {
        match Snapshot::scan(&self.root, &self.filter, self.limits) {
            Ok(snapshot) => {
                if let Some(old) = &self.snapshot {
                    if old.digest() != snapshot.digest() {
                        tracing::info!(
                            "tree changed: {} -> {} files, digest 0x{:08x}",
                            old.len(),
                            snapshot.len(),
                            snapshot.digest()
                        );
                    }
                }
                self.snapshot = Some(snapshot);
            }
            Err(e) => {
                // keep serving the last good snapshot
                tracing::warn!("scan {} failed: {:#}", self.root.display(), e);
                self.logger.error("scan", &self.root.display().to_string(), &e.to_string());
            }
        }
    }

    /// Handle one complete frame from a client. `Ok(None)` means nothing to
    /// send back; `Err` means the connection should be closed.
    pub fn on_frame(
        &self,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<Option<Message>, ProtocolError> {
        let kind = match header.validate(self.max_frame) {
            Ok(kind) => kind,
            Err(ProtocolError::BadMagic(magic)) => {
                tracing::warn!("invalid msghead magic: 0x{:08x}, frame dropped", magic);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match kind {
            MessageType::MetaRequest | MessageType::FileRequest => {}
            other => {
                tracing::debug!("server ignores {:?}", other);
                return Ok(None);
            }
        }

        if !header.is_single() {
            return Err(ProtocolError::Segmented(kind));
        }
        if header.total_len as usize != payload.len() || header.frame_len() != payload.len() {
            return Err(ProtocolError::LengthMismatch {
                what: "request",
                declared: header.total_len as usize,
                actual: payload.len(),
            });
        }

        match Message::decode(kind, Bytes::copy_from_slice(payload))? {
            Message::MetaRequest => Ok(self.meta_response()),
            Message::FileRequest(req) => Ok(Some(Message::FileResponse(
                self.file_response(&req.name),
            ))),
            _ => Ok(None),
        }
    }

    fn meta_response(&self) -> Option<Message> {
        match &self.snapshot {
            Some(s) => {
                tracing::debug!("send meta response: {} files", s.len());
                Some(Message::MetaResponse(s.clone()))
            }
            None => {
                tracing::debug!("meta request before first scan, ignored");
                None
            }
        }
    }

    /// Build the answer to a FileRequest for `name`.
    pub fn file_response(&self, name: &str) -> FileResponse {
        let Some(entry) = self.snapshot.as_ref().and_then(|s| s.find(name)) else {
            tracing::info!("invalid filereq name: {}", name);
            return FileResponse::stale(name);
        };

        let mut res = FileResponse::stale(name);
        res.flags = FileResponseFlags::VALID;
        res.mtime = entry.mtime;

        let path = match normalize_under_root(&self.root, name) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("{}", e);
                return res;
            }
        };

        let budget = self
            .max_message
            .saturating_sub(FILE_RESPONSE_OVERHEAD + name.len() + 1);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.len() > budget as u64 => {
                tracing::warn!(
                    "{} is {} bytes, over the {} byte message cap",
                    name,
                    meta.len(),
                    self.max_message
                );
                self.logger.error("read", name, "file too large");
                return res;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::info!("file not exist name: {} ({})", name, e);
                return res;
            }
        }

        match std::fs::read(&path) {
            Ok(data) => {
                if data.len() > budget {
                    self.logger.error("read", name, "file grew past the message cap");
                    return res;
                }
                res.flags |= FileResponseFlags::EXISTS;
                res.mtime = file_mtime(&path).unwrap_or(entry.mtime);
                res.data = Bytes::from(data);
                tracing::debug!("send {} ({} bytes)", name, res.data.len());
            }
            Err(e) => {
                tracing::warn!("read {} failed: {}", path.display(), e);
                self.logger.error("read", name, &e.to_string());
            }
        }
        res
    }
}
