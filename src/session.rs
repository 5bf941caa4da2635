//! Client side of a sync cycle.
//!
//! One `ClientSession` per connection to a server. It is driven purely by
//! events (complete frames, ticks, connection loss) and answers with the
//! messages to send back, so the transport stays a dumb pipe.
//!
//! ```text
//! Idle --digest differs--> AwaitingMetadata --MetaResponse--> AwaitingFiles{n}
//!  ^                              |  (no fetches)                  | n == 0
//!  +------------------------------+--------------------------------+
//! ```

use bytes::Bytes;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::diff::{diff, Action};
use crate::error::{ProtocolError, SyncError, SyncResult};
use crate::logger::Logger;
use crate::message::{FileRequest, FileResponse, MetaDigest, Message};
use crate::protocol::{MessageType, DEFAULT_MAX_MESSAGE_SIZE, MAX_FRAME_SIZE};
use crate::protocol_core::{ensure_parent_exists, normalize_under_root, FrameHeader};
use crate::reassembly::SegmentAssembler;
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    AwaitingMetadata,
    AwaitingFiles { outstanding: u32 },
}

#[derive(Debug, Default)]
struct CycleStats {
    started: Option<Instant>,
    fetched: u64,
    deleted: u64,
}

pub struct ClientSession {
    root: PathBuf,
    state: SyncState,
    snapshot: Option<Snapshot>,
    assembler: SegmentAssembler,
    /// Names requested in the current cycle and not answered yet
    pending: BTreeSet<String>,
    /// Entries the server listed but could not send. They stay in the
    /// snapshot with the server's mtime and no local file.
    unavailable: BTreeSet<String>,
    max_frame: usize,
    logger: Arc<dyn Logger>,
    stats: CycleStats,
}

impl ClientSession {
    pub fn new(root: impl Into<PathBuf>, logger: Arc<dyn Logger>) -> Self {
        Self {
            root: root.into(),
            state: SyncState::Idle,
            snapshot: None,
            assembler: SegmentAssembler::new(DEFAULT_MAX_MESSAGE_SIZE),
            pending: BTreeSet::new(),
            unavailable: BTreeSet::new(),
            max_frame: MAX_FRAME_SIZE,
            logger,
            stats: CycleStats::default(),
        }
    }

    pub fn with_limits(mut self, max_frame: usize, max_message: usize) -> Self {
        self.max_frame = max_frame;
        self.assembler = SegmentAssembler::new(max_message);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Connection lost: drop any partial message and the rest of the cycle.
    /// Entries still waiting for a response leave the snapshot so the next
    /// digest comparison fails and the cycle is redone.
    pub fn on_close(&mut self) {
        self.assembler.reset();
        if !self.pending.is_empty() {
            tracing::info!(
                "connection lost with {} file(s) outstanding",
                self.pending.len()
            );
            if let Some(snapshot) = self.snapshot.as_mut() {
                for name in &self.pending {
                    snapshot.remove(name);
                }
            }
            self.pending.clear();
        }
        self.state = SyncState::Idle;
        self.stats = CycleStats::default();
    }

    /// Periodic tick. Only while idle: re-stat the local snapshot without
    /// taking new timestamps. Returns how many local files vanished;
    /// entries the server could not send are expected to be missing.
    pub fn on_tick(&mut self) -> usize {
        if self.state != SyncState::Idle {
            return 0;
        }
        let Some(snapshot) = self.snapshot.as_mut() else {
            return 0;
        };
        let unavailable = &self.unavailable;
        let removed = snapshot.refresh_with(&self.root, false, |n| unavailable.contains(n));
        if removed > 0 {
            tracing::info!(
                "{} local file(s) changed out of band, waiting for the next digest",
                removed
            );
        }
        removed
    }

    /// Handle one complete frame. `Err` means the stream is corrupt and the
    /// connection should be closed.
    pub fn on_frame(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<Vec<Message>, ProtocolError> {
        let kind = match header.validate(self.max_frame) {
            Ok(kind) => kind,
            Err(ProtocolError::BadMagic(magic)) => {
                tracing::warn!("invalid msghead magic: 0x{:08x}, frame dropped", magic);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        tracing::trace!("client state {:?} recv {:?}", self.state, kind);

        match (self.state, kind) {
            (SyncState::Idle, MessageType::MetaDigest) => {
                if !header.is_single() {
                    return Err(ProtocolError::Segmented(kind));
                }
                match Message::decode(kind, Bytes::copy_from_slice(payload))? {
                    Message::MetaDigest(md) => Ok(self.handle_digest(md)),
                    _ => Ok(Vec::new()),
                }
            }
            (SyncState::AwaitingMetadata, MessageType::MetaResponse) => {
                let Some(buf) = self.assembler.push(kind, header, payload)? else {
                    return Ok(Vec::new());
                };
                match Message::decode(kind, buf)? {
                    Message::MetaResponse(snapshot) => Ok(self.handle_meta_response(snapshot)),
                    _ => Ok(Vec::new()),
                }
            }
            (SyncState::AwaitingFiles { .. }, MessageType::FileResponse) => {
                let Some(buf) = self.assembler.push(kind, header, payload)? else {
                    return Ok(Vec::new());
                };
                if let Message::FileResponse(res) = Message::decode(kind, buf)? {
                    self.handle_file_response(res);
                }
                Ok(Vec::new())
            }
            (state, kind) => {
                tracing::debug!("{:?} not expected in {:?}, ignored", kind, state);
                Ok(Vec::new())
            }
        }
    }

    fn handle_digest(&mut self, md: MetaDigest) -> Vec<Message> {
        match &self.snapshot {
            None => tracing::info!("no local snapshot, requesting metadata"),
            Some(s) if s.digest() != md.digest || s.len() != md.file_count as usize => {
                if s.digest() != md.digest {
                    tracing::info!(
                        "crc changed, need update file (0x{:08x} --> 0x{:08x})",
                        s.digest(),
                        md.digest
                    );
                }
                if s.len() != md.file_count as usize {
                    tracing::info!(
                        "file number changed, need update file ({} --> {})",
                        s.len(),
                        md.file_count
                    );
                }
            }
            Some(_) => return Vec::new(),
        }

        self.state = SyncState::AwaitingMetadata;
        self.stats = CycleStats {
            started: Some(Instant::now()),
            ..CycleStats::default()
        };
        vec![Message::MetaRequest]
    }

    fn handle_meta_response(&mut self, new: Snapshot) -> Vec<Message> {
        tracing::info!(
            "old n_file[{}] ---> new n_file[{}]",
            self.snapshot.as_ref().map_or(0, Snapshot::len),
            new.len()
        );

        let mut requests = Vec::new();
        for action in diff(self.snapshot.as_ref(), &new) {
            match action {
                Action::Delete(name) => self.remove_local(&name),
                Action::Fetch(entry) => {
                    self.pending.insert(entry.name.clone());
                    requests.push(Message::FileRequest(FileRequest { name: entry.name }));
                }
            }
        }
        self.unavailable.retain(|n| new.find(n).is_some());
        self.snapshot = Some(new);

        if requests.is_empty() {
            self.finish_cycle();
        } else {
            self.state = SyncState::AwaitingFiles {
                outstanding: requests.len() as u32,
            };
        }
        requests
    }

    fn handle_file_response(&mut self, res: FileResponse) {
        let SyncState::AwaitingFiles { outstanding } = self.state else {
            return;
        };
        let outstanding = outstanding.saturating_sub(1);
        self.state = SyncState::AwaitingFiles { outstanding };

        if !self.pending.remove(&res.name) {
            tracing::warn!("unsolicited file response for {}", res.name);
        } else if res.is_present() {
            match self.save_file(&res) {
                Ok(()) => {
                    self.unavailable.remove(&res.name);
                    if let Some(s) = self.snapshot.as_mut() {
                        s.set_mtime(&res.name, res.mtime);
                    }
                    self.stats.fetched += 1;
                    self.logger.fetched(&res.name, res.data.len() as u64);
                }
                Err(e) => {
                    tracing::warn!("save {} failed: {}", res.name, e);
                    self.logger.error("save", &res.name, &e.to_string());
                    // Forget it so the next digest retries the fetch
                    self.unavailable.remove(&res.name);
                    if let Some(s) = self.snapshot.as_mut() {
                        s.remove(&res.name);
                    }
                }
            }
        } else {
            if res.flags.is_empty() {
                tracing::info!("invalid filereq name: {}", res.name);
            } else {
                tracing::info!("file not exist name: {}", res.name);
            }
            // The entry stays so the local digest keeps matching the server's
            self.remove_local(&res.name);
            self.unavailable.insert(res.name);
        }

        if outstanding == 0 {
            self.finish_cycle();
        }
    }

    fn save_file(&self, res: &FileResponse) -> SyncResult<()> {
        let path = normalize_under_root(&self.root, &res.name)?;
        ensure_parent_exists(&path)?;
        std::fs::write(&path, &res.data).map_err(|e| SyncError::fs(&path, e))?;
        let ft = filetime::FileTime::from_unix_time(res.mtime, 0);
        if let Err(e) = filetime::set_file_mtime(&path, ft) {
            tracing::debug!("set mtime on {}: {}", path.display(), e);
        }
        tracing::debug!("saved {} ({} bytes)", res.name, res.data.len());
        Ok(())
    }

    fn remove_local(&mut self, name: &str) {
        let path = match normalize_under_root(&self.root, name) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("refusing to delete {}: {}", name, e);
                return;
            }
        };
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!("remove {}", path.display());
                self.stats.deleted += 1;
                self.logger.deleted(name);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!("remove {} failed: {}", path.display(), e);
                self.logger.error("delete", name, &e.to_string());
            }
        }
    }

    fn finish_cycle(&mut self) {
        let seconds = self
            .stats
            .started
            .map_or(0.0, |t| t.elapsed().as_secs_f64());
        tracing::info!(
            "sync cycle done: {} fetched, {} deleted in {:.3}s",
            self.stats.fetched,
            self.stats.deleted,
            seconds
        );
        self.logger
            .cycle_done(self.stats.fetched, self.stats.deleted, seconds);
        self.stats = CycleStats::default();
        self.pending.clear();
        self.state = SyncState::Idle;
    }
}
