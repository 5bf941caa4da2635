//! Async (Tokio) transport for treesync nodes.
//!
//! Each connection gets a reader task that turns the byte stream into
//! frames and a writer task that drains a bounded queue of encoded
//! messages. Both feed a single event task per node which owns all sync
//! state, so the snapshot, the session and the reassembler need no locks.

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant, Interval, MissedTickBehavior};

use crate::error::{SyncError, SyncResult};
use crate::message::Message;
use crate::protocol::timeouts::{write_deadline_ms, FIRST_TICK_MS};
use crate::protocol::HEADER_LEN;
use crate::protocol_core::{parse_frame_header, validate_frame_size, FrameHeader};

/// Encoded messages waiting for the socket, per connection
pub const WRITE_QUEUE_DEPTH: usize = 64;
/// Frames and closes waiting for the event task, per node
pub const EVENT_QUEUE_DEPTH: usize = 256;

/// What reader and writer tasks report to the node's event task.
#[derive(Debug)]
pub enum NodeEvent<K> {
    Frame {
        id: K,
        header: FrameHeader,
        payload: Bytes,
        /// Write-queue slot held for the answer, when the node replies
        /// to requests
        reply: Option<OwnedPermit<Bytes>>,
    },
    Closed {
        id: K,
        reason: String,
    },
}

fn timed_out(what: &str, ms: u64) -> SyncError {
    SyncError::Transport(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{} timeout ({} ms)", what, ms),
    ))
}

#[inline]
async fn read_exact_timed<R>(stream: &mut R, buf: &mut [u8], ms: u64) -> SyncResult<()>
where
    R: AsyncRead + Unpin,
{
    match timeout(Duration::from_millis(ms), stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(timed_out("read", ms)),
    }
}

#[inline]
async fn write_all_timed<W>(stream: &mut W, buf: &[u8], ms: u64) -> SyncResult<()>
where
    W: AsyncWrite + Unpin,
{
    match timeout(Duration::from_millis(ms), stream.write_all(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(timed_out("write", ms)),
    }
}

/// Read one frame. Waits indefinitely for the header (idle peers are
/// fine) but the payload must follow within its deadline. Only the frame
/// size is checked here; the event task validates the rest.
pub async fn read_frame<R>(stream: &mut R, max_frame: usize) -> SyncResult<(FrameHeader, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; HEADER_LEN];
    stream.read_exact(&mut hdr).await?;
    let header = parse_frame_header(&hdr);
    validate_frame_size(header.frame_len(), max_frame)?;

    let mut payload = vec![0u8; header.frame_len()];
    if !payload.is_empty() {
        let ms = write_deadline_ms(payload.len());
        read_exact_timed(stream, &mut payload, ms).await?;
    }
    Ok((header, Bytes::from(payload)))
}

/// Encode several messages back to back. Each message stays contiguous, so
/// frames of different messages never interleave on the wire.
pub fn encode_batch(messages: &[Message], max_frame: usize) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    for msg in messages {
        buf.extend_from_slice(&msg.to_wire(max_frame)?);
    }
    Ok(buf.freeze())
}

fn first_tick_interval(period: Duration) -> Interval {
    let mut ticker =
        tokio::time::interval_at(Instant::now() + Duration::from_millis(FIRST_TICK_MS), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Run filesystem work from the event task. On a multi-threaded runtime
/// the worker hands its other tasks off first; a current-thread runtime has
/// nowhere to move them, so the work just runs inline.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(h) if h.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn describe(e: &SyncError) -> String {
    match e {
        SyncError::Transport(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            "peer closed".to_string()
        }
        _ => e.to_string(),
    }
}

/// Socket tasks of one connection. Dropping it tears both down.
struct Peer {
    addr: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Peer {
    /// With `reserve_replies`, the reader takes a write-queue slot before
    /// forwarding each frame, which throttles a peer that pipelines more
    /// requests than it drains answers.
    fn spawn<K>(
        id: K,
        stream: TcpStream,
        max_frame: usize,
        events: mpsc::Sender<NodeEvent<K>>,
        reserve_replies: bool,
    ) -> Result<Self>
    where
        K: Copy + Send + 'static,
    {
        let addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let (mut rd, mut wr) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);

        let writer_events = events.clone();
        let writer = tokio::spawn(async move {
            while let Some(buf) = rx.recv().await {
                if let Err(e) = write_all_timed(&mut wr, &buf, write_deadline_ms(buf.len())).await {
                    let _ = writer_events
                        .send(NodeEvent::Closed {
                            id,
                            reason: describe(&e),
                        })
                        .await;
                    return;
                }
            }
            let _ = wr.shutdown().await;
        });

        let reply_tx = reserve_replies.then(|| tx.clone());
        let reader = tokio::spawn(async move {
            loop {
                let (header, payload) = match read_frame(&mut rd, max_frame).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = events
                            .send(NodeEvent::Closed {
                                id,
                                reason: describe(&e),
                            })
                            .await;
                        return;
                    }
                };
                let reply = match &reply_tx {
                    Some(tx) => match tx.clone().reserve_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                    None => None,
                };
                let ev = NodeEvent::Frame {
                    id,
                    header,
                    payload,
                    reply,
                };
                if events.send(ev).await.is_err() {
                    return;
                }
            }
        });

        Ok(Self {
            addr,
            tx,
            reader,
            writer,
        })
    }

    /// Queue an encoded message without waiting. Fails if the queue is full
    /// or the writer is gone.
    fn try_send(&self, buf: Bytes) -> Result<(), mpsc::error::TrySendError<Bytes>> {
        self.tx.try_send(buf)
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Server connection slot handle. The generation changes every time a slot
/// is reused, so events from an old connection can't reach a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub slot: usize,
    pub generation: u64,
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.slot, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    conn: Option<T>,
}

/// Fixed-capacity slab of live connections.
#[derive(Debug)]
pub struct ConnectionTable<T> {
    slots: Vec<Slot<T>>,
    live: usize,
}

impl<T> ConnectionTable<T> {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                conn: None,
            })
            .collect();
        Self { slots, live: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Claim a free slot and fill it with what `make` builds for that id.
    /// `Ok(None)` when the table is full; `make` errors leave it unchanged.
    pub fn insert_with<E>(
        &mut self,
        make: impl FnOnce(ConnId) -> std::result::Result<T, E>,
    ) -> std::result::Result<Option<ConnId>, E> {
        let Some(slot) = self.slots.iter().position(|s| s.conn.is_none()) else {
            return Ok(None);
        };
        let generation = self.slots[slot].generation.wrapping_add(1);
        let id = ConnId { slot, generation };
        let conn = make(id)?;
        self.slots[slot] = Slot {
            generation,
            conn: Some(conn),
        };
        self.live += 1;
        Ok(Some(id))
    }

    pub fn get(&self, id: ConnId) -> Option<&T> {
        self.slots
            .get(id.slot)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.conn.as_ref())
    }

    pub fn remove(&mut self, id: ConnId) -> Option<T> {
        let slot = self.slots.get_mut(id.slot)?;
        if slot.generation != id.generation {
            return None;
        }
        let conn = slot.conn.take();
        if conn.is_some() {
            self.live -= 1;
        }
        conn
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &T)> {
        self.slots.iter().enumerate().filter_map(|(slot, s)| {
            s.conn.as_ref().map(|c| {
                (
                    ConnId {
                        slot,
                        generation: s.generation,
                    },
                    c,
                )
            })
        })
    }
}

pub mod server {
    use super::*;
    use crate::config::Config;
    use crate::logger::Logger;
    use crate::server::ServerNode;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    pub async fn serve(config: Config, logger: Arc<dyn Logger>) -> Result<()> {
        let bind = config.bind_addr();
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("bind {}", bind))?;
        serve_listener(listener, config, logger).await
    }

    /// Run the server event loop on an already bound listener. Only returns
    /// on an unrecoverable error.
    pub async fn serve_listener(
        listener: TcpListener,
        config: Config,
        logger: Arc<dyn Logger>,
    ) -> Result<()> {
        config.validate()?;
        tracing::info!(
            "treesync server listening on {} root={}",
            listener.local_addr()?,
            config.root.display()
        );

        let max_frame = config.max_frame_size;
        let mut node = ServerNode::new(&config, logger.clone());
        let mut conns: ConnectionTable<Peer> = ConnectionTable::new(config.max_connections);
        let (events_tx, mut events) = mpsc::channel::<NodeEvent<ConnId>>(EVENT_QUEUE_DEPTH);
        let mut ticker = first_tick_interval(config.tick_interval());

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(x) => x,
                        Err(e) => {
                            tracing::warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    let spawned = conns.insert_with(|id| {
                        Peer::spawn(id, stream, max_frame, events_tx.clone(), true)
                    });
                    let id = match spawned {
                        Ok(Some(id)) => id,
                        Ok(None) => {
                            tracing::warn!(
                                "refusing {}: all {} connection slots in use",
                                addr,
                                conns.capacity()
                            );
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!("setup {} failed: {:#}", addr, e);
                            continue;
                        }
                    };
                    tracing::info!("conn {} from {} ({}/{})", id, addr, conns.len(), conns.capacity());
                    logger.start(&config.root, &addr.to_string());
                    if let Some(msg) = node.digest_message() {
                        push(&mut conns, id, &msg, max_frame);
                    }
                }
                Some(ev) = events.recv() => match ev {
                    NodeEvent::Frame { id, header, payload, reply } => {
                        if conns.get(id).is_none() {
                            continue;
                        }
                        match blocking(|| node.on_frame(&header, &payload)) {
                            Ok(Some(msg)) => match (msg.to_wire(max_frame), reply) {
                                (Ok(buf), Some(permit)) => {
                                    permit.send(buf);
                                }
                                (Ok(_), None) => push(&mut conns, id, &msg, max_frame),
                                (Err(e), _) => tracing::warn!("encode {:?} failed: {}", msg.kind(), e),
                            },
                            Ok(None) => {}
                            Err(e) => {
                                if let Some(peer) = conns.remove(id) {
                                    tracing::warn!("closing {} ({}): {}", id, peer.addr, e);
                                }
                            }
                        }
                    }
                    NodeEvent::Closed { id, reason } => {
                        if let Some(peer) = conns.remove(id) {
                            tracing::info!("conn {} ({}) closed: {}", id, peer.addr, reason);
                        }
                    }
                },
                _ = ticker.tick() => {
                    if let Some(msg) = blocking(|| node.on_tick()) {
                        broadcast(&mut conns, &msg, max_frame);
                    }
                }
            }
        }
    }

    /// Unsolicited message to one peer; a full queue closes it.
    fn push(conns: &mut ConnectionTable<Peer>, id: ConnId, msg: &Message, max_frame: usize) {
        let buf = match msg.to_wire(max_frame) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!("encode {:?} failed: {}", msg.kind(), e);
                return;
            }
        };
        if let Some(peer) = conns.get(id) {
            if peer.try_send(buf).is_err() {
                tracing::warn!("closing {} ({}): write queue full", id, peer.addr);
                conns.remove(id);
            }
        }
    }

    /// Digest to every peer. A peer whose queue is full is still busy
    /// with answers and simply misses this tick; a dead writer is dropped.
    fn broadcast(conns: &mut ConnectionTable<Peer>, msg: &Message, max_frame: usize) {
        let buf = match msg.to_wire(max_frame) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!("encode {:?} failed: {}", msg.kind(), e);
                return;
            }
        };
        let mut dead = Vec::new();
        for (id, peer) in conns.iter() {
            match peer.try_send(buf.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("{} busy, digest skipped", id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }
        for id in dead {
            conns.remove(id);
        }
    }
}

pub mod client {
    use super::*;
    use crate::config::Config;
    use crate::logger::Logger;
    use crate::protocol::timeouts::{reconnect_delay_ms, CONNECT_MS};
    use crate::session::ClientSession;
    use std::sync::Arc;

    pub async fn connect(addr: &str) -> Result<TcpStream> {
        match timeout(Duration::from_millis(CONNECT_MS), TcpStream::connect(addr)).await {
            Ok(res) => res.with_context(|| format!("connect {}", addr)),
            Err(_) => anyhow::bail!("connect {} timed out ({} ms)", addr, CONNECT_MS),
        }
    }

    /// Mirror the server at `address` into `config.root` until the task is
    /// dropped. Connection loss resets the cycle and reconnects with backoff.
    pub async fn run(config: Config, address: &str, logger: Arc<dyn Logger>) -> Result<()> {
        config.validate()?;
        std::fs::create_dir_all(&config.root)
            .with_context(|| format!("create {}", config.root.display()))?;
        let addr = config.server_addr(address);
        let mut session = ClientSession::new(&config.root, logger.clone())
            .with_limits(config.max_frame_size, config.max_message_size);

        let mut attempt: u32 = 0;
        loop {
            match connect(&addr).await {
                Ok(stream) => {
                    attempt = 0;
                    tracing::info!("connected to {}", addr);
                    logger.start(&config.root, &addr);
                    let reason = run_connection(stream, &mut session, &config).await;
                    session.on_close();
                    tracing::warn!("connection to {} closed: {}", addr, reason);
                }
                Err(e) => tracing::warn!("{:#}", e),
            }
            let delay = reconnect_delay_ms(attempt);
            attempt = attempt.saturating_add(1);
            tracing::debug!("reconnecting in {} ms", delay);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Drive one connection until it fails; returns why.
    async fn run_connection(stream: TcpStream, session: &mut ClientSession, config: &Config) -> String {
        let max_frame = config.max_frame_size;
        let (events_tx, mut events) = mpsc::channel::<NodeEvent<()>>(EVENT_QUEUE_DEPTH);
        let peer = match Peer::spawn((), stream, max_frame, events_tx, false) {
            Ok(p) => p,
            Err(e) => return format!("{:#}", e),
        };
        let mut ticker = first_tick_interval(config.tick_interval());

        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(NodeEvent::Frame { header, payload, .. }) => {
                        let replies = match session.on_frame(&header, &payload) {
                            Ok(replies) => replies,
                            Err(e) => return format!("protocol error: {}", e),
                        };
                        if replies.is_empty() {
                            continue;
                        }
                        let buf = match encode_batch(&replies, max_frame) {
                            Ok(buf) => buf,
                            Err(e) => return format!("encode failed: {:#}", e),
                        };
                        if peer.try_send(buf).is_err() {
                            return "write queue full".to_string();
                        }
                    }
                    Some(NodeEvent::Closed { reason, .. }) => return reason,
                    None => return "event channel closed".to_string(),
                },
                _ = ticker.tick() => {
                    session.on_tick();
                }
            }
        }
    }
}
