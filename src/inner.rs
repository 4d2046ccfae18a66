//! Shared multiplexer state: the channel table, ID allocation, the write
//! path, and the reader loop's per-frame dispatch.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::channel::{Channel, ChannelShared};
use crate::config::{ACCEPT_QUEUE_CAPACITY, DEFAULT_WINDOW_MAX};
use crate::destination::Destination;
use crate::dupe::Dupe;
use crate::error::{Error, Result};
use crate::event_ring::{EventKind, EventRing};
use crate::frame::{read_frame, ConnectionKind, Frame};
use crate::locked_writer::LockedWriter;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Which half of the 32-bit ID space this side allocates from. The two
/// peers of a connection pick opposite directions during construction so
/// that, barring a misbehaving peer, `Open` frames never collide
/// (spec.md 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdAllocation {
    Forward,
    Backward,
}

struct Metadata {
    channels: HashMap<u32, Arc<ChannelShared>>,
    next_id: u32,
    direction: IdAllocation,
}

impl Metadata {
    /// Linear-probe from `next_id` in `direction` until a free ID is
    /// found, or the whole space has been tried once.
    fn allocate_id(&mut self) -> Option<u32> {
        let start = self.next_id;
        loop {
            let candidate = self.next_id;
            self.next_id = match self.direction {
                IdAllocation::Forward => candidate.wrapping_add(1),
                IdAllocation::Backward => candidate.wrapping_sub(1),
            };
            if !self.channels.contains_key(&candidate) {
                return Some(candidate);
            }
            if self.next_id == start {
                return None;
            }
        }
    }
}

/// State shared between every [`Channel`] handle and the one reader task,
/// for a single multiplexed connection.
pub struct Shared<T> {
    label: String,
    write: LockedWriter<WriteHalf<T>>,
    metadata: Mutex<Metadata>,
    events: Mutex<EventRing>,
    running: AtomicBool,
    /// `None` once the multiplexer has been torn down: further `Open`
    /// frames from the peer are refused rather than queued forever.
    accept_tx: Mutex<Option<mpsc::Sender<Channel<T>>>>,
}

impl<T> Shared<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        label: String,
        write_half: WriteHalf<T>,
        direction: IdAllocation,
    ) -> (Arc<Self>, mpsc::Receiver<Channel<T>>) {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let next_id = match direction {
            IdAllocation::Forward => 0,
            IdAllocation::Backward => u32::MAX,
        };
        let shared = Arc::new(Self {
            label,
            write: LockedWriter::new(write_half),
            metadata: Mutex::new(Metadata {
                channels: HashMap::new(),
                next_id,
                direction,
            }),
            events: Mutex::new(EventRing::new()),
            // spec.md 4.5 construction step 4: "Set `running = false`;
            // only `Run()` flips it to true". `Dial`/`Accept` must refuse
            // until `Shared::start` is called.
            running: AtomicBool::new(false),
            accept_tx: Mutex::new(Some(accept_tx)),
        });
        (shared, accept_rx)
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flip `running` to `true`. Called exactly once, by
    /// [`Multiplexer::run`](crate::Multiplexer::run), before the reader
    /// loop starts (spec.md 4.5 construction step 4).
    pub(crate) fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub(crate) fn record_event(&self, channel_id: u32, kind: EventKind) {
        self.events.lock().push(channel_id, kind);
    }

    pub(crate) fn remove_channel_from_table(&self, id: u32) {
        self.metadata.lock().channels.remove(&id);
    }

    /// Encode and send one frame, recording it in the event ring first so
    /// the ring reflects send order even if the write itself races with
    /// another sender for the write mutex.
    pub(crate) async fn send_frame(&self, channel_id: u32, frame: &Frame) -> Result<()> {
        self.record_event(channel_id, EventKind::Sent(frame.command()));
        self.write.send_frame(channel_id, frame).await
    }

    fn accept_sender(&self) -> Option<mpsc::Sender<Channel<T>>> {
        self.accept_tx.lock().as_ref().map(Dupe::dupe)
    }

    /// Allocate a channel ID, register it, and send the `Open` frame.
    pub(crate) async fn dial(self: &Arc<Self>, destination: Destination) -> Result<Channel<T>> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let shared = {
            let mut meta = self.metadata.lock();
            let id = meta.allocate_id().ok_or(Error::ChannelSpaceExhausted)?;
            let shared =
                ChannelShared::new(id, destination.clone(), DEFAULT_WINDOW_MAX, DEFAULT_WINDOW_MAX);
            meta.channels.insert(id, shared.dupe());
            shared
        };
        self.record_event(shared.id, EventKind::Opened);
        self.send_frame(
            shared.id,
            &Frame::Open {
                kind: ConnectionKind::Multiplexed,
                destination,
            },
        )
        .await?;
        let channel = Channel::new(shared.dupe(), self.dupe());
        channel.send_initial_window().await?;
        debug!(channel = shared.id, "dialed");
        Ok(channel)
    }

    /// Tear down local state: stop accepting/dialing, stop queueing new
    /// `Open`s, and force every still-open channel closed so blocked
    /// readers see EOF and blocked writers see [`Error::Closed`].
    pub(crate) fn teardown(&self) {
        self.running.store(false, Ordering::Release);
        self.accept_tx.lock().take();
        let channels: Vec<_> = self.metadata.lock().channels.drain().collect();
        let count = channels.len();
        for (id, shared) in channels {
            shared.read_pipe.close_write();
            shared.recv_close();
            self.record_event(id, EventKind::Closed);
        }
        debug!(forced_closed = count, "multiplexer torn down");
    }

    /// Local, voluntary shutdown: tear down state and signal the peer by
    /// shutting down the write half.
    pub(crate) async fn close(&self) -> Result<()> {
        self.teardown();
        self.write.shutdown().await
    }

    pub(crate) fn dump_state(&self) -> String {
        let mut out = String::new();
        {
            let events = self.events.lock();
            let _ = events.dump(&mut out);
        }
        {
            let meta = self.metadata.lock();
            let _ = writeln!(
                out,
                "multiplexer {}: {} open channel(s)",
                self.label,
                meta.channels.len()
            );
            for (id, shared) in meta.channels.iter() {
                let _ = writeln!(out, "  channel {id:#010x} -> {}", shared.destination);
            }
        }
        out
    }

    fn lookup(&self, channel_id: u32) -> Option<Arc<ChannelShared>> {
        self.metadata.lock().channels.get(&channel_id).map(Dupe::dupe)
    }

    /// Drive the reader half until the transport reaches a clean EOF (the
    /// expected termination, spec.md 7.2) or a fatal decode/protocol
    /// error occurs.
    pub(crate) async fn run_reader_loop<R>(self: &Arc<Self>, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let (channel_id, frame) = match read_frame(&mut reader).await {
                Ok(v) => v,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("transport closed by peer");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "reader loop exiting on fatal error");
                    return Err(e);
                }
            };
            self.record_event(channel_id, EventKind::Received(frame.command()));
            self.dispatch_frame(channel_id, frame).await?;
        }
    }

    async fn dispatch_frame(self: &Arc<Self>, channel_id: u32, frame: Frame) -> Result<()> {
        match frame {
            Frame::Open { kind, destination } => {
                self.handle_open(channel_id, kind, destination).await
            }
            Frame::Close => self.handle_close(channel_id),
            Frame::Shutdown => self.handle_shutdown(channel_id),
            Frame::Data(payload) => self.handle_data(channel_id, payload),
            Frame::Window { seq } => self.handle_window(channel_id, seq),
        }
    }

    async fn handle_open(
        self: &Arc<Self>,
        channel_id: u32,
        kind: ConnectionKind,
        destination: Destination,
    ) -> Result<()> {
        if kind != ConnectionKind::Multiplexed {
            warn!(channel = channel_id, "peer requested a Dedicated connection");
            return Err(Error::DedicatedUnsupported);
        }
        let shared = {
            let mut meta = self.metadata.lock();
            if meta.channels.contains_key(&channel_id) {
                return Err(Error::DuplicateChannel(channel_id));
            }
            let shared = ChannelShared::new(
                channel_id,
                destination,
                DEFAULT_WINDOW_MAX,
                DEFAULT_WINDOW_MAX,
            );
            meta.channels.insert(channel_id, shared.dupe());
            shared
        };
        self.record_event(channel_id, EventKind::Opened);
        let channel = Channel::new(shared.dupe(), self.dupe());
        match self.accept_sender() {
            Some(tx) => {
                if let Err(mpsc::error::SendError(channel)) = tx.send(channel).await {
                    warn!(channel = channel_id, "acceptor gone; closing immediately");
                    channel.close().await?;
                }
            }
            None => {
                warn!(channel = channel_id, "not accepting; closing immediately");
                channel.close().await?;
            }
        }
        Ok(())
    }

    fn handle_close(&self, channel_id: u32) -> Result<()> {
        let shared = self.lookup(channel_id).ok_or(Error::UnknownChannel(channel_id))?;
        // `Close` promises no further frames on this channel at all, so
        // unblock a pending `read` the same way a `Shutdown` would.
        shared.read_pipe.close_write();
        shared.recv_close();
        self.finish_remote_close(&shared);
        Ok(())
    }

    fn handle_shutdown(&self, channel_id: u32) -> Result<()> {
        let shared = self.lookup(channel_id).ok_or(Error::UnknownChannel(channel_id))?;
        shared.read_pipe.close_write();
        Ok(())
    }

    /// `Data` arriving for a channel whose read side we already closed
    /// locally is discarded, not fatal (spec.md 4.5) — the peer may not
    /// yet know we stopped reading.
    fn handle_data(&self, channel_id: u32, payload: Bytes) -> Result<()> {
        let shared = self.lookup(channel_id).ok_or(Error::UnknownChannel(channel_id))?;
        if shared.read_pipe.write(&payload).is_err() {
            trace!(channel = channel_id, "discarding Data after local close");
        }
        Ok(())
    }

    fn handle_window(&self, channel_id: u32, seq: u64) -> Result<()> {
        let shared = self.lookup(channel_id).ok_or(Error::UnknownChannel(channel_id))?;
        shared.recv_window_update(seq);
        Ok(())
    }
}
