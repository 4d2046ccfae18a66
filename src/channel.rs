//! A bidirectional, flow-controlled sub-connection.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::destination::Destination;
use crate::error::{Error, Result};
use crate::event_ring::EventKind;
use crate::frame::Frame;
use crate::inner::Shared;
use crate::pipe::BufferedPipe;
use crate::window::WindowState;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::trace;

/// Everything about a channel that both the reader task and the
/// application-facing [`Channel`] handle need to see and mutate. Lives in
/// the multiplexer's channel table for as long as `ref_count > 0`
/// (spec.md section 3 invariants), independent of how many `Arc` clones
/// Rust itself is holding.
pub(crate) struct ChannelShared {
    pub id: u32,
    pub destination: Destination,
    state: Mutex<ChannelState>,
    /// Broadcasts on window update, close receipt, local close, shutdown,
    /// and deadline changes — the condvar `spec.md` section 5 asks for.
    /// `notify_waiters` (not `notify_one`) because `spec.md` 4.4 explicitly
    /// allows multiple concurrent writers blocked on the same channel.
    notify: Notify,
    pub read_pipe: BufferedPipe,
    /// Starts at 2 (spec.md section 3): one ref for "we sent Close", one
    /// for "we received Close". Reaches 0 exactly when both have happened.
    ref_count: AtomicU8,
}

struct ChannelState {
    read_window: WindowState,
    write_window: WindowState,
    close_received: bool,
    close_sent: bool,
    shutdown_sent: bool,
    write_deadline: Option<Instant>,
}

impl ChannelShared {
    pub fn new(id: u32, destination: Destination, read_max: u64, write_max: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            destination,
            state: Mutex::new(ChannelState {
                read_window: WindowState::new(read_max),
                write_window: WindowState::pending(write_max),
                close_received: false,
                close_sent: false,
                shutdown_sent: false,
                write_deadline: None,
            }),
            notify: Notify::new(),
            read_pipe: BufferedPipe::new(),
            ref_count: AtomicU8::new(2),
        })
    }

    /// A received `Window` frame: set the peer's advertised absolute
    /// credit and wake anyone blocked on write-window space.
    pub fn recv_window_update(&self, seq: u64) {
        self.state.lock().write_window.set_allowed(seq);
        self.notify.notify_waiters();
    }

    /// A received `Close` frame (the flag half; ref-count bookkeeping is
    /// the caller's job — see [`Shared::finish_local_close`] /
    /// [`Shared::finish_remote_close`]).
    pub fn recv_close(&self) {
        self.state.lock().close_received = true;
        self.notify.notify_waiters();
    }

    /// Decrement the protocol-level ref count. Returns the new value.
    pub fn dec_ref(&self) -> u8 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    fn is_fully_closed(state: &ChannelState) -> bool {
        state.close_sent || state.close_received || state.shutdown_sent
    }
}

/// A flow-controlled, bidirectional, in-order sub-connection, identified by
/// a 32-bit ID within one [`Multiplexer`](crate::Multiplexer).
pub struct Channel<T> {
    pub(crate) shared: Arc<ChannelShared>,
    pub(crate) mux: Arc<Shared<T>>,
}

impl<T> Channel<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(shared: Arc<ChannelShared>, mux: Arc<Shared<T>>) -> Self {
        Self { shared, mux }
    }

    /// The channel ID, unique within the owning multiplexer.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Emit the initial `Window` frame granting the peer our read-side
    /// credit (spec.md 4.5: `Dial` and `Accept` both "emit initial
    /// Window" before handing the channel back to the caller). The
    /// peer's matching write-side window starts at
    /// [`WindowState::pending`] and cannot send a single `Data` byte
    /// until this arrives.
    pub(crate) async fn send_initial_window(&self) -> Result<()> {
        let seq = self.shared.state.lock().read_window.advance();
        self.mux
            .send_frame(self.shared.id, &Frame::Window { seq })
            .await
    }

    /// The endpoint this channel targets, as advertised in its `Open`
    /// frame.
    pub fn remote_addr(&self) -> &Destination {
        &self.shared.destination
    }

    /// The multiplexer's own label (diagnostic only).
    pub fn local_addr(&self) -> &str {
        self.mux.label()
    }

    /// Block until some bytes are available, the channel's read side is
    /// closed (returns `Ok(0)`), or the read deadline elapses.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.shared.read_pipe.read(buf).await?;
        if n == 0 {
            return Ok(0);
        }
        let seq_to_send = {
            let mut st = self.shared.state.lock();
            st.read_window.consume(n as u64);
            if st.read_window.almost_closed() {
                Some(st.read_window.advance())
            } else {
                None
            }
        };
        if let Some(seq) = seq_to_send {
            trace!(channel = self.shared.id, seq, "sending Window");
            self.mux
                .send_frame(self.shared.id, &Frame::Window { seq })
                .await?;
        }
        Ok(n)
    }

    /// Write as much of `buf` as the peer's current credit allows, waiting
    /// for fresh credit (a `Window` frame) when exhausted. Returns once
    /// all of `buf` has been transmitted, or an error (including a timeout
    /// with the partial byte count) if it cannot be.
    pub async fn write(&self, mut buf: &[u8]) -> Result<usize> {
        let mut written = 0usize;
        loop {
            if buf.is_empty() {
                return Ok(written);
            }
            // Re-lock and re-check each iteration rather than holding a
            // `Notified` across the match below — keeps the borrow of
            // `self.shared.state` strictly scoped to the sync critical
            // section per call.
            let reserved = {
                let mut st = self.shared.state.lock();
                if ChannelShared::is_fully_closed(&st) {
                    return Err(Error::Closed);
                }
                let avail = st.write_window.size();
                if avail == 0 {
                    None
                } else {
                    let n = (avail as usize).min(buf.len());
                    st.write_window.consume(n as u64);
                    Some(n)
                }
            };
            let n = match reserved {
                Some(n) => n,
                None => {
                    // Wait for a Window update, Close, Shutdown, or deadline.
                    let deadline = self.shared.state.lock().write_deadline;
                    match deadline {
                        Some(d) => {
                            let now = Instant::now();
                            if now >= d {
                                return Err(Error::Timeout { written });
                            }
                            if tokio::time::timeout(d - now, self.shared.notify.notified())
                                .await
                                .is_err()
                            {
                                return Err(Error::Timeout { written });
                            }
                        }
                        None => self.shared.notify.notified().await,
                    }
                    continue;
                }
            };
            let (chunk, rest) = buf.split_at(n);
            self.mux
                .send_frame(self.shared.id, &Frame::Data(Bytes::copy_from_slice(chunk)))
                .await?;
            written += n;
            buf = rest;
        }
    }

    /// Idempotent. Marks the channel fully closed, emits one `Close` frame
    /// on the first call, and decrements the protocol ref count.
    pub async fn close(&self) -> Result<()> {
        let should_send = {
            let mut st = self.shared.state.lock();
            if st.close_sent {
                false
            } else {
                st.close_sent = true;
                true
            }
        };
        self.shared.notify.notify_waiters();
        if should_send {
            self.shared.read_pipe.close_write();
            // Once teardown has dropped this channel from the table, the
            // ID is no longer ours to speak for; emitting a frame for it
            // would violate spec.md 3's "no frame on an untracked ID".
            if self.mux.is_running() {
                self.mux.send_frame(self.shared.id, &Frame::Close).await?;
            }
            self.mux.finish_local_close(&self.shared).await;
        }
        Ok(())
    }

    /// Idempotent; no-op if already closed or shut down. Half-closes the
    /// write side: emits one `Shutdown` frame, after which `write` returns
    /// `Err(Error::Closed)`.
    pub async fn close_write(&self) -> Result<()> {
        let should_send = {
            let mut st = self.shared.state.lock();
            if st.shutdown_sent || st.close_sent {
                false
            } else {
                st.shutdown_sent = true;
                true
            }
        };
        if should_send {
            self.shared.notify.notify_waiters();
            if self.mux.is_running() {
                self.mux
                    .send_frame(self.shared.id, &Frame::Shutdown)
                    .await?;
            }
        }
        Ok(())
    }

    /// Closes the read side locally. The peer may still send `Data`; the
    /// reader loop will discard it (spec.md section 4.5). No frame is
    /// emitted for this — it is purely local bookkeeping.
    pub fn close_read(&self) {
        self.shared.read_pipe.close_write();
    }

    /// Adjust the read-side window's `max`. Takes effect on the next
    /// `advance()`; never shrinks the currently-advertised `allowed`.
    pub fn set_read_buffer(&self, max: u64) {
        self.shared.state.lock().read_window.set_max(max);
    }

    /// Adjust the write-side window's `max` (how much fresh credit we will
    /// request via future reads before the peer grants more).
    pub fn set_write_buffer(&self, max: u64) {
        self.shared.state.lock().write_window.set_max(max);
    }

    /// Absolute deadline for future `read` calls. `None` clears it.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.read_pipe.set_read_deadline(deadline);
    }

    /// Absolute deadline for future `write` calls. Only affects a `write`
    /// that has not yet started waiting for credit — one already blocked
    /// keeps the deadline that was current when it started waiting
    /// (spec.md 4.4).
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.shared.state.lock().write_deadline = deadline;
    }

    /// Convenience for setting both deadlines to the same value.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        trace!(channel = self.shared.id, "Channel handle dropped");
    }
}

impl<T> Shared<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Ref-count bookkeeping for a locally-initiated `Close`. If this
    /// drops the count to 0, remove the entry from the channel table and
    /// record a `Closed` event.
    pub(crate) async fn finish_local_close(&self, channel: &Arc<ChannelShared>) {
        if channel.dec_ref() == 0 {
            self.remove_channel(channel.id);
        }
    }

    /// Ref-count bookkeeping for a peer-initiated `Close` (received off
    /// the wire). Same effect as [`Self::finish_local_close`], kept
    /// separate so the reader loop's call site reads clearly.
    pub(crate) fn finish_remote_close(&self, channel: &Arc<ChannelShared>) {
        if channel.dec_ref() == 0 {
            self.remove_channel(channel.id);
        }
    }

    fn remove_channel(&self, id: u32) {
        self.remove_channel_from_table(id);
        self.record_event(id, EventKind::Closed);
    }
}
