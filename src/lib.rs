//! A stream multiplexer: many independent, bidirectional, flow-controlled
//! sub-connections ("channels") carried over one reliable byte-stream
//! transport.
//!
//! Two peers exchange framed messages — [`Open`](frame::Frame::Open),
//! [`Close`](frame::Frame::Close), [`Shutdown`](frame::Frame::Shutdown),
//! [`Data`](frame::Frame::Data), [`Window`](frame::Frame::Window) — to open
//! channels, deliver payload bytes, advance a sliding credit window, and
//! signal half/full close. The multiplexer is generic over any
//! `T: AsyncRead + AsyncWrite + Unpin + Send + 'static`; it never assumes
//! TCP, TLS, or WebSocket framing beneath it.
//!
//! Retransmission, encryption, authentication, compression, and
//! multi-transport aggregation are explicitly out of scope: this crate
//! only multiplexes an already-reliable stream.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

mod channel;
mod config;
mod destination;
mod dupe;
mod error;
mod event_ring;
mod frame;
mod handshake;
mod inner;
mod locked_writer;
mod pipe;
mod window;

pub use channel::Channel;
pub use destination::{Destination, Protocol};
pub use error::{Error, Result};

use inner::{IdAllocation, Shared};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Installs a global `tracing` subscriber once before any unit test runs,
/// so `trace!`/`debug!`/`warn!` output is visible with `--nocapture`
/// instead of silently discarded.
#[cfg(test)]
#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// One end of a multiplexed connection running over transport `T`.
///
/// Construct with [`Multiplexer::new`] (which performs the handshake),
/// then drive the reader loop with [`Multiplexer::run`] — typically on its
/// own `tokio::spawn` — while using [`Multiplexer::dial`] and
/// [`Multiplexer::accept`] from other tasks to open channels.
pub struct Multiplexer<T> {
    shared: Arc<Shared<T>>,
    reader: Mutex<ReadHalf<T>>,
    accept_rx: Mutex<mpsc::Receiver<Channel<T>>>,
}

impl<T> Multiplexer<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Split `transport`, exchange the fixed handshake, and build a
    /// multiplexer around it.
    ///
    /// `server` selects which half of the 32-bit channel-ID space this
    /// side allocates from (spec.md 4.5's Forward/Backward scheme): pass
    /// `true` for the accepting side of a connection, `false` for the
    /// side that initiated it, so that two well-behaved peers never pick
    /// the same ID for channels they open locally.
    pub async fn new(transport: T, label: impl Into<String>, server: bool) -> Result<Self> {
        let (mut reader, mut writer) = tokio::io::split(transport);
        handshake::exchange(&mut reader, &mut writer).await?;
        let direction = if server {
            IdAllocation::Backward
        } else {
            IdAllocation::Forward
        };
        let (shared, accept_rx) = Shared::new(label.into(), writer, direction);
        debug!("multiplexer handshake complete");
        Ok(Self {
            shared,
            reader: Mutex::new(reader),
            accept_rx: Mutex::new(accept_rx),
        })
    }

    /// Drive the single reader task to completion.
    ///
    /// Returns `Ok(())` on a clean, peer-initiated transport close (the
    /// expected termination, spec.md 7.2); returns `Err` on a fatal
    /// decode or protocol error. Either way, every channel still open
    /// when the loop exits is force-closed before this returns, so
    /// blocked readers see EOF and blocked writers see
    /// [`Error::Closed`].
    ///
    /// Only one call to `run` should be in flight at a time; a second
    /// concurrent call blocks behind the first on the internal reader
    /// lock rather than racing it.
    pub async fn run(&self) -> Result<()> {
        self.shared.start();
        let mut reader = self.reader.lock().await;
        let result = self.shared.run_reader_loop(&mut *reader).await;
        self.shared.teardown();
        result
    }

    /// Whether the multiplexer is still accepting `dial`/`accept` calls.
    /// Becomes `false` once [`Multiplexer::run`] returns or
    /// [`Multiplexer::close`] is called.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Open a new channel to `destination`, sending an `Open` frame to
    /// the peer. Does not wait for any acknowledgement — the protocol has
    /// none; the channel is usable for `read`/`write` immediately.
    pub async fn dial(&self, destination: Destination) -> Result<Channel<T>> {
        self.shared.dial(destination).await
    }

    /// Wait for the next peer-initiated channel (an inbound `Open`
    /// frame). Returns [`Error::NotRunning`] once the multiplexer has
    /// been torn down and no further channels will arrive.
    pub async fn accept(&self) -> Result<Channel<T>> {
        if !self.shared.is_running() {
            return Err(Error::NotRunning);
        }
        let channel = self
            .accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::NotRunning)?;
        channel.send_initial_window().await?;
        Ok(channel)
    }

    /// Tear down local state and shut down the write half, signaling the
    /// peer that this side is done. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.shared.close().await
    }

    /// A human-readable snapshot of currently open channels and the last
    /// [`EVENT_RING_CAPACITY`](config::EVENT_RING_CAPACITY) protocol
    /// events, for diagnostics.
    pub fn dump_state(&self) -> String {
        self.shared.dump_state()
    }
}
