//! The single write path shared by every channel and by control frames.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//
// The only lock in this crate ever held across an `.await` (spec.md
// section 5, "write mutex"): one whole frame — header, payload, flush —
// must reach the transport as an uninterrupted unit, or two concurrent
// writers could interleave mid-frame and desync the peer's decoder.

use crate::dupe::Dupe;
use crate::error::Result;
use crate::frame::Frame;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

/// A writer wrapped so it can be cloned cheaply and shared between the
/// reader task (which replies to `Window`/`Close`) and every live
/// [`Channel`](crate::channel::Channel).
pub(crate) struct LockedWriter<W>(Arc<Mutex<W>>);

impl<W> LockedWriter<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self(Arc::new(Mutex::new(writer)))
    }
}

impl<W: AsyncWrite + Unpin> LockedWriter<W> {
    /// Encode `frame` for `channel_id`, then lock, write, and flush it as
    /// one unit.
    pub(crate) async fn send_frame(&self, channel_id: u32, frame: &Frame) -> Result<()> {
        let bytes = frame.encode(channel_id)?;
        let mut w = self.0.lock().await;
        w.write_all(&bytes).await?;
        w.flush().await?;
        trace!(channel = channel_id, len = bytes.len(), "frame flushed");
        Ok(())
    }

    /// Shut down the underlying writer, signaling the peer that no more
    /// data is coming on this transport.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        let mut w = self.0.lock().await;
        w.shutdown().await?;
        Ok(())
    }
}

impl<W> Dupe for LockedWriter<W> {
    #[inline]
    fn dupe(&self) -> Self {
        Self(self.0.dupe())
    }
}

impl<W> std::fmt::Debug for LockedWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedWriter").finish_non_exhaustive()
    }
}
