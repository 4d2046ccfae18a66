//! Single-producer/single-consumer in-memory byte queue: the receive path
//! of a channel.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//
// `write` never blocks the producer (the reader task must never stall on a
// slow application, spec.md section 5): it just appends and returns. `read`
// blocks the one consumer until bytes are available, the pipe is closed,
// or a deadline passes. No byte is ever lost across `close_write` — the
// queue drains fully before `read` reports EOF.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::Notify;

struct Inner {
    queue: VecDeque<u8>,
    closed: bool,
}

pub struct BufferedPipe {
    inner: Mutex<Inner>,
    notify: Notify,
    read_deadline: Mutex<Option<Instant>>,
}

impl BufferedPipe {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            read_deadline: Mutex::new(None),
        }
    }

    /// Append `bytes`. Never blocks. Errors only once `close_write` has
    /// been called.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::Closed);
        }
        inner.queue.extend(bytes.iter().copied());
        drop(inner);
        self.notify.notify_waiters();
        Ok(bytes.len())
    }

    /// Block until some bytes are available, the pipe is closed and
    /// drained (returns `Ok(0)`, the usual EOF convention), or the read
    /// deadline elapses (returns [`Error::Timeout`]).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let notified = {
                let mut inner = self.inner.lock();
                if !inner.queue.is_empty() {
                    let n = buf.len().min(inner.queue.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = inner.queue.pop_front().expect("checked non-empty above");
                    }
                    return Ok(n);
                }
                if inner.closed {
                    return Ok(0);
                }
                // Register for the wakeup before releasing the lock, so a
                // `write`/`close_write` racing with us can't be missed.
                self.notify.notified()
            };
            match *self.read_deadline.lock() {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout { written: 0 });
                    }
                    if tokio::time::timeout(deadline - now, notified).await.is_err() {
                        return Err(Error::Timeout { written: 0 });
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Idempotent. Wakes any blocked reader; bytes already queued are
    /// still delivered before the reader observes EOF.
    pub fn close_write(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Absolute deadline for future `read` calls. `None` disables it.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.read_deadline.lock() = deadline;
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Default for BufferedPipe {
    fn default() -> Self {
        Self::new()
    }
}
