//! Fixed-size circular log of the last 500 frames/opens/closes.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//
// Diagnostics only — nothing here affects protocol behavior. Guarded by
// its own short-critical-section mutex (spec.md section 5, "Events
// mutex"), distinct from the metadata and channel mutexes so that writing
// a diagnostic event never contends with the hot path any longer than
// necessary.

use crate::config::EVENT_RING_CAPACITY;
use crate::frame::Command;
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

/// What happened to a channel or frame, for [`EventRing::dump`].
#[derive(Debug, Clone, Copy)]
pub enum EventKind {
    /// A frame was handed to the write mutex for sending.
    Sent(Command),
    /// A frame was parsed off the transport.
    Received(Command),
    /// A channel was inserted into the table (locally dialed or accepted
    /// from a peer `Open`).
    Opened,
    /// A channel was removed from the table.
    Closed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent(cmd) => write!(f, "sent {cmd:?}"),
            Self::Received(cmd) => write!(f, "recv {cmd:?}"),
            Self::Opened => write!(f, "opened"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// One ring entry.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub channel_id: u32,
    pub kind: EventKind,
    pub at: Instant,
}

/// A `VecDeque`-backed ring of at most [`EVENT_RING_CAPACITY`] entries;
/// the oldest is evicted once the ring is full.
pub struct EventRing {
    entries: VecDeque<Event>,
}

impl EventRing {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(EVENT_RING_CAPACITY),
        }
    }

    /// Append one event, evicting the oldest if already at capacity.
    pub fn push(&mut self, channel_id: u32, kind: EventKind) {
        if self.entries.len() >= EVENT_RING_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(Event {
            channel_id,
            kind,
            at: Instant::now(),
        });
    }

    /// Write every retained event, oldest first, to `w`. The caller must
    /// not hold any other multiplexer lock while calling this — writing to
    /// `w` must not itself take a lock we already hold (spec.md 9).
    pub fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        for event in &self.entries {
            writeln!(
                w,
                "[{:?}] channel {:#010x}: {}",
                event.at, event.channel_id, event.kind
            )?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_bounds_at_capacity() {
        let mut ring = EventRing::new();
        for i in 0..(EVENT_RING_CAPACITY + 50) {
            ring.push(i as u32, EventKind::Opened);
        }
        assert_eq!(ring.len(), EVENT_RING_CAPACITY);
        // Oldest 50 entries (channel_id 0..50) must have been evicted.
        let mut out = String::new();
        ring.dump(&mut out).unwrap();
        assert!(!out.contains("channel 0x00000000"));
    }

    #[test]
    fn dump_preserves_insertion_order() {
        let mut ring = EventRing::new();
        ring.push(1, EventKind::Opened);
        ring.push(2, EventKind::Sent(Command::Data));
        ring.push(1, EventKind::Closed);
        let mut out = String::new();
        ring.dump(&mut out).unwrap();
        let pos1 = out.find("channel 0x00000001: opened").unwrap();
        let pos2 = out.find("channel 0x00000002").unwrap();
        let pos3 = out.find("channel 0x00000001: closed").unwrap();
        assert!(pos1 < pos2 && pos2 < pos3);
    }
}
