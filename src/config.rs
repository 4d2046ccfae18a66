//! Fixed numeric knobs shared across the multiplexer.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//
// Loading these from a file or environment is the embedding application's
// job (out of scope, see spec.md section 1); this module only centralizes
// the constants the protocol itself is built on, the way the teacher's own
// `config` module centralizes `RWND`.

/// Default `max` for a freshly-opened [`WindowState`](crate::window::WindowState):
/// the number of bytes of credit a fresh channel grants in each direction.
pub const DEFAULT_WINDOW_MAX: u64 = 65536;

/// Number of events [`EventRing`](crate::event_ring::EventRing) retains
/// before evicting the oldest.
pub const EVENT_RING_CAPACITY: usize = 500;

/// Fixed magic bytes exchanged at the start of every connection, before any
/// frame. Chosen to be unlikely to appear as a stray frame header.
pub const HANDSHAKE_MAGIC: [u8; 4] = *b"WMX1";

/// Protocol version carried in the handshake. Bumping this is a breaking
/// wire change; peers with differing versions must refuse to proceed.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of one frame header on the wire: `channel_id(4) + command(1) + length(4)`.
pub const FRAME_HEADER_LEN: usize = 9;

/// Size of the `seq` field that follows a `Window` frame's header.
pub const WINDOW_SEQ_LEN: usize = 8;

/// Upper bound on a single `Data` frame's payload, to keep a misbehaving or
/// corrupt peer from making the reader allocate unbounded scratch space.
pub const MAX_DATA_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Upper bound on an `Open` frame's address field.
pub const MAX_ADDRESS_LEN: u16 = u16::MAX;

/// Depth of the queue between the reader task and `Multiplexer::accept`.
/// A slow acceptor backpressures new inbound `Open`s rather than
/// unboundedly buffering them.
pub const ACCEPT_QUEUE_CAPACITY: usize = 64;
