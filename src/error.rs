//! Crate-wide error type.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the multiplexer and its channels.
///
/// See `spec.md` section 7 for the taxonomy this maps onto: `Io`, `Decode`,
/// `UnknownChannel`, `DedicatedUnsupported`, and `VersionMismatch` are the
/// "fatal transport" kind; `Timeout` is the deadline kind; everything else
/// (recoverable-at-channel-level, idempotent no-ops, expected termination)
/// is handled without constructing an `Error` at all.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying transport returned an I/O error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be parsed: truncated stream, unknown command, or
    /// an over-length field.
    #[error("failed to decode frame: {0}")]
    Decode(#[from] crate::frame::DecodeError),

    /// A `Data`, `Window`, `Close`, or `Shutdown` frame named a channel ID
    /// that is not in the channel table.
    #[error("frame referenced unknown channel {0:#x}")]
    UnknownChannel(u32),

    /// A peer's `Open` frame named a channel ID already present in our
    /// table — a protocol violation, since each side allocates from its
    /// own half of the ID space (spec.md 4.5).
    #[error("peer opened already-active channel {0:#x}")]
    DuplicateChannel(u32),

    /// `Dial` could not find a free channel ID; the local half of the ID
    /// space is fully occupied.
    #[error("no free channel IDs available")]
    ChannelSpaceExhausted,

    /// The peer's `Open` frame requested a `Dedicated` connection, which
    /// this crate does not implement (spec.md 4.1, 9: "do not invent
    /// semantics").
    #[error("peer requested an unsupported Dedicated connection")]
    DedicatedUnsupported,

    /// The peer's handshake carried a protocol version we do not speak.
    #[error("handshake version mismatch: local {local}, peer {peer}")]
    VersionMismatch { local: u8, peer: u8 },

    /// The peer's handshake did not start with the expected magic bytes.
    #[error("handshake magic mismatch")]
    BadHandshakeMagic,

    /// A blocking operation (`Read`, `Write`, `Accept`) hit its deadline
    /// before it could complete. `written` is how many bytes a `Write` (or
    /// half of a `Write`) managed to emit before timing out.
    #[error("operation timed out after writing {written} bytes")]
    Timeout { written: usize },

    /// `Dial`, `Accept`, or a send was attempted after the multiplexer
    /// stopped running.
    #[error("multiplexer is not running")]
    NotRunning,

    /// The multiplexer (or the channel) is gone; the operation has no
    /// effect.
    #[error("multiplexer or channel closed")]
    Closed,
}
