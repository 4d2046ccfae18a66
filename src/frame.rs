//! Wire representation of handshake and per-channel messages.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//
// Byte-exact, big-endian (network byte order — the fixed choice spec.md
// 4.1 requires both peers to agree on; we just pick one). Parsing failures
// here are always fatal for the connection (spec.md 4.1): the reader
// aborts and the multiplexer tears down, so every error path returns
// `Err` rather than trying to resynchronise on bad input.

use crate::config::{FRAME_HEADER_LEN, MAX_ADDRESS_LEN, MAX_DATA_FRAME_LEN, WINDOW_SEQ_LEN};
use crate::destination::{Destination, Protocol};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// One protocol command. Exactly one per frame (spec.md section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Open = 0,
    Close = 1,
    Shutdown = 2,
    Data = 3,
    Window = 4,
}

impl Command {
    fn try_from_u8(b: u8) -> Result<Self, DecodeError> {
        match b {
            0 => Ok(Self::Open),
            1 => Ok(Self::Close),
            2 => Ok(Self::Shutdown),
            3 => Ok(Self::Data),
            4 => Ok(Self::Window),
            other => Err(DecodeError::UnknownCommand(other)),
        }
    }
}

/// `Open`'s `connection_kind`. Only `Multiplexed` is implemented;
/// `Dedicated` is declared on the wire but is a hard error to receive
/// (spec.md 4.1, 9 — "do not invent semantics").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionKind {
    Dedicated = 0,
    Multiplexed = 1,
}

impl ConnectionKind {
    fn try_from_u8(b: u8) -> Result<Self, DecodeError> {
        match b {
            0 => Ok(Self::Dedicated),
            1 => Ok(Self::Multiplexed),
            other => Err(DecodeError::UnknownConnectionKind(other)),
        }
    }
}

/// A fully-parsed frame, after the fixed header has been interpreted.
#[derive(Debug, Clone)]
pub enum Frame {
    Open {
        kind: ConnectionKind,
        destination: Destination,
    },
    Close,
    Shutdown,
    Data(Bytes),
    Window {
        seq: u64,
    },
}

impl Frame {
    pub(crate) fn command(&self) -> Command {
        match self {
            Self::Open { .. } => Command::Open,
            Self::Close => Command::Close,
            Self::Shutdown => Command::Shutdown,
            Self::Data(_) => Command::Data,
            Self::Window { .. } => Command::Window,
        }
    }

    /// Encode the exact bytes to send for this frame on `channel_id`,
    /// ready for a single `write_all` through the multiplexer's write
    /// mutex (spec.md 4.5 "frame send discipline").
    pub fn encode(&self, channel_id: u32) -> Result<Bytes, DecodeError> {
        match self {
            Self::Open { kind, destination } => {
                let addr_bytes = destination.address.as_bytes();
                if addr_bytes.len() > MAX_ADDRESS_LEN as usize {
                    return Err(DecodeError::OversizedAddress(addr_bytes.len()));
                }
                let payload_len = 1 + 1 + 2 + addr_bytes.len() + 2;
                let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload_len);
                put_header(&mut buf, channel_id, Command::Open, payload_len as u32);
                buf.put_u8(*kind as u8);
                buf.put_u8(destination.protocol as u8);
                buf.put_u16(addr_bytes.len() as u16);
                buf.put_slice(addr_bytes);
                buf.put_u16(destination.port);
                Ok(buf.freeze())
            }
            Self::Close => {
                let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN);
                put_header(&mut buf, channel_id, Command::Close, 0);
                Ok(buf.freeze())
            }
            Self::Shutdown => {
                let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN);
                put_header(&mut buf, channel_id, Command::Shutdown, 0);
                Ok(buf.freeze())
            }
            Self::Data(payload) => {
                let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
                put_header(&mut buf, channel_id, Command::Data, payload.len() as u32);
                buf.put_slice(payload);
                Ok(buf.freeze())
            }
            Self::Window { seq } => {
                let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + WINDOW_SEQ_LEN);
                put_header(&mut buf, channel_id, Command::Window, 0);
                buf.put_u64(*seq);
                Ok(buf.freeze())
            }
        }
    }
}

fn put_header(buf: &mut BytesMut, channel_id: u32, command: Command, length: u32) {
    buf.put_u32(channel_id);
    buf.put_u8(command as u8);
    buf.put_u32(length);
}

/// Read one full frame from `r`. A transport error (including a clean EOF)
/// is returned as-is; the caller distinguishes expected vs. fatal
/// termination the way spec.md 7.2 describes.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
) -> crate::error::Result<(u32, Frame)> {
    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    r.read_exact(&mut header_buf).await?;
    let mut cur = &header_buf[..];
    let channel_id = cur.get_u32();
    let command = Command::try_from_u8(cur.get_u8())?;
    let length = cur.get_u32();

    let frame = match command {
        Command::Open => {
            if length > MAX_DATA_FRAME_LEN {
                return Err(DecodeError::OversizedFrame {
                    len: length,
                    max: MAX_DATA_FRAME_LEN,
                }
                .into());
            }
            let mut payload = vec![0u8; length as usize];
            r.read_exact(&mut payload).await?;
            let mut cur = &payload[..];
            if cur.remaining() < 4 {
                return Err(DecodeError::Truncated.into());
            }
            let kind = ConnectionKind::try_from_u8(cur.get_u8())?;
            let protocol = Protocol::try_from_u8(cur.get_u8())
                .ok_or(DecodeError::UnknownProtocol(payload[1]))?;
            if cur.remaining() < 2 {
                return Err(DecodeError::Truncated.into());
            }
            let addr_len = cur.get_u16() as usize;
            if cur.remaining() < addr_len + 2 {
                return Err(DecodeError::Truncated.into());
            }
            let addr_bytes = cur.copy_to_bytes(addr_len);
            let address = String::from_utf8(addr_bytes.to_vec())
                .map_err(|_| DecodeError::InvalidAddress)?;
            let port = cur.get_u16();
            Frame::Open {
                kind,
                destination: Destination::new(protocol, address, port),
            }
        }
        Command::Close => {
            if length != 0 {
                return Err(DecodeError::IncorrectLength {
                    command: Command::Close,
                    expected: 0,
                    actual: length,
                }
                .into());
            }
            Frame::Close
        }
        Command::Shutdown => {
            if length != 0 {
                return Err(DecodeError::IncorrectLength {
                    command: Command::Shutdown,
                    expected: 0,
                    actual: length,
                }
                .into());
            }
            Frame::Shutdown
        }
        Command::Data => {
            if length > MAX_DATA_FRAME_LEN {
                return Err(DecodeError::OversizedFrame {
                    len: length,
                    max: MAX_DATA_FRAME_LEN,
                }
                .into());
            }
            // Read exactly `length` bytes, never partial: the stream would
            // desynchronise otherwise (spec.md 4.5 reader loop, Data arm).
            let mut payload = vec![0u8; length as usize];
            r.read_exact(&mut payload).await?;
            Frame::Data(Bytes::from(payload))
        }
        Command::Window => {
            let mut seq_buf = [0u8; WINDOW_SEQ_LEN];
            r.read_exact(&mut seq_buf).await?;
            Frame::Window {
                seq: u64::from_be_bytes(seq_buf),
            }
        }
    };
    Ok((channel_id, frame))
}

/// A frame-parsing failure. Always fatal for the connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown command byte {0:#x}")]
    UnknownCommand(u8),
    #[error("unknown connection kind byte {0:#x}")]
    UnknownConnectionKind(u8),
    #[error("unknown protocol byte {0:#x}")]
    UnknownProtocol(u8),
    #[error("oversized frame: {len} bytes exceeds max {max}")]
    OversizedFrame { len: u32, max: u32 },
    #[error("oversized address: {0} bytes")]
    OversizedAddress(usize),
    #[error("{command:?} frame must carry length {expected}, got {actual}")]
    IncorrectLength {
        command: Command,
        expected: u32,
        actual: u32,
    },
    #[error("truncated Open payload")]
    Truncated,
    #[error("Open destination address is not valid UTF-8")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn data_frame_roundtrip() {
        let frame = Frame::Data(Bytes::from_static(b"hello"));
        let bytes = frame.encode(42).unwrap();
        let mut cur = Cursor::new(bytes.to_vec());
        let (id, decoded) = read_frame(&mut cur).await.unwrap();
        assert_eq!(id, 42);
        match decoded {
            Frame::Data(b) => assert_eq!(&b[..], b"hello"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn window_frame_roundtrip() {
        let frame = Frame::Window { seq: 0xdead_beef_0000_1234 };
        let bytes = frame.encode(7).unwrap();
        let mut cur = Cursor::new(bytes.to_vec());
        let (id, decoded) = read_frame(&mut cur).await.unwrap();
        assert_eq!(id, 7);
        match decoded {
            Frame::Window { seq } => assert_eq!(seq, 0xdead_beef_0000_1234),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_frame_roundtrip() {
        let dest = Destination::new(Protocol::Tcp, "example.com", 443);
        let frame = Frame::Open {
            kind: ConnectionKind::Multiplexed,
            destination: dest.clone(),
        };
        let bytes = frame.encode(3).unwrap();
        let mut cur = Cursor::new(bytes.to_vec());
        let (id, decoded) = read_frame(&mut cur).await.unwrap();
        assert_eq!(id, 3);
        match decoded {
            Frame::Open { kind, destination } => {
                assert_eq!(kind, ConnectionKind::Multiplexed);
                assert_eq!(destination, dest);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_and_shutdown_roundtrip() {
        for (frame, expect_cmd) in [(Frame::Close, Command::Close), (Frame::Shutdown, Command::Shutdown)] {
            let bytes = frame.encode(1).unwrap();
            let mut cur = Cursor::new(bytes.to_vec());
            let (_, decoded) = read_frame(&mut cur).await.unwrap();
            assert_eq!(decoded.command(), expect_cmd);
        }
    }

    #[tokio::test]
    async fn unknown_command_is_fatal() {
        let mut raw = vec![0u8, 0, 0, 1]; // channel_id = 1
        raw.push(99); // bogus command
        raw.extend_from_slice(&0u32.to_be_bytes()); // length = 0
        let mut cur = Cursor::new(raw);
        let err = read_frame(&mut cur).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Decode(DecodeError::UnknownCommand(99))
        ));
    }

    #[tokio::test]
    async fn truncated_stream_is_io_error() {
        let raw = vec![0u8, 0, 0, 1, 3]; // header cut short
        let mut cur = Cursor::new(raw);
        let err = read_frame(&mut cur).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Io(_)));
    }

    #[tokio::test]
    async fn close_with_nonzero_length_is_fatal() {
        let mut raw = vec![0u8, 0, 0, 1, 1]; // Close
        raw.extend_from_slice(&5u32.to_be_bytes()); // non-zero length
        raw.extend_from_slice(b"hello");
        let mut cur = Cursor::new(raw);
        let err = read_frame(&mut cur).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Decode(DecodeError::IncorrectLength { .. })
        ));
    }
}
