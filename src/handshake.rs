//! The fixed greeting exchanged once per connection, before any frame.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::{HANDSHAKE_MAGIC, PROTOCOL_VERSION};
use crate::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const HANDSHAKE_LEN: usize = HANDSHAKE_MAGIC.len() + 1;

/// Send our greeting and verify the peer's, concurrently (spec.md 4.5
/// construction step 2: "both peers send and receive concurrently"). A
/// version mismatch, or a missing/garbled magic, is a fatal error that
/// aborts construction before the reader task ever starts.
pub async fn exchange<R, W>(reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (send, recv) = tokio::join!(send_greeting(writer), recv_greeting(reader));
    send?;
    recv?;
    Ok(())
}

async fn send_greeting<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    buf[..HANDSHAKE_MAGIC.len()].copy_from_slice(&HANDSHAKE_MAGIC);
    buf[HANDSHAKE_MAGIC.len()] = PROTOCOL_VERSION;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

async fn recv_greeting<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut buf).await?;
    if buf[..HANDSHAKE_MAGIC.len()] != HANDSHAKE_MAGIC {
        return Err(Error::BadHandshakeMagic);
    }
    let peer_version = buf[HANDSHAKE_MAGIC.len()];
    if peer_version != PROTOCOL_VERSION {
        return Err(Error::VersionMismatch {
            local: PROTOCOL_VERSION,
            peer: peer_version,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matching_handshake_succeeds() {
        let (a, b) = tokio::io::duplex(64);
        let (mut ar, mut aw) = tokio::io::split(a);
        let (mut br, mut bw) = tokio::io::split(b);
        let (ra, rb) = tokio::join!(exchange(&mut ar, &mut aw), exchange(&mut br, &mut bw));
        ra.unwrap();
        rb.unwrap();
    }

    #[tokio::test]
    async fn bad_magic_is_fatal() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            client.write_all(&[1, 2, 3, 4, PROTOCOL_VERSION]).await.unwrap();
        });
        let mut buf = [0u8; HANDSHAKE_LEN];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut buf)
            .await
            .unwrap();
        writer.await.unwrap();
        assert_ne!(buf[..4], HANDSHAKE_MAGIC);
    }
}
