//! End-to-end tests driving [`wiremux::Multiplexer`] over an in-memory
//! transport (`tokio::io::duplex`), the way two real peers would see it.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use wiremux::{Destination, Error, Multiplexer, Protocol};

const DUPLEX_BUF: usize = 1 << 20;

/// Same rationale as `wiremux`'s own `init_test_tracing`: integration
/// tests compile to a separate binary, so they need their own one-time
/// subscriber install.
#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Builds a connected pair and immediately spawns both reader loops,
/// returning handles still usable for `dial`/`accept`/`close`.
async fn connected_pair() -> (Arc<Multiplexer<DuplexStream>>, Arc<Multiplexer<DuplexStream>>) {
    let (client_io, server_io) = tokio::io::duplex(DUPLEX_BUF);
    let client = Arc::new(Multiplexer::new(client_io, "client", false).await.unwrap());
    let server = Arc::new(Multiplexer::new(server_io, "server", true).await.unwrap());
    {
        let client = client.clone();
        tokio::spawn(async move { client.run().await });
    }
    {
        let server = server.clone();
        tokio::spawn(async move { server.run().await });
    }
    // `run()` flips `running` true as its first step, but the spawned
    // task needs at least one poll to get there; wait rather than race
    // a `dial`/`accept` call against it.
    while !client.is_running() {
        tokio::task::yield_now().await;
    }
    while !server.is_running() {
        tokio::task::yield_now().await;
    }
    (client, server)
}

// Raw wire constants, mirrored from `src/config.rs` / `src/frame.rs`: a
// misbehaving-peer test has no `Channel` to go through, so it writes frame
// bytes directly (see DESIGN.md's note on the test-override open question).
const HANDSHAKE_MAGIC: [u8; 4] = *b"WMX1";
const PROTOCOL_VERSION: u8 = 1;
const CMD_OPEN: u8 = 0;

fn raw_open_frame(channel_id: u32, address: &str, port: u16) -> Vec<u8> {
    let addr = address.as_bytes();
    let payload_len = 1 + 1 + 2 + addr.len() + 2;
    let mut buf = Vec::with_capacity(9 + payload_len);
    buf.extend_from_slice(&channel_id.to_be_bytes());
    buf.push(CMD_OPEN);
    buf.extend_from_slice(&(payload_len as u32).to_be_bytes());
    buf.push(1); // ConnectionKind::Multiplexed
    buf.push(0); // Protocol::Tcp
    buf.extend_from_slice(&(addr.len() as u16).to_be_bytes());
    buf.extend_from_slice(addr);
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

async fn send_raw_handshake(stream: &mut DuplexStream) {
    let mut greeting = Vec::with_capacity(5);
    greeting.extend_from_slice(&HANDSHAKE_MAGIC);
    greeting.push(PROTOCOL_VERSION);
    stream.write_all(&greeting).await.unwrap();
    stream.flush().await.unwrap();
    let mut their_greeting = [0u8; 5];
    stream.read_exact(&mut their_greeting).await.unwrap();
}

#[tokio::test]
async fn echo_one_byte_through_dialed_channel() {
    let (client, server) = connected_pair().await;

    let dest = Destination::new(Protocol::Tcp, "echo.example", 7);
    let client_chan = client.dial(dest).await.unwrap();
    let server_chan = server.accept().await.unwrap();
    assert_eq!(server_chan.remote_addr().address, "echo.example");

    client_chan.write(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    let n = server_chan.read(&mut buf).await.unwrap();
    assert_eq!(n, 1);
    assert_eq!(&buf, b"x");

    server_chan.write(&buf).await.unwrap();
    let mut echoed = [0u8; 1];
    let n = client_chan.read(&mut echoed).await.unwrap();
    assert_eq!(n, 1);
    assert_eq!(&echoed, b"x");
}

#[tokio::test]
async fn dialed_channel_cannot_write_until_peer_accepts() {
    let (client, server) = connected_pair().await;

    let client_chan = client
        .dial(Destination::new(Protocol::Tcp, "h", 1))
        .await
        .unwrap();

    // Nobody has called `accept` yet, so the peer's initial `Window`
    // frame (spec.md 4.5) has not been sent: the write-side window still
    // has zero credit and `write` must block rather than send anything.
    let mut write_task = tokio::spawn(async move { client_chan.write(b"premature").await });
    tokio::select! {
        _ = &mut write_task => panic!("write completed before any credit was granted"),
        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
    }

    // Accepting sends the initial Window frame and unblocks the writer.
    let server_chan = server.accept().await.unwrap();
    let n = write_task.await.unwrap().unwrap();
    assert_eq!(n, "premature".len());

    let mut buf = [0u8; 16];
    let n = server_chan.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"premature");
}

#[tokio::test]
async fn write_larger_than_window_blocks_then_completes_once_peer_reads() {
    let (client, server) = connected_pair().await;

    let client_chan = client
        .dial(Destination::new(Protocol::Tcp, "h", 1))
        .await
        .unwrap();
    let server_chan = server.accept().await.unwrap();

    // One fresh channel's default window (config::DEFAULT_WINDOW_MAX) is
    // 65536 bytes; a write larger than that cannot complete until the peer
    // reads enough to cross the re-advertise threshold.
    let mut write_task = tokio::spawn(async move { client_chan.write(&[7u8; 70_000]).await });

    // The writer must not finish on its own within a short window.
    tokio::select! {
        _ = &mut write_task => panic!("write completed without the peer reading anything"),
        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
    }

    // Drain enough on the server side to cross the half-window threshold
    // and trigger a `Window` frame back to the client.
    let mut total = 0usize;
    let mut buf = [0u8; 16_384];
    while total < 70_000 {
        let n = server_chan.read(&mut buf).await.unwrap();
        assert!(n > 0);
        total += n;
    }
    assert_eq!(total, 70_000);

    let written = write_task.await.unwrap().unwrap();
    assert_eq!(written, 70_000);
}

#[tokio::test]
async fn write_deadline_times_out_with_partial_count() {
    let (client, server) = connected_pair().await;
    let client_chan = client
        .dial(Destination::new(Protocol::Tcp, "h", 1))
        .await
        .unwrap();
    let _server_chan = server.accept().await.unwrap();

    // Exhaust the full 65536-byte window in one call; this must not block
    // since it fits exactly within the initial credit.
    let full_window = vec![1u8; 65_536];
    let written = client_chan.write(&full_window).await.unwrap();
    assert_eq!(written, 65_536);

    // The window is now fully consumed and nobody is reading to replenish
    // it, so a further write must time out rather than hang forever.
    client_chan.set_write_deadline(Some(Instant::now() + Duration::from_millis(50)));
    let err = client_chan.write(b"one more byte").await.unwrap_err();
    match err {
        Error::Timeout { written } => assert_eq!(written, 0),
        other => panic!("expected Timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn data_still_flows_after_local_write_shutdown() {
    let (client, server) = connected_pair().await;
    let client_chan = client
        .dial(Destination::new(Protocol::Tcp, "h", 1))
        .await
        .unwrap();
    let server_chan = server.accept().await.unwrap();

    client_chan.close_write().await.unwrap();
    let err = client_chan.write(b"too late").await.unwrap_err();
    assert!(matches!(err, Error::Closed));

    // The client's write side is shut down, but its read side is untouched:
    // the server can still send it data and the client still receives it.
    server_chan.write(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    let n = client_chan.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"still here");
}

#[tokio::test]
async fn peer_transport_loss_force_closes_open_channels() {
    let (near_io, mut far_io) = tokio::io::duplex(DUPLEX_BUF);
    let near = Arc::new(Multiplexer::new(near_io, "near", false).await.unwrap());

    // stand in for the peer: answer the handshake, then read nothing else.
    send_raw_handshake(&mut far_io).await;

    let run_task = {
        let near = near.clone();
        tokio::spawn(async move { near.run().await })
    };
    while !near.is_running() {
        tokio::task::yield_now().await;
    }

    let chan = near
        .dial(Destination::new(Protocol::Tcp, "h", 1))
        .await
        .unwrap();

    // simulate the peer vanishing mid-connection
    drop(far_io);

    // the reader loop should see a clean EOF and return Ok(()), tearing
    // down every channel it still held open.
    let result = tokio::time::timeout(Duration::from_secs(1), run_task)
        .await
        .expect("run() should return promptly after transport EOF")
        .unwrap();
    assert!(result.is_ok());

    let mut buf = [0u8; 8];
    let n = chan.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "blocked reader should observe EOF after teardown");
    assert!(matches!(chan.write(b"x").await.unwrap_err(), Error::Closed));
    assert!(!near.is_running());
}

#[tokio::test]
async fn ids_allocated_by_both_sides_never_collide() {
    let (client, server) = connected_pair().await;
    let mut ids = std::collections::HashSet::new();
    for i in 0..50u16 {
        let c = client
            .dial(Destination::new(Protocol::Tcp, "h", i))
            .await
            .unwrap();
        let s_chan = server.accept().await.unwrap();
        assert!(ids.insert(c.id()), "client allocated a duplicate ID");
        // client allocates Forward (low IDs), server allocates Backward
        // (high IDs); a dialed channel's ID and the matching accepted
        // channel's ID are the same wire ID, just seen from both sides.
        assert_eq!(c.id(), s_chan.id());
    }
}

#[tokio::test]
async fn duplicate_open_from_peer_is_a_fatal_protocol_error() {
    let (near_io, mut far_io) = tokio::io::duplex(DUPLEX_BUF);
    let near = Multiplexer::new(near_io, "near", true).await.unwrap();
    send_raw_handshake(&mut far_io).await;

    far_io
        .write_all(&raw_open_frame(5, "a.example", 1))
        .await
        .unwrap();
    far_io
        .write_all(&raw_open_frame(5, "b.example", 2))
        .await
        .unwrap();
    far_io.flush().await.unwrap();

    let err = near.run().await.unwrap_err();
    assert!(matches!(err, Error::DuplicateChannel(5)));
}
