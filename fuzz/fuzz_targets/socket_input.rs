//! Feeds arbitrary bytes to a multiplexer's reader loop after a valid
//! handshake, the way `rusty-penguin`'s own `socket_input` target feeds a
//! WebSocket connection: the goal is "never panics", not "decodes
//! correctly" — a corrupt peer is always allowed to produce a fatal
//! `Err`, never a crash.
#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use wiremux::{Destination, Multiplexer, Protocol};

const HANDSHAKE_MAGIC: [u8; 4] = *b"WMX1";
const PROTOCOL_VERSION: u8 = 1;

fuzz_target!(|data: &[u8]| {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let (ours, mut theirs) = tokio::io::duplex(1 << 16);
        let mux = match Multiplexer::new(ours, "fuzz", true).await {
            Ok(mux) => Arc::new(mux),
            Err(_) => return,
        };

        let data = data.to_vec();
        let feeder = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut greeting = [0u8; 5];
            if theirs.read_exact(&mut greeting).await.is_err() {
                return;
            }
            let mut reply = Vec::with_capacity(5);
            reply.extend_from_slice(&HANDSHAKE_MAGIC);
            reply.push(PROTOCOL_VERSION);
            let _ = theirs.write_all(&reply).await;
            let _ = theirs.write_all(&data).await;
            let _ = theirs.flush().await;
            drop(theirs);
        });

        // `run` must actually be driving the reader loop (and have
        // flipped `running` true) before `dial` can do anything but
        // return `Error::NotRunning` immediately.
        let run_task = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.run().await })
        };
        while !mux.is_running() {
            tokio::task::yield_now().await;
        }

        // Exercise `dial` concurrently with the reader loop: a fuzzed
        // stream may legitimately carry `Window`/`Close` frames for IDs
        // we are in the middle of allocating.
        let dest = Destination::new(Protocol::Tcp, "fuzz.invalid", 1);
        let _ = mux.dial(dest).await;

        let _ = tokio::join!(run_task, feeder);
    });
});
