// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Monitor sync connector.
//!
//! Each character gets one daemon thread that drains its monitor queue onto
//! a WebSocket to the monitor process (`/sync/{name}`), reconnecting on
//! failure and heartbeating while idle.  The thread runs its own
//! current-thread runtime so a wedged monitor can never stall the main
//! event loop; shutdown is cooperative via a shared flag, with a bounded
//! join on teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use futures::SinkExt;
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const QUEUE_POLL: Duration = Duration::from_millis(500);
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Spawn the connector thread for one character.
pub fn spawn_sync_connector(
    name: String,
    monitor_ws_base: String,
    rx: Receiver<Value>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("sync-connector-{name}"))
        .spawn(move || connector_loop(&name, &monitor_ws_base, rx, &shutdown))
        .expect("spawning sync connector thread")
}

fn connector_loop(name: &str, base: &str, rx: Receiver<Value>, shutdown: &AtomicBool) {
    let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    else {
        warn!(character = name, "sync connector could not build a runtime");
        return;
    };
    let url = format!("{base}/sync/{name}");

    while !shutdown.load(Ordering::SeqCst) {
        let connection = runtime.block_on(connect_async(&url));
        let (mut ws, _) = match connection {
            Ok(pair) => pair,
            Err(e) => {
                debug!(character = name, "monitor unreachable, retrying: {e}");
                // Sleep in small steps so shutdown stays responsive.
                let wake = Instant::now() + RECONNECT_DELAY;
                while Instant::now() < wake {
                    if shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                continue;
            }
        };
        info!(character = name, "sync connector attached to monitor");

        let mut last_send = Instant::now();
        loop {
            if shutdown.load(Ordering::SeqCst) {
                let _ = runtime.block_on(ws.close(None));
                return;
            }
            match rx.recv_timeout(QUEUE_POLL) {
                Ok(frame) => {
                    if runtime
                        .block_on(ws.send(Message::Text(frame.to_string())))
                        .is_err()
                    {
                        warn!(character = name, "monitor link dropped, reconnecting");
                        break;
                    }
                    last_send = Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if last_send.elapsed() >= HEARTBEAT_INTERVAL {
                        let heartbeat = json!({ "type": "heartbeat" }).to_string();
                        if runtime.block_on(ws.send(Message::Text(heartbeat))).is_err() {
                            break;
                        }
                        last_send = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // Queue owner dropped; the character is gone.
                    let _ = runtime.block_on(ws.close(None));
                    return;
                }
            }
        }
    }
}

/// Wait up to `timeout` for a thread to finish; abandon it otherwise.
/// Returns whether the join succeeded.
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if handle.is_finished() {
            let _ = handle.join();
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    warn!("sync connector did not stop in time, abandoning daemon thread");
    false
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
