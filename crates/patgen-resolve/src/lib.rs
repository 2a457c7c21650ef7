//! Resolve / LightSpace pattern **client**.
//!
//! Unlike the other services this one dials out: calibration suites in the
//! Resolve family run their own TCP server and expect the generator to
//! connect to it. Each frame on the wire is a 4-byte big-endian length
//! prefix followed by that many bytes of UTF-8 XML:
//!
//! ```text
//! generator ──► connect host:20002
//! generator ◄── u32 BE length │ <xml…>      (one pattern per frame)
//! ```
//!
//! Decoded frames replace the shared draw-command list wholesale. The
//! client reconnects with a bounded delay after any disconnect and skips
//! malformed frames without dropping the connection.

pub mod xml;

use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use patgen_core::SharedSignal;

pub const DEFAULT_RESOLVE_PORT: u16 = 20002;

const MAX_FRAME_BYTES: usize = 1_048_576;
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

// ── ResolveClient ─────────────────────────────────────────────────────────────

pub struct ResolveClient {
    host: String,
    port: u16,
    state: SharedSignal,
}

impl ResolveClient {
    pub fn new(host: impl Into<String>, port: u16, state: SharedSignal) -> Self {
        Self { host: host.into(), port, state }
    }

    /// Spawn the connect/reconnect loop. Connection failures are not fatal
    /// (the loop retries until stopped).
    pub fn spawn(self) -> ResolveClientHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(connect_loop(self.host, self.port, self.state, shutdown_rx));
        ResolveClientHandle { shutdown: shutdown_tx, task }
    }
}

pub struct ResolveClientHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ResolveClientHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(Duration::from_secs(2), self.task).await.is_err() {
            warn!("Resolve client task did not stop within 2s");
        }
    }
}

// ── Connect / receive loops ───────────────────────────────────────────────────

async fn connect_loop(
    host: String,
    port: u16,
    state: SharedSignal,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let stream = tokio::select! {
            _ = shutdown.changed() => continue,
            res = TcpStream::connect((host.as_str(), port)) => res,
        };

        match stream {
            Ok(stream) => {
                info!("Resolve connected to {}:{}", host, port);
                state.set_connection_status(format!("Resolve: connected to {}:{}", host, port));
                if let Err(e) = recv_loop(stream, &state, &mut shutdown).await {
                    debug!("Resolve session ended: {:#}", e);
                }
                state.set_connection_status("Resolve: disconnected");
            }
            Err(e) => {
                debug!("Resolve connect to {}:{} failed: {}", host, port, e);
            }
        }

        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }

    info!("Resolve client stopped");
}

async fn recv_loop(
    mut stream: TcpStream,
    state: &SharedSignal,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            res = read_frame(&mut stream) => res?,
        };

        match xml::decode_frame(&frame) {
            Ok(commands) => {
                debug!("Resolve frame → {} draw command(s)", commands.len());
                state.set_commands(commands);
            }
            Err(e) => {
                // Bad frame, good connection: skip and keep reading.
                warn!("Resolve frame decode failed: {:#}", e);
            }
        }
    }
}

/// Read one `u32 BE length | body` frame.
async fn read_frame(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.context("reading frame length")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("Frame too large: {} bytes", len);
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.context("reading frame body")?;
    Ok(body)
}
