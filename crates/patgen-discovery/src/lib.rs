//! UDP discovery for calibration tools (port 1977).
//!
//! CalMAN-family software broadcasts a fixed probe string and expects every
//! generator on the subnet to answer with its name:
//!
//! ```text
//! tool ── "Who is a PGenerator" ──► broadcast:1977
//! tool ◄─ "I am a PGenerator <device-name>" ── unicast reply
//! ```
//!
//! Anything that is not the exact probe payload is ignored.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use patgen_core::PatGenError;

pub const DISCOVERY_PORT: u16 = 1977;

pub const PROBE: &str = "Who is a PGenerator";
pub const REPLY_PREFIX: &str = "I am a PGenerator";

/// Default device name when none is configured: the host's name, falling
/// back to a fixed label.
pub fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "PatGen".to_owned())
}

// ── DiscoveryResponder ────────────────────────────────────────────────────────

pub struct DiscoveryResponder {
    port: u16,
    device_name: String,
}

impl DiscoveryResponder {
    pub fn new(port: u16, device_name: impl Into<String>) -> Self {
        Self { port, device_name: device_name.into() }
    }

    pub async fn spawn(self) -> Result<DiscoveryHandle, PatGenError> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .await
            .map_err(|source| PatGenError::Bind { service: "discovery", port: self.port, source })?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        info!("Discovery responder listening on {} as '{}'", local_addr, self.device_name);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(respond_loop(socket, self.device_name, shutdown_rx));

        Ok(DiscoveryHandle { shutdown: shutdown_tx, task, local_addr })
    }
}

pub struct DiscoveryHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl DiscoveryHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(Duration::from_secs(2), self.task).await.is_err() {
            warn!("Discovery task did not stop within 2s");
        }
    }
}

async fn respond_loop(socket: UdpSocket, device_name: String, mut shutdown: watch::Receiver<bool>) {
    let reply = format!("{} {}", REPLY_PREFIX, device_name);
    let mut buf = [0u8; 512];

    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
                continue;
            }
            res = socket.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    // Socket errors while stopping are expected noise.
                    if *shutdown.borrow() { break; }
                    warn!("Discovery recv failed: {}", e);
                    continue;
                }
            },
        };

        if &buf[..len] == PROBE.as_bytes() {
            debug!("Discovery probe from {}", peer);
            if let Err(e) = socket.send_to(reply.as_bytes(), peer).await {
                warn!("Discovery reply to {} failed: {}", peer, e);
            }
        } else {
            debug!("Discovery ignoring {} bytes from {}", len, peer);
        }
    }

    info!("Discovery responder stopped");
}
