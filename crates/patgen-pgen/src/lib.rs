//! Legacy PGenerator TCP control protocol (port 85).
//!
//! Request/response over a single client connection at a time:
//!
//! ```text
//! client ── <payload> 0x02 0x0D ──►  server      (STX,CR terminator pair)
//! client ◄─ <payload> 0x00 ───────  server      (only for query commands)
//! ```
//!
//! Each request is fully applied to the shared [`patgen_core::SignalState`]
//! before the response goes out, and the session blocks on the render
//! hand-off ([`patgen_core::SignalState::wait_not_pending`]) before reading
//! the next request;
//! calibration tools rely on the pattern being on screen when the reply
//! arrives.

pub mod command;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use patgen_core::{
    Color, DrawCommand, PatGenError, Resolution, SessionError, SharedSignal,
};

use crate::command::PgenRequest;

// ── Constants ─────────────────────────────────────────────────────────────────

pub const PGEN_PORT: u16 = 85;

/// Requests longer than this are handed to the dispatcher as-is rather than
/// letting a CR-less client stall the session forever.
const MAX_REQUEST_BYTES: usize = 4096;

const FIXED_GPU_MEMORY_MB: u32 = 192;

// ── PgenServer ────────────────────────────────────────────────────────────────

/// PGenerator protocol server. One client at a time; the accept loop rebinds
/// the session after every disconnect.
pub struct PgenServer {
    port: u16,
    resolution: Resolution,
    passive_pattern: Option<Color>,
    state: SharedSignal,
}

impl PgenServer {
    pub fn new(
        port: u16,
        resolution: Resolution,
        passive_pattern: Option<Color>,
        state: SharedSignal,
    ) -> Self {
        Self { port, resolution, passive_pattern, state }
    }

    /// Bind the listening socket and spawn the accept loop.
    ///
    /// Bind failure (port in use, missing privilege for port 85) is fatal to
    /// this server's start and surfaced here; everything later is session
    /// recovery.
    pub async fn spawn(self) -> Result<PgenServerHandle, PatGenError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|source| PatGenError::Bind { service: "pgen", port: self.port, source })?;
        let local_addr = listener.local_addr()?;
        info!("PGen server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = self.state.clone();
        let task = tokio::spawn(accept_loop(
            listener,
            self.resolution,
            self.passive_pattern,
            self.state,
            shutdown_rx,
        ));

        Ok(PgenServerHandle { shutdown: shutdown_tx, task, local_addr, state })
    }
}

/// Running PGen server. [`stop`](PgenServerHandle::stop) flips the shutdown
/// flag, releases any pending-waiter and joins the task with a bounded
/// timeout.
pub struct PgenServerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
    state: SharedSignal,
}

impl PgenServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        // Wake a session parked in wait_not_pending so it can observe the flag.
        self.state.clear_pending();
        if tokio::time::timeout(Duration::from_secs(2), self.task).await.is_err() {
            warn!("PGen server task did not stop within 2s");
        }
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    resolution: Resolution,
    passive_pattern: Option<Color>,
    state: SharedSignal,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        state.set_connection_status("PGen: waiting for client");

        // Let the consumer drain the previous update before taking a client.
        tokio::select! {
            _ = shutdown.changed() => continue,
            _ = state.wait_not_pending() => {}
        }

        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => continue,
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("PGen accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
            },
        };

        info!("PGen client connected from {}", peer);
        state.set_connection_status(format!("PGen: client {} connected", peer));

        match run_session(stream, resolution, passive_pattern, &state, &mut shutdown).await {
            Ok(()) => info!("PGen session with {} ended (server stopping)", peer),
            Err(SessionError::ConnectionClosed) => {
                info!("PGen client {} disconnected", peer);
            }
            Err(e) => warn!("PGen session with {} failed: {}", peer, e),
        }
        state.set_connection_status("PGen: client disconnected");
    }

    info!("PGen server stopped");
}

// ── Session ───────────────────────────────────────────────────────────────────

async fn run_session(
    stream: TcpStream,
    resolution: Resolution,
    passive_pattern: Option<Color>,
    state: &SharedSignal,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SessionError> {
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        // Backpressure: the previous command must be fully consumed before
        // the next request is read.
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = state.wait_not_pending() => {}
        }
        if *shutdown.borrow() {
            return Ok(());
        }

        let raw = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            res = read_request(&mut reader) => res?,
        };

        let request = PgenRequest::parse(&raw);
        debug!("PGen request: {:?}", request);
        let response = apply(&request, resolution, passive_pattern, state);

        // Pending is marked even for a no-op dispatch so response and next
        // receive stay in lock-step with a real state hand-off.
        state.set_pending();

        if let Some(payload) = response {
            write_response(&mut write_half, &payload).await?;
        }
    }
}

/// Mutate the shared state for one request; returns the response payload for
/// query commands.
fn apply(
    request: &PgenRequest,
    resolution: Resolution,
    passive_pattern: Option<Color>,
    state: &SharedSignal,
) -> Option<Vec<u8>> {
    match request {
        PgenRequest::GetResolution => Some(format!("OK:{}", resolution).into_bytes()),
        PgenRequest::GetGpuMemory => Some(format!("OK:{}", FIXED_GPU_MEMORY_MB).into_bytes()),
        PgenRequest::TestTemplate => {
            let commands = match passive_pattern {
                Some(color) => vec![DrawCommand::full_field(color)],
                None => Vec::new(),
            };
            state.set_commands(commands);
            None
        }
        PgenRequest::Rectangle { width, height, color, background } => {
            let (r, g, b) = *color;
            let (bg_r, bg_g, bg_b) = *background;
            state.set_commands(vec![
                DrawCommand::full_field(Color::from_8bit(bg_r, bg_g, bg_b)),
                DrawCommand::centered_pixels(*width, *height, resolution, Color::from_8bit(r, g, b)),
            ]);
            None
        }
        PgenRequest::Ignored | PgenRequest::Skip => None,
        PgenRequest::Unknown => {
            // Unknown command = show nothing.
            state.set_commands(Vec::new());
            None
        }
    }
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Read one request, scanning for the `0x02 0x0D` terminator pair. The pair
/// is stripped from the returned payload. An over-long request returns
/// whatever was buffered so far instead of stalling the session.
async fn read_request(reader: &mut BufReader<OwnedReadHalf>) -> Result<Bytes, SessionError> {
    let mut buf = BytesMut::with_capacity(256);
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(SessionError::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        };

        if byte == 0x0D && buf.last() == Some(&0x02) {
            buf.truncate(buf.len() - 1);
            return Ok(buf.freeze());
        }

        buf.put_u8(byte);
        if buf.len() >= MAX_REQUEST_BYTES {
            warn!("PGen request exceeded {} bytes; dispatching truncated", MAX_REQUEST_BYTES);
            return Ok(buf.freeze());
        }
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, payload: &[u8]) -> Result<(), SessionError> {
    writer.write_all(payload).await?;
    writer.write_u8(0x00).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use patgen_core::{Color, Fill, Rect, Resolution, SignalState};

    use super::{PgenServer, PgenServerHandle};

    async fn start_server(passive: Option<Color>) -> (PgenServerHandle, Arc<SignalState>) {
        let state = Arc::new(SignalState::new());
        let server = PgenServer::new(0, Resolution::FHD, passive, Arc::clone(&state));
        let handle = server.spawn().await.expect("bind ephemeral port");
        (handle, state)
    }

    async fn send(stream: &mut TcpStream, payload: &[u8]) {
        stream.write_all(payload).await.unwrap();
        stream.write_all(&[0x02, 0x0D]).await.unwrap();
        stream.flush().await.unwrap();
    }

    async fn read_reply(stream: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.unwrap();
            if byte[0] == 0x00 {
                return out;
            }
            out.push(byte[0]);
        }
    }

    /// Wait until the server has applied a command (pending set), then act
    /// as the render consumer and clear it.
    async fn drain(state: &SignalState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !state.is_pending() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("server must mark the update pending");
        state.clear_pending();
    }

    #[tokio::test]
    async fn get_resolution_replies_null_terminated() {
        let (handle, state) = start_server(None).await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        send(&mut client, b"CMD:GET_RESOLUTION").await;
        let reply = read_reply(&mut client).await;
        assert_eq!(reply, b"OK:1920x1080");
        drain(&state).await;

        send(&mut client, b"CMD:GET_GPU_MEMORY").await;
        assert_eq!(read_reply(&mut client).await, b"OK:192");

        drain(&state).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn rectangle_builds_background_plus_window() {
        let (handle, state) = start_server(None).await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        send(&mut client, b"RGB=RECTANGLE;100;100;0;255;0;0;0;0;0").await;
        drain(&state).await;

        let commands = state.get_commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].rect, Rect::FULL);
        assert_eq!(commands[0].fill, Fill::Solid(Color::BLACK));

        let Fill::Solid(fg) = commands[1].fill else { panic!("solid fill expected") };
        assert!((fg.r - 1.0).abs() < 1e-6 && fg.g == 0.0 && fg.b == 0.0);
        // 100 px of 1920/1080 reference, centered.
        assert!((commands[1].rect.width - 100.0 / 1920.0 * 2.0).abs() < 1e-6);
        assert!((commands[1].rect.height - 100.0 / 1080.0 * 2.0).abs() < 1e-6);

        handle.stop().await;
    }

    #[tokio::test]
    async fn unknown_command_blanks_screen_without_reply() {
        let (handle, state) = start_server(None).await;
        state.set_commands(vec![patgen_core::DrawCommand::full_field(Color::WHITE)]);
        state.clear_pending();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        send(&mut client, b"FOO").await;
        drain(&state).await;

        assert!(state.get_commands().is_empty());

        // No response bytes for an unknown command.
        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(200), client.read(&mut byte)).await;
        assert!(read.is_err(), "unknown command must not produce a reply");

        handle.stop().await;
    }

    #[tokio::test]
    async fn malformed_rectangle_keeps_session_alive() {
        let (handle, state) = start_server(None).await;
        state.set_commands(vec![patgen_core::DrawCommand::full_field(Color::WHITE)]);
        state.clear_pending();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        send(&mut client, b"RGB=RECTANGLE;100;oops;0;255;0;0;0;0;0").await;
        drain(&state).await;

        // Skip: no state change, but the session keeps answering.
        assert_eq!(state.get_commands().len(), 1);
        send(&mut client, b"CMD:GET_RESOLUTION").await;
        assert_eq!(read_reply(&mut client).await, b"OK:1920x1080");

        drain(&state).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn testtemplate_reapplies_passive_pattern() {
        let passive = Color::grey_8bit(128);
        let (handle, state) = start_server(Some(passive)).await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        send(&mut client, b"TESTTEMPLATE:idle").await;
        drain(&state).await;

        let commands = state.get_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].fill, Fill::Solid(passive));

        handle.stop().await;
    }

    #[tokio::test]
    async fn accepts_next_client_after_disconnect() {
        let (handle, state) = start_server(None).await;

        let mut first = TcpStream::connect(handle.local_addr()).await.unwrap();
        send(&mut first, b"CMD:GET_GPU_MEMORY").await;
        assert_eq!(read_reply(&mut first).await, b"OK:192");
        drain(&state).await;
        drop(first);

        let mut second = TcpStream::connect(handle.local_addr()).await.unwrap();
        send(&mut second, b"CMD:GET_GPU_MEMORY").await;
        assert_eq!(read_reply(&mut second).await, b"OK:192");

        drain(&state).await;
        handle.stop().await;
    }
}
