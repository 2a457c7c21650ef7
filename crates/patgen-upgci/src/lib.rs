//! CalMAN UPGCI TCP control protocol (port 2100).
//!
//! ```text
//! client ── 0x02 <payload> 0x03 ──►  server     (STX/ETX framing)
//! client ◄─ 0x06 ─────────────────  server     (single ACK byte, always)
//! ```
//!
//! CalMAN enforces a short timeout on the ACK and treats a missing or late
//! one as fatal, so the session never blocks on the render hand-off (unlike
//! the PGenerator protocol) and ACKs every frame whether or not its content
//! made sense. Slow collaborator work (HDR metadata forwarding) is spawned
//! off the session task.

pub mod command;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use patgen_core::{
    Color, Colorimetry, DrawCommand, HdrControl, ModeChangeCallback, PatGenError, SessionError,
    SharedSignal,
};

use crate::command::{to_8bit, Specialty, UpgciCommand};

// ── Constants ─────────────────────────────────────────────────────────────────

pub const UPGCI_PORT: u16 = 2100;

const STX: u8 = 0x02;
const ETX: u8 = 0x03;
const ACK: u8 = 0x06;

const MAX_FRAME_BYTES: usize = 4096;

/// Full-field levels for the SPECIALTY calibration aids (8-bit).
const BRIGHTNESS_LEVEL: u8 = 20;
const CONTRAST_LEVEL: u8 = 235;

// ── UpgciServer ───────────────────────────────────────────────────────────────

/// UPGCI protocol server. One client at a time; the accept loop takes the
/// next client after a disconnect or a `SHUTDOWN`/`QUIT`.
pub struct UpgciServer {
    port: u16,
    state: SharedSignal,
    hdr: Arc<dyn HdrControl>,
    on_mode_change: ModeChangeCallback,
}

impl UpgciServer {
    pub fn new(
        port: u16,
        state: SharedSignal,
        hdr: Arc<dyn HdrControl>,
        on_mode_change: ModeChangeCallback,
    ) -> Self {
        Self { port, state, hdr, on_mode_change }
    }

    pub async fn spawn(self) -> Result<UpgciServerHandle, PatGenError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|source| PatGenError::Bind { service: "upgci", port: self.port, source })?;
        let local_addr = listener.local_addr()?;
        info!("UPGCI server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            self.state,
            self.hdr,
            self.on_mode_change,
            shutdown_rx,
        ));

        Ok(UpgciServerHandle { shutdown: shutdown_tx, task, local_addr })
    }
}

pub struct UpgciServerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl UpgciServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(Duration::from_secs(2), self.task).await.is_err() {
            warn!("UPGCI server task did not stop within 2s");
        }
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    state: SharedSignal,
    hdr: Arc<dyn HdrControl>,
    on_mode_change: ModeChangeCallback,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        state.set_connection_status("UPGCI: waiting for client");

        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => continue,
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("UPGCI accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
            },
        };

        info!("UPGCI client connected from {}", peer);
        state.set_connection_status(format!("UPGCI: client {} connected", peer));

        match run_session(stream, &state, &hdr, &on_mode_change, &mut shutdown).await {
            Ok(SessionEnd::ClientRequested) => {
                info!("UPGCI client {} requested shutdown", peer);
            }
            Ok(SessionEnd::ServerStopping) => {
                info!("UPGCI session with {} ended (server stopping)", peer);
            }
            Err(SessionError::ConnectionClosed) => info!("UPGCI client {} disconnected", peer),
            Err(e) => warn!("UPGCI session with {} failed: {}", peer, e),
        }
        state.set_connection_status("UPGCI: client disconnected");
    }

    info!("UPGCI server stopped");
}

enum SessionEnd {
    ClientRequested,
    ServerStopping,
}

// ── Session ───────────────────────────────────────────────────────────────────

async fn run_session(
    stream: TcpStream,
    state: &SharedSignal,
    hdr: &Arc<dyn HdrControl>,
    on_mode_change: &ModeChangeCallback,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd, SessionError> {
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let payload = tokio::select! {
            _ = shutdown.changed() => return Ok(SessionEnd::ServerStopping),
            res = read_frame(&mut reader) => res?,
        };

        let text = String::from_utf8_lossy(&payload);
        let cmd = UpgciCommand::parse(&text);
        debug!("UPGCI command: {:?}", cmd);

        let close = apply(&cmd, state, hdr, on_mode_change);

        // The ACK goes out immediately after the command is applied;
        // success or failure of its interpretation makes no difference.
        write_ack(&mut write_half).await?;

        if close {
            return Ok(SessionEnd::ClientRequested);
        }
    }
}

/// Interpret one command against the shared state. Returns `true` when the
/// client asked for its connection to be closed.
fn apply(
    cmd: &UpgciCommand,
    state: &SharedSignal,
    hdr: &Arc<dyn HdrControl>,
    on_mode_change: &ModeChangeCallback,
) -> bool {
    match cmd {
        UpgciCommand::Init { version } => {
            info!("UPGCI INIT, protocol version {:?}", version);
        }

        UpgciCommand::Rgb { r, g, b, background, window_percent } => {
            let fg = Color::from_8bit(to_8bit(*r), to_8bit(*g), to_8bit(*b));
            let commands = if *window_percent >= 100.0 {
                vec![DrawCommand::full_field(fg)]
            } else {
                let bg = (*background)
                    .map(|(br, bg_, bb)| {
                        Color::from_8bit(to_8bit(br), to_8bit(bg_), to_8bit(bb))
                    })
                    .unwrap_or(Color::BLACK);
                vec![
                    DrawCommand::full_field(bg),
                    DrawCommand::window(*window_percent, fg),
                ]
            };
            state.set_commands(commands);
        }

        UpgciCommand::ConfHdr { eotf, metadata } => {
            match eotf {
                None => {
                    state.apply_eotf_mode(patgen_core::Eotf::Sdr);
                }
                Some(eotf) => {
                    state.apply_eotf_mode(*eotf);
                    // This is the promoting path: an HDR EOTF pulls
                    // colorimetry and bit depth with it.
                    state.set_colorimetry(Colorimetry::Bt2020);
                    if state.current_configuration().bit_depth < 10 {
                        state.set_bit_depth(10);
                    }
                    if let Some(md) = *metadata {
                        state.set_hdr_metadata(md);
                        let hdr = Arc::clone(hdr);
                        // Forwarded off-session: the ACK may not wait on the
                        // display collaborator.
                        tokio::spawn(async move {
                            if let Err(e) = hdr.apply_static_metadata(md).await {
                                warn!("HDR metadata forwarding failed: {}", e);
                            }
                        });
                    }
                }
            }
            let cfg = state.current_configuration();
            info!(
                "UPGCI CONF_HDR → eotf={} bits={} colorimetry={:?}",
                cfg.eotf, cfg.bit_depth, cfg.colorimetry
            );
            on_mode_change(cfg.is_hdr(), cfg.bit_depth, cfg.eotf);
        }

        UpgciCommand::ConfLevelBits { bits } => {
            state.set_bit_depth(*bits);
            let cfg = state.current_configuration();
            info!("UPGCI CONF_LEVEL Bits → {}", bits);
            on_mode_change(cfg.is_hdr(), cfg.bit_depth, cfg.eotf);
        }

        UpgciCommand::GammaHdr | UpgciCommand::GammaSdr => {
            let want_hdr = matches!(cmd, UpgciCommand::GammaHdr);
            let cfg = state.current_configuration();
            if cfg.is_hdr() != want_hdr {
                state.set_mode(cfg.bit_depth, want_hdr);
                let cfg = state.current_configuration();
                info!("UPGCI Gamma toggle → eotf={} bits={}", cfg.eotf, cfg.bit_depth);
                on_mode_change(cfg.is_hdr(), cfg.bit_depth, cfg.eotf);
            }
        }

        UpgciCommand::ConfLevelRange { range } => {
            info!("UPGCI CONF_LEVEL Range {:?} (not modeled)", range);
        }
        UpgciCommand::ConfLevelFormat { format } => {
            info!("UPGCI CONF_LEVEL Format {:?} (not modeled)", format);
        }

        UpgciCommand::Specialty(Specialty::Brightness) => {
            state.set_commands(vec![DrawCommand::full_field(Color::grey_8bit(BRIGHTNESS_LEVEL))]);
        }
        UpgciCommand::Specialty(Specialty::Contrast) => {
            state.set_commands(vec![DrawCommand::full_field(Color::grey_8bit(CONTRAST_LEVEL))]);
        }
        UpgciCommand::Specialty(Specialty::Other(name)) => {
            info!("UPGCI unknown specialty {:?}", name);
        }

        UpgciCommand::Update => debug!("UPGCI UPDATE"),
        UpgciCommand::Status | UpgciCommand::IsAlive => {}

        UpgciCommand::Shutdown | UpgciCommand::Quit => return true,

        UpgciCommand::Skip { reason } => {
            warn!("UPGCI skipping command: {}", reason);
        }
    }
    false
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Read one `STX <payload> ETX` frame. Bytes before the STX are noise and
/// discarded. An over-long frame is dispatched truncated rather than
/// stalling the session (the ACK must keep flowing).
async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> Result<BytesMut, SessionError> {
    // Hunt for the STX.
    loop {
        match reader.read_u8().await {
            Ok(STX) => break,
            Ok(other) => debug!("UPGCI discarding pre-frame byte 0x{:02X}", other),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(SessionError::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut buf = BytesMut::with_capacity(128);
    loop {
        match reader.read_u8().await {
            Ok(ETX) => return Ok(buf),
            Ok(byte) => {
                buf.put_u8(byte);
                if buf.len() >= MAX_FRAME_BYTES {
                    warn!("UPGCI frame exceeded {} bytes; dispatching truncated", MAX_FRAME_BYTES);
                    return Ok(buf);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(SessionError::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn write_ack(writer: &mut OwnedWriteHalf) -> Result<(), SessionError> {
    writer.write_u8(ACK).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use patgen_core::{
        ColorFormat, Colorimetry, Eotf, HdrControl, HdrStaticMetadata, PatGenError, SignalState,
    };

    use super::{UpgciServer, UpgciServerHandle, ACK, ETX, STX};

    #[derive(Default)]
    struct RecordingHdrControl {
        metadata: Mutex<Option<HdrStaticMetadata>>,
    }

    #[async_trait]
    impl HdrControl for RecordingHdrControl {
        async fn apply_static_metadata(
            &self,
            metadata: HdrStaticMetadata,
        ) -> Result<(), PatGenError> {
            *self.metadata.lock().unwrap() = Some(metadata);
            Ok(())
        }

        async fn apply_signal_settings(
            &self,
            _eotf: Eotf,
            _color_format: ColorFormat,
            _colorimetry: Colorimetry,
            _bit_depth: u8,
        ) -> Result<(), PatGenError> {
            Ok(())
        }
    }

    type ModeLog = Arc<Mutex<Vec<(bool, u8, Eotf)>>>;

    async fn start_server() -> (
        UpgciServerHandle,
        Arc<SignalState>,
        Arc<RecordingHdrControl>,
        ModeLog,
    ) {
        let state = Arc::new(SignalState::new());
        let hdr = Arc::new(RecordingHdrControl::default());
        let log: ModeLog = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let server = UpgciServer::new(
            0,
            Arc::clone(&state),
            hdr.clone(),
            Arc::new(move |is_hdr, bits, eotf| {
                log2.lock().unwrap().push((is_hdr, bits, eotf));
            }),
        );
        let handle = server.spawn().await.expect("bind ephemeral port");
        (handle, state, hdr, log)
    }

    async fn send_framed(stream: &mut TcpStream, payload: &str) {
        stream.write_all(&[STX]).await.unwrap();
        stream.write_all(payload.as_bytes()).await.unwrap();
        stream.write_all(&[ETX]).await.unwrap();
        stream.flush().await.unwrap();
    }

    async fn expect_ack(stream: &mut TcpStream) {
        let mut byte = [0u8; 1];
        tokio::time::timeout(Duration::from_secs(1), stream.read_exact(&mut byte))
            .await
            .expect("ACK must arrive promptly")
            .unwrap();
        assert_eq!(byte[0], ACK);
    }

    #[tokio::test]
    async fn every_message_gets_exactly_one_ack() {
        let (handle, _state, _hdr, _log) = start_server().await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        for payload in ["INIT:2.1", "RGB_S:512,512,512,10", "GARBAGE!!", "RGB_S:broken"] {
            send_framed(&mut client, payload).await;
            expect_ack(&mut client).await;
        }

        // Exactly one: nothing further buffered after the last ACK.
        let mut byte = [0u8; 1];
        let extra = tokio::time::timeout(Duration::from_millis(200), client.read(&mut byte)).await;
        assert!(extra.is_err(), "no bytes other than one ACK per message");

        handle.stop().await;
    }

    #[tokio::test]
    async fn rgb_window_uses_black_background() {
        let (handle, state, _hdr, _log) = start_server().await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        send_framed(&mut client, "RGB_S:1023,0,0,10").await;
        expect_ack(&mut client).await;

        let commands = state.get_commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].fill, patgen_core::Fill::Solid(patgen_core::Color::BLACK));
        let patgen_core::Fill::Solid(fg) = commands[1].fill else { panic!("solid expected") };
        // 1023 → 255 via floor division.
        assert!((fg.r - 1.0).abs() < 1e-6);

        handle.stop().await;
    }

    #[tokio::test]
    async fn rgb_full_field_at_hundred_percent() {
        let (handle, state, _hdr, _log) = start_server().await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        send_framed(&mut client, "RGB_B:512,512,512,100").await;
        expect_ack(&mut client).await;

        let commands = state.get_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].rect, patgen_core::Rect::FULL);

        handle.stop().await;
    }

    #[tokio::test]
    async fn conf_hdr_promotes_and_forwards_metadata() {
        let (handle, state, hdr, log) = start_server().await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        send_framed(
            &mut client,
            "CONF_HDR:HDR10,0.708,0.292,0.170,0.797,0.131,0.046,0.3127,0.3290,0,1000,400,1000",
        )
        .await;
        expect_ack(&mut client).await;

        let cfg = state.current_configuration();
        assert_eq!(cfg.eotf, Eotf::Pq);
        assert_eq!(cfg.colorimetry, Colorimetry::Bt2020);
        assert!(cfg.bit_depth >= 10);
        let md = cfg.hdr_metadata.expect("metadata stored");
        assert_eq!((md.max_cll, md.max_fall, md.max_mastering_luminance), (1000, 400, 1000));

        assert_eq!(log.lock().unwrap().as_slice(), &[(true, 10, Eotf::Pq)]);

        // Metadata forwarding is spawned; give it a beat.
        tokio::time::timeout(Duration::from_secs(1), async {
            while hdr.metadata.lock().unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("metadata must reach the HDR collaborator");

        handle.stop().await;
    }

    #[tokio::test]
    async fn conf_hdr_off_returns_to_sdr() {
        let (handle, state, _hdr, log) = start_server().await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        send_framed(&mut client, "CONF_HDR:HLG").await;
        expect_ack(&mut client).await;
        assert_eq!(state.current_configuration().eotf, Eotf::Hlg);

        send_framed(&mut client, "CONF_HDR:OFF").await;
        expect_ack(&mut client).await;
        assert_eq!(state.current_configuration().eotf, Eotf::Sdr);

        let calls = log.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(!calls[1].0, "second call reports SDR");

        handle.stop().await;
    }

    #[tokio::test]
    async fn gamma_toggle_fires_only_on_change() {
        let (handle, state, _hdr, log) = start_server().await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        send_framed(&mut client, "CONF_LEVEL:Gamma-SDR").await;
        expect_ack(&mut client).await;
        // Already SDR → no callback.
        assert!(log.lock().unwrap().is_empty());

        send_framed(&mut client, "CONF_LEVEL:Gamma-HDR").await;
        expect_ack(&mut client).await;
        assert_eq!(state.current_configuration().eotf, Eotf::Pq);
        assert_eq!(log.lock().unwrap().len(), 1);

        send_framed(&mut client, "CONF_LEVEL:Gamma-HDR").await;
        expect_ack(&mut client).await;
        assert_eq!(log.lock().unwrap().len(), 1, "no change, no callback");

        handle.stop().await;
    }

    #[tokio::test]
    async fn bits_change_fires_callback() {
        let (handle, state, _hdr, log) = start_server().await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        send_framed(&mut client, "CONF_LEVEL:Bits 12").await;
        expect_ack(&mut client).await;

        assert_eq!(state.current_configuration().bit_depth, 12);
        assert_eq!(log.lock().unwrap().as_slice(), &[(false, 12, Eotf::Sdr)]);

        handle.stop().await;
    }

    #[tokio::test]
    async fn specialty_patterns() {
        let (handle, state, _hdr, _log) = start_server().await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        send_framed(&mut client, "SPECIALTY:BRIGHTNESS").await;
        expect_ack(&mut client).await;
        let commands = state.get_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(
            commands[0].fill,
            patgen_core::Fill::Solid(patgen_core::Color::grey_8bit(20))
        );

        send_framed(&mut client, "SPECIALTY:CONTRAST").await;
        expect_ack(&mut client).await;
        assert_eq!(
            state.get_commands()[0].fill,
            patgen_core::Fill::Solid(patgen_core::Color::grey_8bit(235))
        );

        handle.stop().await;
    }

    #[tokio::test]
    async fn shutdown_closes_connection_but_server_keeps_listening() {
        let (handle, _state, _hdr, _log) = start_server().await;

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        send_framed(&mut client, "SHUTDOWN").await;
        expect_ack(&mut client).await;

        // Server closes its side after the ACK.
        let mut byte = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(1), client.read(&mut byte))
            .await
            .expect("read must resolve")
            .unwrap();
        assert_eq!(n, 0, "connection closed after SHUTDOWN");

        // A new client is welcome.
        let mut next = TcpStream::connect(handle.local_addr()).await.unwrap();
        send_framed(&mut next, "IS_ALIVE").await;
        expect_ack(&mut next).await;

        handle.stop().await;
    }
}
