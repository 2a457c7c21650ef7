use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use patgen_core::{
    ColorFormat, Colorimetry, Eotf, GeneratorConfig, HdrControl, HdrStaticMetadata,
    ModeChangeCallback, PatGenError, Resolution, SharedSignal, SignalState,
};
use patgen_discovery::DiscoveryResponder;
use patgen_pgen::PgenServer;
use patgen_resolve::ResolveClient;
use patgen_upgci::UpgciServer;

/// Main daemon loop.
///
/// # Flow
/// 1. Read [`GeneratorConfig`] defaults + environment overrides
/// 2. Construct the shared [`SignalState`] (one per process, injected
///    everywhere)
/// 3. Bind discovery (UDP 1977), PGen (TCP 85), UPGCI (TCP 2100); connect
///    out to Resolve when a host is configured
/// 4. Run the render drain until Ctrl-C, then stop every service
pub async fn run() -> Result<()> {
    let config = config_from_env();
    info!(
        "Device '{}' at {}, PGen:{} UPGCI:{} discovery:{}",
        config.device_name,
        config.resolution,
        config.pgen_port,
        config.upgci_port,
        config.discovery_port
    );

    let state: SharedSignal = Arc::new(SignalState::new());
    let hdr: Arc<dyn HdrControl> = Arc::new(LoggingHdrControl);

    // CalMAN mode changes fan out to the display collaborator without
    // blocking the protocol session (the ACK deadline is tight).
    let on_mode_change: ModeChangeCallback = {
        let state = Arc::clone(&state);
        let hdr = Arc::clone(&hdr);
        Arc::new(move |is_hdr, bit_depth, eotf| {
            info!("Signal mode change: hdr={} bits={} eotf={}", is_hdr, bit_depth, eotf);
            let cfg = state.current_configuration();
            let hdr = Arc::clone(&hdr);
            tokio::spawn(async move {
                if let Err(e) = hdr
                    .apply_signal_settings(eotf, cfg.color_format, cfg.colorimetry, bit_depth)
                    .await
                {
                    warn!("Signal settings forwarding failed: {}", e);
                }
            });
        })
    };

    let discovery = DiscoveryResponder::new(config.discovery_port, config.device_name.clone())
        .spawn()
        .await?;
    let pgen = PgenServer::new(
        config.pgen_port,
        config.resolution,
        config.passive_pattern,
        Arc::clone(&state),
    )
    .spawn()
    .await?;
    let upgci = UpgciServer::new(config.upgci_port, Arc::clone(&state), hdr, on_mode_change)
        .spawn()
        .await?;

    let resolve = config.resolve_host.as_ref().map(|host| {
        info!("Resolve client targeting {}:{}", host, config.resolve_port);
        ResolveClient::new(host.clone(), config.resolve_port, Arc::clone(&state)).spawn()
    });

    let render = spawn_render_drain(Arc::clone(&state));

    info!("All services up; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Some(client) = resolve {
        client.stop().await;
    }
    upgci.stop().await;
    pgen.stop().await;
    discovery.stop().await;
    render.abort();

    Ok(())
}

// ── Render drain ──────────────────────────────────────────────────────────────

/// Headless stand-in for the GPU consumer: once per output frame it
/// snapshots the command list when an update is pending and clears the
/// flag, which is the hand-off PGenerator's request/response cycle blocks
/// on. A real renderer replaces this loop through the same
/// `get_commands` / `clear_pending` surface.
fn spawn_render_drain(state: SharedSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(16));
        loop {
            interval.tick().await;
            if state.is_pending() {
                let commands = state.get_commands();
                let cfg = state.current_configuration();
                debug!(
                    "Presenting {} draw command(s) ({} bits, {})",
                    commands.len(),
                    cfg.bit_depth,
                    cfg.eotf
                );
                state.clear_pending();
            }
        }
    })
}

// ── HDR collaborator stub ─────────────────────────────────────────────────────

/// Logs what the platform HDR layer would be told. The real negotiation
/// stack (EGL colorspace / kernel dataspace plumbing) lives outside this
/// daemon and implements [`HdrControl`] in its place.
struct LoggingHdrControl;

#[async_trait]
impl HdrControl for LoggingHdrControl {
    async fn apply_static_metadata(&self, metadata: HdrStaticMetadata) -> Result<(), PatGenError> {
        info!(
            "HDR static metadata: maxCLL={} maxFALL={} maxDML={}",
            metadata.max_cll, metadata.max_fall, metadata.max_mastering_luminance
        );
        Ok(())
    }

    async fn apply_signal_settings(
        &self,
        eotf: Eotf,
        color_format: ColorFormat,
        colorimetry: Colorimetry,
        bit_depth: u8,
    ) -> Result<(), PatGenError> {
        info!(
            "Signal settings: eotf={} format={:?} colorimetry={:?} bits={}",
            eotf, color_format, colorimetry, bit_depth
        );
        Ok(())
    }
}

// ── Environment configuration ─────────────────────────────────────────────────

/// Defaults overridden from the environment:
/// `PATGEN_DEVICE_NAME`, `PATGEN_RESOLUTION` (`1920x1080`),
/// `PATGEN_PGEN_PORT`, `PATGEN_UPGCI_PORT`, `PATGEN_DISCOVERY_PORT`,
/// `PATGEN_RESOLVE_HOST`, `PATGEN_RESOLVE_PORT`,
/// `PATGEN_PASSIVE_PATTERN` (`r,g,b` 8-bit).
fn config_from_env() -> GeneratorConfig {
    let mut config = GeneratorConfig {
        device_name: patgen_discovery::default_device_name(),
        ..GeneratorConfig::default()
    };

    if let Ok(name) = std::env::var("PATGEN_DEVICE_NAME") {
        config.device_name = name;
    }
    if let Some(resolution) = env_parsed("PATGEN_RESOLUTION", parse_resolution) {
        config.resolution = resolution;
    }
    if let Some(port) = env_parsed("PATGEN_PGEN_PORT", |s| s.parse().ok()) {
        config.pgen_port = port;
    }
    if let Some(port) = env_parsed("PATGEN_UPGCI_PORT", |s| s.parse().ok()) {
        config.upgci_port = port;
    }
    if let Some(port) = env_parsed("PATGEN_DISCOVERY_PORT", |s| s.parse().ok()) {
        config.discovery_port = port;
    }
    if let Ok(host) = std::env::var("PATGEN_RESOLVE_HOST") {
        if !host.is_empty() {
            config.resolve_host = Some(host);
        }
    }
    if let Some(port) = env_parsed("PATGEN_RESOLVE_PORT", |s| s.parse().ok()) {
        config.resolve_port = port;
    }
    if let Some(color) = env_parsed("PATGEN_PASSIVE_PATTERN", parse_passive_pattern) {
        config.passive_pattern = Some(color);
    }

    config
}

fn env_parsed<T>(key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!("Ignoring unparseable {}={:?}", key, raw);
    }
    parsed
}

fn parse_resolution(raw: &str) -> Option<Resolution> {
    let (w, h) = raw.split_once(['x', 'X'])?;
    Some(Resolution::new(w.trim().parse().ok()?, h.trim().parse().ok()?))
}

fn parse_passive_pattern(raw: &str) -> Option<patgen_core::Color> {
    let mut parts = raw.split(',').map(|p| p.trim().parse::<u8>());
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(Ok(r)), Some(Ok(g)), Some(Ok(b)), None) => {
            Some(patgen_core::Color::from_8bit(r, g, b))
        }
        _ => None,
    }
}
