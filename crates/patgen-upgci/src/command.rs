//! UPGCI command grammar.
//!
//! A message splits on the first `:` into command type and comma-separated
//! parameters. Parse failures map to [`UpgciCommand::Skip`]: the session
//! logs them, keeps running and still ACKs, because CalMAN treats a missing
//! ACK as fatal.

use patgen_core::{Eotf, HdrStaticMetadata};

// ── 10-bit → 8-bit conversion ─────────────────────────────────────────────────

/// CalMAN sends 10-bit component values; the render path is 8-bit. The
/// conversion is integer floor division, not rounding, for bit-for-bit
/// interoperability with what the calibration tools expect.
pub fn to_8bit(value: u16) -> u8 {
    ((value.min(1023) as u32 * 256) / 1024) as u8
}

// ── UpgciCommand ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum UpgciCommand {
    Init { version: String },
    /// `RGB_S` / `RGB_B` / `RGB_A`: 10-bit color + window percentage, with
    /// an optional explicit background (`RGB_A`).
    Rgb {
        r: u16,
        g: u16,
        b: u16,
        background: Option<(u16, u16, u16)>,
        window_percent: f32,
    },
    /// `CONF_HDR`: `eotf: None` means "force SDR".
    ConfHdr {
        eotf: Option<Eotf>,
        metadata: Option<HdrStaticMetadata>,
    },
    ConfLevelBits { bits: u8 },
    ConfLevelRange { range: String },
    ConfLevelFormat { format: String },
    GammaHdr,
    GammaSdr,
    Specialty(Specialty),
    Update,
    Status,
    IsAlive,
    Shutdown,
    Quit,
    /// Unparseable or unrecognized: log, no state change, still ACK.
    Skip { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Specialty {
    Brightness,
    Contrast,
    Other(String),
}

impl UpgciCommand {
    pub fn parse(payload: &str) -> Self {
        let payload = payload.trim();
        let (kind, params) = match payload.split_once(':') {
            Some((kind, params)) => (kind, params),
            None => (payload, ""),
        };

        match kind {
            "INIT" => Self::Init { version: params.trim().to_owned() },
            "RGB_S" | "RGB_B" => parse_rgb(params, false),
            "RGB_A" => parse_rgb(params, true),
            "CONF_HDR" => parse_conf_hdr(params),
            "CONF_LEVEL" => parse_conf_level(params),
            "SPECIALTY" => match params.trim() {
                "BRIGHTNESS" => Self::Specialty(Specialty::Brightness),
                "CONTRAST" => Self::Specialty(Specialty::Contrast),
                other => Self::Specialty(Specialty::Other(other.to_owned())),
            },
            "UPDATE" => Self::Update,
            "STATUS" => Self::Status,
            "IS_ALIVE" => Self::IsAlive,
            "SHUTDOWN" => Self::Shutdown,
            "QUIT" => Self::Quit,
            other => Self::Skip { reason: format!("unrecognized command {:?}", other) },
        }
    }
}

fn parse_rgb(params: &str, explicit_background: bool) -> UpgciCommand {
    let fields: Vec<&str> = params.split(',').map(str::trim).collect();
    let want = if explicit_background { 7 } else { 4 };
    if fields.len() != want {
        return UpgciCommand::Skip {
            reason: format!("RGB with {} fields (want {})", fields.len(), want),
        };
    }

    let ten_bit = |s: &str| -> Option<u16> {
        let v = s.parse::<u16>().ok()?;
        (v <= 1023).then_some(v)
    };

    let (Some(r), Some(g), Some(b)) = (ten_bit(fields[0]), ten_bit(fields[1]), ten_bit(fields[2]))
    else {
        return UpgciCommand::Skip { reason: format!("RGB with bad color fields: {:?}", params) };
    };

    let background = if explicit_background {
        let (Some(br), Some(bg), Some(bb)) =
            (ten_bit(fields[3]), ten_bit(fields[4]), ten_bit(fields[5]))
        else {
            return UpgciCommand::Skip {
                reason: format!("RGB_A with bad background fields: {:?}", params),
            };
        };
        Some((br, bg, bb))
    } else {
        None
    };

    let Ok(window_percent) = fields[want - 1].parse::<f32>() else {
        return UpgciCommand::Skip {
            reason: format!("RGB with bad window percentage: {:?}", fields[want - 1]),
        };
    };

    UpgciCommand::Rgb { r, g, b, background, window_percent }
}

fn parse_conf_hdr(params: &str) -> UpgciCommand {
    let fields: Vec<&str> = params.split(',').map(str::trim).collect();
    let kind = fields.first().copied().unwrap_or("").to_ascii_uppercase();

    let eotf = match kind.as_str() {
        "OFF" | "SDR" | "NONE" => None,
        k if k.contains("HLG") => Some(Eotf::Hlg),
        k if k.contains("DOLBY") || k.contains("DOVI") => Some(Eotf::DolbyVisionPq),
        // PQ / ST2084 / HDR10 and anything else HDR-ish default to PQ.
        _ => Some(Eotf::Pq),
    };

    // maxCLL, maxFALL, maxDML ride in fields 11–13 (1-indexed) of the
    // 13-field form. Tolerate both "1000" and "1000.0".
    let metadata = if fields.len() == 13 {
        let nits = |s: &str| s.parse::<f64>().ok().map(|v| v as u32);
        match (nits(fields[10]), nits(fields[11]), nits(fields[12])) {
            (Some(max_cll), Some(max_fall), Some(max_mastering_luminance)) => {
                Some(HdrStaticMetadata { max_cll, max_fall, max_mastering_luminance })
            }
            _ => None,
        }
    } else {
        None
    };

    UpgciCommand::ConfHdr { eotf, metadata }
}

fn parse_conf_level(params: &str) -> UpgciCommand {
    let params = params.trim();
    if let Some(rest) = params.strip_prefix("Bits") {
        return match rest.trim().parse::<u8>() {
            Ok(bits @ (8 | 10 | 12)) => UpgciCommand::ConfLevelBits { bits },
            _ => UpgciCommand::Skip { reason: format!("CONF_LEVEL Bits {:?}", rest.trim()) },
        };
    }
    if let Some(rest) = params.strip_prefix("Range") {
        return UpgciCommand::ConfLevelRange { range: rest.trim().to_owned() };
    }
    if let Some(rest) = params.strip_prefix("Format") {
        return UpgciCommand::ConfLevelFormat { format: rest.trim().to_owned() };
    }
    match params {
        "Gamma-HDR" => UpgciCommand::GammaHdr,
        "Gamma-SDR" => UpgciCommand::GammaSdr,
        other => UpgciCommand::Skip { reason: format!("CONF_LEVEL {:?}", other) },
    }
}
