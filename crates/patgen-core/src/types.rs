use serde::{Deserialize, Serialize};

// ── Resolution ────────────────────────────────────────────────────────────────

/// Reference output resolution the generator reports and sizes patterns
/// against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const FHD: Self = Self { width: 1920, height: 1080 };
    pub const UHD: Self = Self { width: 3840, height: 2160 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ── Eotf ──────────────────────────────────────────────────────────────────────

/// Electro-optical transfer function of the output signal.
///
/// `Sdr` ⇔ not-HDR; everything else implies the HDR signal path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Eotf {
    #[default]
    Sdr,
    Pq,
    Hlg,
    /// PQ carried inside a Dolby Vision transport stream.
    DolbyVisionPq,
}

impl Eotf {
    pub fn is_hdr(&self) -> bool {
        !matches!(self, Self::Sdr)
    }
}

impl std::fmt::Display for Eotf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sdr => write!(f, "SDR"),
            Self::Pq => write!(f, "PQ"),
            Self::Hlg => write!(f, "HLG"),
            Self::DolbyVisionPq => write!(f, "Dolby Vision (PQ)"),
        }
    }
}

// ── ColorFormat / Colorimetry / QuantRange ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColorFormat {
    #[default]
    Rgb,
    #[serde(rename = "ycbcr444")]
    YCbCr444,
    #[serde(rename = "ycbcr422")]
    YCbCr422,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Colorimetry {
    #[default]
    Bt709,
    Bt2020,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuantRange {
    #[default]
    Auto,
    Limited,
    Full,
}

// ── HdrStaticMetadata ─────────────────────────────────────────────────────────

/// HDR10 static metadata, all values in nits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdrStaticMetadata {
    pub max_cll: u32,
    pub max_fall: u32,
    pub max_mastering_luminance: u32,
}

// ── SignalConfig ──────────────────────────────────────────────────────────────

/// Authoritative description of the video signal currently requested.
///
/// `hdr_metadata` is only meaningful while `eotf.is_hdr()`; it may remain
/// stored after a drop back to SDR but consumers must ignore it then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    #[serde(alias = "bitDepth")]
    pub bit_depth: u8,
    pub eotf: Eotf,
    #[serde(alias = "colorFormat")]
    pub color_format: ColorFormat,
    pub colorimetry: Colorimetry,
    #[serde(alias = "quantRange")]
    pub quant_range: QuantRange,
    #[serde(alias = "hdrMetadata", skip_serializing_if = "Option::is_none")]
    pub hdr_metadata: Option<HdrStaticMetadata>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            bit_depth: 8,
            eotf: Eotf::Sdr,
            color_format: ColorFormat::Rgb,
            colorimetry: Colorimetry::Bt709,
            quant_range: QuantRange::Auto,
            hdr_metadata: None,
        }
    }
}

impl SignalConfig {
    pub fn is_hdr(&self) -> bool {
        self.eotf.is_hdr()
    }

    /// Metadata as seen by consumers: present only on the HDR signal path.
    pub fn effective_hdr_metadata(&self) -> Option<HdrStaticMetadata> {
        if self.is_hdr() { self.hdr_metadata } else { None }
    }
}

// ── Color ─────────────────────────────────────────────────────────────────────

/// Linear RGB triple, each channel in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const BLACK: Self = Self { r: 0.0, g: 0.0, b: 0.0 };
    pub const WHITE: Self = Self { r: 1.0, g: 1.0, b: 1.0 };

    pub fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    /// From 8-bit components (0–255).
    pub fn from_8bit(r: u8, g: u8, b: u8) -> Self {
        Self {
            r: r as f32 / 255.0,
            g: g as f32 / 255.0,
            b: b as f32 / 255.0,
        }
    }

    /// Grey at an 8-bit level, e.g. level 235 for a near-white field.
    pub fn grey_8bit(level: u8) -> Self {
        Self::from_8bit(level, level, level)
    }
}

// ── DrawCommand ───────────────────────────────────────────────────────────────

/// Axis-aligned rectangle in normalized device coordinates [-1,1]×[-1,1].
///
/// `x`/`y` are the lower-left corner. Later commands in a list paint over
/// earlier ones (painter's algorithm, no blending).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    /// The whole viewport.
    pub const FULL: Self = Self { x: -1.0, y: -1.0, width: 2.0, height: 2.0 };

    /// Rectangle of the given NDC size, centered on the viewport.
    pub fn centered(width: f32, height: f32) -> Self {
        Self {
            x: -width / 2.0,
            y: -height / 2.0,
            width,
            height,
        }
    }
}

/// Fill of a [`DrawCommand`]: flat color or four independent corner colors
/// (gradient ramps).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fill {
    Solid(Color),
    Corners {
        top_left: Color,
        top_right: Color,
        bottom_left: Color,
        bottom_right: Color,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawCommand {
    pub rect: Rect,
    pub fill: Fill,
}

impl DrawCommand {
    /// Full-field pattern covering the whole viewport.
    pub fn full_field(color: Color) -> Self {
        Self { rect: Rect::FULL, fill: Fill::Solid(color) }
    }

    /// Window pattern: a centered rectangle covering `percent` of the screen
    /// *area*, so each side scales by sqrt(percent/100).
    pub fn window(percent: f32, color: Color) -> Self {
        let fraction = (percent.clamp(0.0, 100.0) / 100.0).sqrt();
        Self {
            rect: Rect::centered(2.0 * fraction, 2.0 * fraction),
            fill: Fill::Solid(color),
        }
    }

    /// Centered rectangle sized in pixels against a reference resolution.
    pub fn centered_pixels(width_px: u32, height_px: u32, reference: Resolution, color: Color) -> Self {
        let w = (width_px as f32 / reference.width as f32).min(1.0) * 2.0;
        let h = (height_px as f32 / reference.height as f32).min(1.0) * 2.0;
        Self { rect: Rect::centered(w, h), fill: Fill::Solid(color) }
    }
}
