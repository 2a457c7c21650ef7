//! PGen request grammar.
//!
//! Requests are plain ASCII commands; the interesting one is
//! `RGB=RECTANGLE;<w>;<h>;<unused>;<r>;<g>;<b>;<bgR>;<bgG>;<bgB>`, nine
//! semicolon fields after the keyword. Everything the grammar does not
//! recognize blanks the screen (the protocol's "unknown command = show
//! nothing" policy).

use tracing::warn;

// ── PgenRequest ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgenRequest {
    GetResolution,
    GetGpuMemory,
    /// Reapply the configured passive pattern.
    TestTemplate,
    /// Centered rectangle in pixels against the reference resolution, over a
    /// full-field background.
    Rectangle {
        width: u32,
        height: u32,
        color: (u8, u8, u8),
        background: (u8, u8, u8),
    },
    /// `RGB=TEXT…` / `RGB=IMAGE…`: accepted, not renderable here.
    Ignored,
    /// Recognized shape but unparseable fields: logged, no state change.
    Skip,
    /// Anything else: blank the screen.
    Unknown,
}

impl PgenRequest {
    /// Decode one framed request. Never fails: malformed input maps to
    /// [`Skip`](PgenRequest::Skip) or [`Unknown`](PgenRequest::Unknown).
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();

        if text.starts_with("CMD:GET_RESOLUTION") {
            Self::GetResolution
        } else if text.starts_with("CMD:GET_GPU_MEMORY") {
            Self::GetGpuMemory
        } else if text.starts_with("TESTTEMPLATE") {
            Self::TestTemplate
        } else if text.starts_with("RGB=RECTANGLE") {
            parse_rectangle(text)
        } else if text.starts_with("RGB=TEXT") || text.starts_with("RGB=IMAGE") {
            Self::Ignored
        } else {
            Self::Unknown
        }
    }
}

fn parse_rectangle(text: &str) -> PgenRequest {
    let fields: Vec<&str> = text.split(';').collect();
    // Keyword + 9 value fields.
    if fields.len() != 10 {
        warn!("RGB=RECTANGLE with {} fields (want 10): {:?}", fields.len(), text);
        return PgenRequest::Skip;
    }

    let parsed: Option<Vec<u32>> = fields[1..]
        .iter()
        .map(|f| f.trim().parse::<u32>().ok())
        .collect();
    let Some(v) = parsed else {
        warn!("RGB=RECTANGLE with non-numeric fields: {:?}", text);
        return PgenRequest::Skip;
    };

    let channel = |x: u32| -> Option<u8> { u8::try_from(x).ok() };
    let (Some(r), Some(g), Some(b), Some(bg_r), Some(bg_g), Some(bg_b)) = (
        channel(v[3]),
        channel(v[4]),
        channel(v[5]),
        channel(v[6]),
        channel(v[7]),
        channel(v[8]),
    ) else {
        warn!("RGB=RECTANGLE with out-of-range color: {:?}", text);
        return PgenRequest::Skip;
    };

    PgenRequest::Rectangle {
        width: v[0],
        height: v[1],
        // v[2] is unused on the wire
        color: (r, g, b),
        background: (bg_r, bg_g, bg_b),
    }
}
