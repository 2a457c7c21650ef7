use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::PatGenError;
use crate::types::{ColorFormat, Colorimetry, Eotf, HdrStaticMetadata};

// ── HdrControl trait ──────────────────────────────────────────────────────────

/// Interface to the platform HDR/signal negotiation layer.
///
/// The generator core never talks to the display hardware itself; whatever
/// owns the output (EGL surface, kernel driver shim, …) implements this and
/// is injected by the composition root.
#[async_trait]
pub trait HdrControl: Send + Sync {
    /// Push HDR10 static metadata (nits) towards the display path.
    async fn apply_static_metadata(&self, metadata: HdrStaticMetadata) -> Result<(), PatGenError>;

    /// Reconfigure the output signal.
    async fn apply_signal_settings(
        &self,
        eotf: Eotf,
        color_format: ColorFormat,
        colorimetry: Colorimetry,
        bit_depth: u8,
    ) -> Result<(), PatGenError>;
}

/// Callback invoked by the UPGCI server whenever CalMAN changes the signal
/// mode: `(is_hdr, bit_depth, eotf)`.
pub type ModeChangeCallback = Arc<dyn Fn(bool, u8, Eotf) + Send + Sync>;
