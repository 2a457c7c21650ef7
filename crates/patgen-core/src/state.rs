use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use crate::types::{Colorimetry, DrawCommand, Eotf, HdrStaticMetadata, SignalConfig};

// ── SignalState ───────────────────────────────────────────────────────────────

struct Inner {
    config: SignalConfig,
    commands: Vec<DrawCommand>,
    pending: bool,
    status: String,
}

/// Process-wide signal/render state shared by every protocol service and the
/// display consumer.
///
/// Everything lives under one briefly-held mutex; no caller holds the lock
/// across I/O. The pending flag is the single wait/notify point: protocol
/// drivers mark an update pending, the consumer clears it after acting on
/// it, and PGenerator's session loop blocks on [`wait_not_pending`] so each
/// request is fully consumed before the next is read.
///
/// Constructed once by the composition root and passed as
/// [`SharedSignal`], never a global, so tests instantiate their own.
///
/// [`wait_not_pending`]: SignalState::wait_not_pending
pub struct SignalState {
    inner: Mutex<Inner>,
    wake: Notify,
}

/// Shared handle passed to each server task and the render consumer.
pub type SharedSignal = Arc<SignalState>;

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                config: SignalConfig::default(),
                commands: Vec::new(),
                pending: false,
                status: String::new(),
            }),
            wake: Notify::new(),
        }
    }

    // ── Draw commands ─────────────────────────────────────────────────────────

    /// Atomically replace the draw command list, mark an update pending and
    /// wake any waiter. Never fails.
    pub fn set_commands(&self, commands: Vec<DrawCommand>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.commands = commands;
            inner.pending = true;
        }
        self.wake.notify_waiters();
    }

    /// Snapshot of the current command list. Safe to call concurrently with
    /// [`set_commands`](SignalState::set_commands); never blocks beyond the
    /// brief mutex.
    pub fn get_commands(&self) -> Vec<DrawCommand> {
        self.inner.lock().unwrap().commands.clone()
    }

    // ── Pending hand-off ──────────────────────────────────────────────────────

    pub fn is_pending(&self) -> bool {
        self.inner.lock().unwrap().pending
    }

    pub fn set_pending(&self) {
        self.inner.lock().unwrap().pending = true;
        self.wake.notify_waiters();
    }

    /// Clear the pending flag and release every waiter. Also the shutdown
    /// escape hatch: server stop paths call this so no task stays parked in
    /// [`wait_not_pending`](SignalState::wait_not_pending).
    pub fn clear_pending(&self) {
        self.inner.lock().unwrap().pending = false;
        self.wake.notify_waiters();
    }

    /// Suspend until the previous update has been consumed (pending false).
    ///
    /// The `notified()` future is registered *before* the predicate
    /// re-check; a wake between the check and the await is therefore never
    /// lost. Spurious wakes just loop.
    pub async fn wait_not_pending(&self) {
        loop {
            let notified = self.wake.notified();
            if !self.inner.lock().unwrap().pending {
                return;
            }
            notified.await;
        }
    }

    // ── Signal configuration ──────────────────────────────────────────────────

    pub fn current_configuration(&self) -> SignalConfig {
        self.inner.lock().unwrap().config.clone()
    }

    /// Set the EOTF and the derived hdr flag.
    ///
    /// Does NOT promote bit depth or colorimetry: on this path the
    /// promotion belongs to the caller, because the protocols negotiate
    /// those fields independently. Contrast with
    /// [`set_mode`](SignalState::set_mode).
    pub fn apply_eotf_mode(&self, eotf: Eotf) {
        self.inner.lock().unwrap().config.eotf = eotf;
    }

    /// Set bit depth and the hdr flag together: the coarse toggle used by
    /// PGenerator, which never negotiates an EOTF explicitly.
    ///
    /// Entering HDR with no HDR EOTF selected yet defaults to PQ; leaving
    /// HDR forces the EOTF back to SDR.
    pub fn set_mode(&self, bit_depth: u8, is_hdr: bool) {
        if !matches!(bit_depth, 8 | 10 | 12) {
            warn!("Ignoring unsupported bit depth {}", bit_depth);
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.config.bit_depth = bit_depth;
        if is_hdr {
            if !inner.config.eotf.is_hdr() {
                inner.config.eotf = Eotf::Pq;
            }
        } else {
            inner.config.eotf = Eotf::Sdr;
        }
    }

    pub fn set_bit_depth(&self, bit_depth: u8) {
        if !matches!(bit_depth, 8 | 10 | 12) {
            warn!("Ignoring unsupported bit depth {}", bit_depth);
            return;
        }
        self.inner.lock().unwrap().config.bit_depth = bit_depth;
    }

    pub fn set_colorimetry(&self, colorimetry: Colorimetry) {
        self.inner.lock().unwrap().config.colorimetry = colorimetry;
    }

    pub fn set_hdr_metadata(&self, metadata: HdrStaticMetadata) {
        self.inner.lock().unwrap().config.hdr_metadata = Some(metadata);
    }

    // ── Status ────────────────────────────────────────────────────────────────

    pub fn connection_status(&self) -> String {
        self.inner.lock().unwrap().status.clone()
    }

    pub fn set_connection_status(&self, status: impl Into<String>) {
        let status = status.into();
        tracing::debug!("Status: {}", status);
        self.inner.lock().unwrap().status = status;
    }

    // ── Reset ─────────────────────────────────────────────────────────────────

    /// Restore defaults, empty the command list and clear pending (waking
    /// any waiter).
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.config = SignalConfig::default();
            inner.commands.clear();
            inner.pending = false;
            inner.status.clear();
        }
        self.wake.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::SignalState;
    use crate::types::{Color, DrawCommand, Eotf, SignalConfig};

    #[tokio::test]
    async fn wait_not_pending_returns_immediately_when_clear() {
        let state = SignalState::new();
        tokio::time::timeout(Duration::from_millis(100), state.wait_not_pending())
            .await
            .expect("must not block while pending is clear");
    }

    #[tokio::test]
    async fn waiter_released_once_per_clear() {
        let state = Arc::new(SignalState::new());
        state.set_pending();

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait_not_pending().await })
        };

        // Still pending → the waiter must be parked.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        state.clear_pending();
        tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter must wake on clear_pending")
            .unwrap();
    }

    #[tokio::test]
    async fn no_missed_wakeups_under_concurrent_writers() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let state = Arc::new(SignalState::new());
        let sets = Arc::new(AtomicU32::new(0));

        // Two simulated server tasks each push 50 updates through the
        // wait/set cycle while a consumer drains. A single missed wake
        // parks a writer forever and trips the timeout.
        let mut writers = Vec::new();
        for _ in 0..2 {
            let state = Arc::clone(&state);
            let sets = Arc::clone(&sets);
            writers.push(tokio::spawn(async move {
                for i in 0..50u8 {
                    state.wait_not_pending().await;
                    state.set_commands(vec![DrawCommand::full_field(Color::grey_8bit(i))]);
                    sets.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        let consumer = {
            let state = Arc::clone(&state);
            let sets = Arc::clone(&sets);
            tokio::spawn(async move {
                loop {
                    if state.is_pending() {
                        let _ = state.get_commands();
                        state.clear_pending();
                    }
                    if sets.load(Ordering::SeqCst) == 100 && !state.is_pending() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        for writer in writers {
            tokio::time::timeout(Duration::from_secs(5), writer)
                .await
                .expect("writers must never hang on the hand-off")
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
    }

    #[test]
    fn set_mode_defaults_eotf_to_pq_and_back() {
        let state = SignalState::new();
        state.set_mode(10, true);
        let cfg = state.current_configuration();
        assert_eq!(cfg.eotf, Eotf::Pq);
        assert_eq!(cfg.bit_depth, 10);

        // An already-selected HDR EOTF survives the coarse toggle.
        state.apply_eotf_mode(Eotf::Hlg);
        state.set_mode(12, true);
        assert_eq!(state.current_configuration().eotf, Eotf::Hlg);

        state.set_mode(8, false);
        assert_eq!(state.current_configuration().eotf, Eotf::Sdr);
    }

    #[test]
    fn apply_eotf_mode_does_not_promote() {
        let state = SignalState::new();
        state.apply_eotf_mode(Eotf::Pq);
        let cfg = state.current_configuration();
        // Promotion is the caller's job on this path.
        assert_eq!(cfg.bit_depth, 8);
        assert_eq!(cfg.colorimetry, crate::types::Colorimetry::Bt709);
    }

    #[test]
    fn reset_is_idempotent() {
        let state = SignalState::new();
        state.set_mode(12, true);
        state.set_commands(vec![DrawCommand::full_field(Color::WHITE)]);

        state.reset();
        let first = state.current_configuration();
        state.reset();
        let second = state.current_configuration();

        assert_eq!(first, SignalConfig::default());
        assert_eq!(first, second);
        assert!(state.get_commands().is_empty());
        assert!(!state.is_pending());
    }
}
