pub mod config;
pub mod errors;
pub mod hdr;
pub mod state;
pub mod types;

pub use config::GeneratorConfig;
pub use errors::{PatGenError, SessionError};
pub use hdr::{HdrControl, ModeChangeCallback};
pub use state::{SharedSignal, SignalState};
pub use types::*;
