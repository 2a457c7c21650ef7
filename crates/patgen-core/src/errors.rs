use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatGenError {
    #[error("Failed to bind {service} on port {port}: {source}")]
    Bind {
        service: &'static str,
        port: u16,
        source: std::io::Error,
    },

    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("HDR control failed: {reason}")]
    HdrControl { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors scoped to one client session. None of these are fatal to the
/// owning server; the accept loop simply tries again.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Frame too long: exceeded {max} bytes")]
    FrameTooLong { max: usize },

    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
