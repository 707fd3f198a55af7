use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ParleyError {
    /// No usable audio device, or permission to open it was denied.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Network or protocol fault on the duplex stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// An audio frame that cannot be encoded or decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("a session is already active")]
    AlreadyActive,

    #[error("audio error: {0}")]
    Audio(String),

    #[error("resample error: {0}")]
    Resample(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl ParleyError {
    /// Whether this error ends the session it occurred in.
    #[must_use]
    pub const fn is_fatal_to_session(&self) -> bool {
        !matches!(self, Self::MalformedFrame(_))
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
