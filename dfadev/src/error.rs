use thiserror::Error;

/// Everything that can go wrong between a client and the automaton engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A state or symbol index outside `0..=255`, or a transfer larger than the device serves in
    /// one call.
    #[error("value {0} out of range")]
    OutOfRange(i64),

    /// The channel does not know the requested operation (an ioctl request it was never taught).
    #[error("operation not supported by this channel: {0}")]
    NotSupported(String),

    /// A status read produced something other than `Y` or `N`.
    #[error("malformed status byte {0:#04x}")]
    MalformedStatusByte(u8),

    #[error("no snapshot published for device {0:?}")]
    MissingSnapshot(String),

    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// The device answered with a status the client has no mapping for.
    #[error("device rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] hyper::Error),

    #[error(transparent)]
    Sqlite(#[from] tokio_rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for transport-level failures, `NotSupported` included.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Http(_) | Error::NotSupported(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
