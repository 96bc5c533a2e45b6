use std::error::Error as StdError;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::format::MediaKind;

/// Compressor's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Compressor's crate-wide error type.
///
/// Reader failures come back from the reader's own call sites. Decode-path failures are
/// delivered through the pump's error handler.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open media container '{}'", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed media container: {0}")]
    Malformed(String),

    #[error("no {0} track found")]
    TrackNotFound(MediaKind),

    #[error("no track selected")]
    NoTrackSelected,

    #[error("sample of {needed} bytes does not fit in a {capacity}-byte buffer")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("no codec implementation supports '{mime}'")]
    NotSupported { mime: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("codec still failing after {attempts} recovery attempts")]
    RecoveryExhausted {
        attempts: u32,
        #[source]
        last: CodecError,
    },

    #[error("sample source is already exhausted")]
    SourceExhausted,

    #[error("codec setup did not complete within {0:?}")]
    SetupTimedOut(Duration),

    #[error("decode pump is shut down")]
    PumpClosed,

    #[error("decode failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Other(Box::new(err))
    }
}
