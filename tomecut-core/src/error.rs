use thiserror::Error;

use crate::graph::AudioFormat;

/// All errors produced by tomecut-core.
#[derive(Debug, Error)]
pub enum TomecutError {
    #[error("format mismatch: upstream produces {output:?} but downstream expects {input:?}")]
    FormatMismatch {
        output: AudioFormat,
        input: AudioFormat,
    },

    #[error("cannot connect nodes that belong to different graphs")]
    CrossGraph,

    #[error("audio node '{0}' has been disposed")]
    NodeDisposed(String),

    #[error("invalid use of active node '{0}': active nodes move samples on their own")]
    ActiveNodeUsage(String),

    #[error("driver '{0}' is missing an input or output connection")]
    NotConnected(String),

    #[error("node '{0}' has already finished playback")]
    PlaybackFinished(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("speech recognition error: {0}")]
    Recognition(String),

    #[error("external tool failure: {0}")]
    ExternalTool(String),

    #[error("wav codec error: {0}")]
    Wav(String),

    #[error("sample conformance error: {0}")]
    Conform(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<hound::Error> for TomecutError {
    fn from(e: hound::Error) -> Self {
        match e {
            hound::Error::IoError(io) => TomecutError::Io(io),
            other => TomecutError::Wav(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TomecutError>;
