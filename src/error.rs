use thiserror::Error;

/// Failure classes surfaced by the transcoder. Every fallible operation
/// returns `anyhow::Result`; these are the typed roots callers downcast to.
#[derive(Error, Debug)]
pub enum TranscodeError {
    /// Unknown channel, empty segment, unresolved input track.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No transcoding requested for any track, or a conflicting output format.
    #[error("format error: {0}")]
    Format(String),

    /// Codec, demuxer or container writer failed to open or do I/O.
    #[error("resource error: {0}")]
    Resource(String),

    /// Releasing native handles failed.
    #[error("resource leak: {0}")]
    ResourceLeak(String),

    #[error("transcode cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Format,
    Resource,
    ResourceLeak,
    Cancelled,
    Other,
}

impl TranscodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranscodeError::Configuration(_) => ErrorKind::Configuration,
            TranscodeError::Format(_) => ErrorKind::Format,
            TranscodeError::Resource(_) => ErrorKind::Resource,
            TranscodeError::ResourceLeak(_) => ErrorKind::ResourceLeak,
            TranscodeError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Classifies an error chain by the first `TranscodeError` found in it.
    pub fn classify(err: &anyhow::Error) -> ErrorKind {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<TranscodeError>())
            .map(TranscodeError::kind)
            .unwrap_or(ErrorKind::Other)
    }
}

/// Attaches a failed cleanup to `err`, which keeps its classification.
pub fn with_cleanup(err: anyhow::Error, cleanup: anyhow::Result<()>) -> anyhow::Error {
    match cleanup {
        Ok(()) => err,
        Err(leak) => err.context(format!("while failing: {:#}", leak)),
    }
}
