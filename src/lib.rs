//! Timeline-driven audio/video transcoding.
//!
//! A [`TimeLine`] names input channels and arranges them into consecutive
//! segments. The [`MediaTranscoderEngine`] renders it into a single output
//! through the native capabilities of a [`media::MediaFactory`].

pub mod audio_mixer;
pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod muxer;
pub mod pipeline;
pub mod slot;
pub mod telemetry;
pub mod throttle;
pub mod timeline;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use engine::{MediaTranscoderEngine, PROGRESS_UNKNOWN, ProgressListener};
pub use error::{ErrorKind, TranscodeError};
pub use media::{FormatStrategy, MediaFactory, MediaFormat, TrackKind};
pub use telemetry::{LogSink, Telemetry, TelemetrySink};
pub use timeline::{ChannelKind, Filter, SegmentBuilder, TimeLine};
