use crate::media::codec::{Codec, Encoder};
use crate::media::compositor::Compositor;
use crate::media::demuxer::Demuxer;
use crate::media::types::MediaFormat;
use crate::media::writer::ContainerWriter;

/// Opens the native media objects the engine drives.
pub trait MediaFactory: Send + Sync {
    fn open_demuxer(&self, source: &str) -> anyhow::Result<Box<dyn Demuxer>>;
    /// Unconfigured decoder able to handle `format`.
    fn create_decoder(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Codec>>;
    /// Unconfigured encoder producing `format`.
    fn create_encoder(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Encoder>>;
    fn create_compositor(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Compositor>>;
    fn open_writer(&self) -> anyhow::Result<Box<dyn ContainerWriter>>;
}

/// Output format negotiation policy. Returning `None` for a track requests a
/// passthrough copy of that track.
pub trait FormatStrategy: Send + Sync {
    fn video_output_format(&self, input: &MediaFormat) -> Option<MediaFormat>;
    fn audio_output_format(&self, input: &MediaFormat) -> Option<MediaFormat>;

    /// Called once the actual encoder formats of every track are known,
    /// before the container writer starts.
    fn validate_output_formats(
        &self,
        video: Option<&MediaFormat>,
        audio: Option<&MediaFormat>,
    ) -> anyhow::Result<()> {
        let _ = (video, audio);
        Ok(())
    }
}
