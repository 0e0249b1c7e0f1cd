use std::path::PathBuf;

use serde::Deserialize;
use timeline_transcoder::TranscodeError;
use timeline_transcoder::media::{
    Codec, Compositor, ContainerWriter, Demuxer, Encoder, FormatStrategy, MediaFactory,
    MediaFormat, TrackKind,
};

use crate::compositor::FfmpegCompositor;
use crate::decoder::FfmpegDecoder;
use crate::encoder::FfmpegEncoder;
use crate::input::FfmpegDemuxer;
use crate::output::FfmpegWriter;

/// Opens FFmpeg backed media objects writing to a single output file.
pub struct FfmpegFactory {
    output: PathBuf,
    pcm_sample_rate: Option<u32>,
}

impl FfmpegFactory {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            pcm_sample_rate: None,
        }
    }

    /// Decoded audio is resampled to `rate`, which has to match the audio
    /// output format for the mixer to accept it.
    pub fn with_pcm_sample_rate(mut self, rate: u32) -> Self {
        self.pcm_sample_rate = Some(rate);
        self
    }
}

impl MediaFactory for FfmpegFactory {
    fn open_demuxer(&self, source: &str) -> anyhow::Result<Box<dyn Demuxer>> {
        Ok(Box::new(FfmpegDemuxer::open(source)?))
    }

    fn create_decoder(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Codec>> {
        let rate = match format.kind {
            TrackKind::Audio => self.pcm_sample_rate,
            TrackKind::Video => None,
        };
        Ok(Box::new(FfmpegDecoder::new(format.kind, rate)))
    }

    fn create_encoder(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Encoder>> {
        Ok(Box::new(FfmpegEncoder::new(format.kind)))
    }

    fn create_compositor(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Compositor>> {
        if format.width == 0 || format.height == 0 {
            anyhow::bail!(TranscodeError::Format(format!(
                "cannot compose onto {}x{}",
                format.width, format.height
            )));
        }
        Ok(Box::new(FfmpegCompositor::new(format.width, format.height)))
    }

    fn open_writer(&self) -> anyhow::Result<Box<dyn ContainerWriter>> {
        Ok(Box::new(FfmpegWriter::create(&self.output)?))
    }
}

/// Output targets: H.264 video and AAC audio unless a track is copied.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetStrategy {
    /// Longer side of the output picture; the input aspect ratio is kept.
    pub max_dimension: u32,
    pub frame_rate: u32,
    pub video_bit_rate: u64,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub audio_bit_rate: u64,
    pub copy_video: bool,
    pub copy_audio: bool,
}

impl Default for TargetStrategy {
    fn default() -> Self {
        Self {
            max_dimension: 1280,
            frame_rate: 30,
            video_bit_rate: 4_000_000,
            audio_sample_rate: 48_000,
            audio_channels: 2,
            audio_bit_rate: 128_000,
            copy_video: false,
            copy_audio: false,
        }
    }
}

impl TargetStrategy {
    fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        let longer = width.max(height);
        if longer == 0 || longer <= self.max_dimension {
            return (even(width), even(height));
        }
        let scale = |side: u32| even((side as u64 * self.max_dimension as u64 / longer as u64) as u32);
        (scale(width), scale(height))
    }
}

fn even(side: u32) -> u32 {
    (side & !1).max(2)
}

impl FormatStrategy for TargetStrategy {
    fn video_output_format(&self, input: &MediaFormat) -> Option<MediaFormat> {
        if self.copy_video {
            return None;
        }
        let (width, height) = self.output_size(input.width, input.height);
        Some(
            MediaFormat::video("video/avc", width, height)
                .with_frame_rate(input.frame_rate.unwrap_or(self.frame_rate).min(self.frame_rate))
                .with_bit_rate(self.video_bit_rate),
        )
    }

    fn audio_output_format(&self, _input: &MediaFormat) -> Option<MediaFormat> {
        if self.copy_audio {
            return None;
        }
        Some(
            MediaFormat::audio("audio/mp4a-latm", self.audio_sample_rate, self.audio_channels)
                .with_bit_rate(self.audio_bit_rate),
        )
    }

    fn validate_output_formats(
        &self,
        video: Option<&MediaFormat>,
        audio: Option<&MediaFormat>,
    ) -> anyhow::Result<()> {
        if let Some(video) = video {
            if video.width % 2 != 0 || video.height % 2 != 0 {
                anyhow::bail!(TranscodeError::Format(format!(
                    "encoder picked odd size {}x{}",
                    video.width, video.height
                )));
            }
        }
        if let Some(audio) = audio {
            if audio.sample_rate != self.audio_sample_rate {
                anyhow::bail!(TranscodeError::Format(format!(
                    "encoder picked {}Hz instead of {}Hz",
                    audio.sample_rate, self.audio_sample_rate
                )));
            }
        }
        Ok(())
    }
}
