//! JSON description of a transcode run for the command line tool.

use std::path::PathBuf;

use serde::Deserialize;
use timeline_transcoder::{ChannelKind, EngineConfig, Filter, TimeLine, TranscodeError};

use crate::factory::TargetStrategy;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobChannelKind {
    Video,
    Audio,
    AudioVideo,
    Image,
}

impl From<JobChannelKind> for ChannelKind {
    fn from(kind: JobChannelKind) -> Self {
        match kind {
            JobChannelKind::Video => ChannelKind::Video,
            JobChannelKind::Audio => ChannelKind::Audio,
            JobChannelKind::AudioVideo => ChannelKind::AudioVideo,
            JobChannelKind::Image => ChannelKind::Image,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFilter {
    FadeIn,
    FadeOut,
    Mute,
    Suppress,
}

impl From<JobFilter> for Filter {
    fn from(filter: JobFilter) -> Self {
        match filter {
            JobFilter::FadeIn => Filter::OpacityUpRamp,
            JobFilter::FadeOut => Filter::OpacityDownRamp,
            JobFilter::Mute => Filter::Mute,
            JobFilter::Suppress => Filter::Suppress,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobChannel {
    pub name: String,
    pub source: String,
    pub kind: JobChannelKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobOutput {
    pub channel: String,
    #[serde(default)]
    pub filter: Option<JobFilter>,
    #[serde(default)]
    pub time_scale: Option<i64>,
    #[serde(default)]
    pub seek_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSegment {
    #[serde(default)]
    pub duration_ms: Option<i64>,
    pub outputs: Vec<JobOutput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub output: PathBuf,
    pub channels: Vec<JobChannel>,
    pub segments: Vec<JobSegment>,
    #[serde(default)]
    pub target: TargetStrategy,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Job {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let job: Job = serde_json::from_str(json)
            .map_err(|e| TranscodeError::Configuration(format!("invalid job: {}", e)))?;
        if job.engine.default_frame_rate == 0 {
            anyhow::bail!(TranscodeError::Configuration(
                "default_frame_rate must be positive".to_string()
            ));
        }
        Ok(job)
    }

    pub fn timeline(&self) -> anyhow::Result<TimeLine> {
        let mut timeline = TimeLine::new();
        for channel in &self.channels {
            timeline.add_channel(&channel.name, &channel.source, channel.kind.into())?;
        }
        for segment in &self.segments {
            let mut builder = timeline.create_segment();
            if let Some(ms) = segment.duration_ms {
                builder = builder.duration(ms);
            }
            for output in &segment.outputs {
                builder = match output.filter {
                    Some(filter) => builder.output_with(&output.channel, filter.into()),
                    None => builder.output(&output.channel),
                };
                if let Some(factor) = output.time_scale {
                    builder = builder.time_scale(factor);
                }
                if let Some(ms) = output.seek_ms {
                    builder = builder.seek(&output.channel, ms);
                }
            }
            builder.build()?;
        }
        Ok(timeline)
    }
}
