use std::sync::LazyLock;
use std::time::Duration;

use serde::Deserialize;

use crate::error::TranscodeError;

/// Tunables of the coordinator loop and the track pipelines.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How far a video channel may decode ahead of the slowest channel.
    pub video_lead_time_us: i64,
    /// How far an audio channel may decode ahead of the slowest channel.
    pub audio_lead_time_us: i64,
    /// Sleep between iterations in which no pipeline made progress.
    pub backoff_ms: u64,
    /// Coordinator iterations between two progress reports.
    pub progress_interval: u64,
    /// Upper bound of PCM frames mixed into one encoder input buffer.
    pub audio_chunk_frames: usize,
    /// Bytes the muxer may queue while output formats are still unknown.
    pub muxer_queue_limit_bytes: usize,
    /// Frame rate assumed for channels whose video track does not declare one.
    pub default_frame_rate: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            video_lead_time_us: 100_000,
            audio_lead_time_us: 10_000,
            backoff_ms: 10,
            progress_interval: 10,
            audio_chunk_frames: 1024,
            muxer_queue_limit_bytes: 16 * 1024 * 1024,
            default_frame_rate: 24,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| TranscodeError::Configuration(format!("invalid engine config: {}", e)))?;
        if config.default_frame_rate == 0 {
            anyhow::bail!(TranscodeError::Configuration(
                "default_frame_rate must be positive".to_string()
            ));
        }
        Ok(config)
    }

    pub fn global() -> &'static EngineConfig {
        static CONFIG: LazyLock<EngineConfig> = LazyLock::new(EngineConfig::default);
        &CONFIG
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn default_frame_length_us(&self) -> i64 {
        1_000_000 / self.default_frame_rate.max(1) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, TranscodeError};

    #[test]
    fn test_partial_json_keeps_defaults() -> anyhow::Result<()> {
        let config = EngineConfig::from_json(r#"{ "video_lead_time_us": 250000, "backoff_ms": 5 }"#)?;
        assert_eq!(config.video_lead_time_us, 250_000);
        assert_eq!(config.backoff(), Duration::from_millis(5));
        assert_eq!(config.audio_lead_time_us, EngineConfig::default().audio_lead_time_us);
        assert_eq!(config.default_frame_length_us(), 1_000_000 / 24);
        Ok(())
    }

    #[test]
    fn test_invalid_json_is_configuration_error() {
        let err = EngineConfig::from_json("{ \"backoff_ms\": \"soon\" }").unwrap_err();
        assert_eq!(TranscodeError::classify(&err), ErrorKind::Configuration);

        let err = EngineConfig::from_json("{ \"default_frame_rate\": 0 }").unwrap_err();
        assert_eq!(TranscodeError::classify(&err), ErrorKind::Configuration);
    }

    #[test]
    fn test_global_is_default() {
        assert_eq!(EngineConfig::global(), &EngineConfig::default());
    }
}
