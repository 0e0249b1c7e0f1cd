//! FFmpeg backend for `timeline-transcoder`: demuxing, decoding, encoding,
//! compositing and container output built on `ffmpeg-next`.

pub mod buffers;
pub mod compositor;
pub mod decoder;
pub mod encoder;
pub mod factory;
pub mod hw;
pub mod input;
pub mod job;
pub mod output;
pub mod scaler;
pub mod stream;

pub use factory::{FfmpegFactory, TargetStrategy};
pub use job::Job;

/// Registers FFmpeg components. Call once at startup.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}
