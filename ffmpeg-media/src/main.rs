use std::sync::Arc;

use anyhow::Context;
use ffmpeg_media::{FfmpegFactory, Job};
use timeline_transcoder::{MediaTranscoderEngine, PROGRESS_UNKNOWN};
use tokio_util::sync::CancellationToken;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("ffmpeg_next", log::LevelFilter::Warn)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    ffmpeg_media::init()?;

    let path = std::env::args()
        .nth(1)
        .context("usage: ffmpeg-media <job.json>")?;
    let json = std::fs::read_to_string(&path).with_context(|| format!("read {}", path))?;
    let job = Job::from_json(&json)?;
    let mut timeline = job.timeline()?;

    let factory = FfmpegFactory::new(job.output.clone())
        .with_pcm_sample_rate(job.target.audio_sample_rate);
    let mut engine = MediaTranscoderEngine::new(Box::new(factory)).with_config(job.engine.clone());
    let mut reported = 0;
    engine.set_progress_listener(move |progress| {
        if progress == PROGRESS_UNKNOWN {
            return;
        }
        let percent = (progress * 100.0) as u32;
        if percent >= reported + 5 || percent == 100 {
            reported = percent;
            log::info!("progress {}%", percent);
        }
    });

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("ctrl+c received, cancelling");
            cancel_clone.cancel();
        }
    });

    engine
        .transcode(&mut timeline, Arc::new(job.target.clone()), &cancel)
        .await
        .with_context(|| format!("transcode to {}", job.output.display()))?;
    log::info!("wrote {}", job.output.display());
    Ok(())
}
