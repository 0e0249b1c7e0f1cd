//! Coordinator: probes the timeline's inputs, builds the track pipelines and
//! steps them segment by segment until the output is complete.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{TranscodeError, with_cleanup};
use crate::media::{FormatStrategy, MediaFactory, MediaFormat, TrackKind, first_track};
use crate::muxer::QueuedMuxer;
use crate::pipeline::{
    AudioTrackTranscoder, PassThroughTrackTranscoder, StepContext, TrackSource, TrackTranscoder,
    VideoTrackTranscoder, release_all,
};
use crate::telemetry::Telemetry;
use crate::throttle::TranscodeThrottle;
use crate::timeline::TimeLine;

/// Progress value reported when the timeline duration is unknown.
pub const PROGRESS_UNKNOWN: f64 = -1.0;

pub type ProgressListener = Box<dyn FnMut(f64) + Send>;

#[derive(Default)]
struct ProgressReporter {
    listener: Option<ProgressListener>,
    progress: f64,
}

impl ProgressReporter {
    fn reset(&mut self) {
        self.progress = 0.0;
    }

    fn report(&mut self, clock_us: i64, duration_us: Option<i64>) {
        let progress = match duration_us {
            Some(duration) if duration > 0 => {
                (clock_us as f64 / duration as f64).clamp(0.0, 1.0).max(self.progress)
            }
            _ => PROGRESS_UNKNOWN,
        };
        self.set(progress);
    }

    fn set(&mut self, progress: f64) {
        self.progress = progress;
        if let Some(listener) = self.listener.as_mut() {
            listener(progress);
        }
    }
}

/// Everything opened during one transcode, released in a fixed order.
#[derive(Default)]
struct Session {
    video: Option<TrackTranscoder>,
    audio: Option<TrackTranscoder>,
    muxer: Option<QueuedMuxer>,
    /// Opened inputs not owned by any pipeline.
    idle_sources: Vec<TrackSource>,
}

impl Session {
    fn clock_us(&self) -> i64 {
        output_clock_us(self.video.as_ref(), self.audio.as_ref())
    }

    /// Decoders first, then encoders, demuxers and finally the writer.
    fn release(&mut self) -> anyhow::Result<()> {
        let mut failures = Vec::new();
        let mut collect = |result: anyhow::Result<()>| {
            if let Err(e) = result {
                failures.push(format!("{:#}", e));
            }
        };

        for pipeline in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            collect(pipeline.release_decoders());
        }
        for pipeline in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            collect(pipeline.release_encoder());
        }
        for pipeline in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            collect(pipeline.release_demuxers());
        }
        collect(release_all(self.idle_sources.drain(..), |mut source| {
            source.demuxer.release()
        }));
        if let Some(muxer) = self.muxer.as_mut() {
            collect(muxer.release());
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TranscodeError::ResourceLeak(failures.join("; ")).into())
        }
    }
}

pub struct MediaTranscoderEngine {
    factory: Box<dyn MediaFactory>,
    config: EngineConfig,
    log: Telemetry,
    progress: ProgressReporter,
}

impl MediaTranscoderEngine {
    pub fn new(factory: Box<dyn MediaFactory>) -> Self {
        Self {
            factory,
            config: EngineConfig::global().clone(),
            log: Telemetry::default(),
            progress: ProgressReporter::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_telemetry(mut self, log: Telemetry) -> Self {
        self.log = log;
        self
    }

    /// Called with values in `[0, 1]`, or [`PROGRESS_UNKNOWN`] when the
    /// timeline length cannot be resolved.
    pub fn set_progress_listener(&mut self, listener: impl FnMut(f64) + Send + 'static) {
        self.progress.listener = Some(Box::new(listener));
    }

    pub fn progress(&self) -> f64 {
        self.progress.progress
    }

    /// Renders `timeline` into the factory's writer using the formats chosen
    /// by `strategy`. Every opened resource is released before returning.
    pub async fn transcode(
        &mut self,
        timeline: &mut TimeLine,
        strategy: Arc<dyn FormatStrategy>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        if timeline.segments().is_empty() {
            anyhow::bail!(TranscodeError::Configuration(
                "timeline has no segments".to_string()
            ));
        }
        self.progress.reset();

        let mut session = Session::default();
        let result = self.run(&mut session, timeline, strategy, cancel).await;
        let released = session.release();

        match (result, released) {
            (Ok(()), Ok(())) => {
                self.log.info(format_args!("transcode finished"));
                if timeline.duration_us().is_some() {
                    self.progress.set(1.0);
                }
                Ok(())
            }
            (Ok(()), Err(leak)) => {
                self.log.error(format_args!("transcode finished but {:#}", leak));
                Err(leak)
            }
            (Err(e), Ok(())) => {
                self.log.error(format_args!("transcode failed: {:#}", e));
                Err(e)
            }
            (Err(e), Err(leak)) => {
                self.log
                    .error(format_args!("transcode failed: {:#}, then {:#}", e, leak));
                Err(with_cleanup(e, Err(leak)))
            }
        }
    }

    async fn run(
        &mut self,
        session: &mut Session,
        timeline: &mut TimeLine,
        strategy: Arc<dyn FormatStrategy>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.probe(session, timeline)?;

        let mut video_sources = Vec::new();
        let mut audio_sources = Vec::new();
        for source in session.idle_sources.drain(..) {
            match source.format.kind {
                TrackKind::Video => video_sources.push(source),
                TrackKind::Audio => audio_sources.push(source),
            }
        }
        let video_input = primary_format(timeline, TrackKind::Video, &video_sources);
        let audio_input = primary_format(timeline, TrackKind::Audio, &audio_sources);
        let video_output = video_input
            .as_ref()
            .and_then(|f| strategy.video_output_format(f));
        let audio_output = audio_input
            .as_ref()
            .and_then(|f| strategy.audio_output_format(f));
        if video_output.is_none() && audio_output.is_none() {
            session.idle_sources.extend(video_sources);
            session.idle_sources.extend(audio_sources);
            anyhow::bail!(TranscodeError::Format("no transcoding necessary".to_string()));
        }

        let mut expected = Vec::new();
        if video_input.is_some() {
            expected.push(TrackKind::Video);
        }
        if audio_input.is_some() {
            expected.push(TrackKind::Audio);
        }
        let writer = match self.factory.open_writer() {
            Ok(writer) => writer,
            Err(e) => {
                session.idle_sources.extend(video_sources);
                session.idle_sources.extend(audio_sources);
                return Err(e);
            }
        };
        let validator = Arc::clone(&strategy);
        let muxer = session.muxer.insert(
            QueuedMuxer::new(writer, &expected, &self.config, self.log.clone()).with_validator(
                Box::new(move |video, audio| validator.validate_output_formats(video, audio)),
            ),
        );
        let oriented = match video_input
            .as_ref()
            .map(|f| f.rotation_degrees)
            .filter(|degrees| *degrees != 0)
        {
            Some(rotation) => muxer.set_orientation_hint(rotation),
            None => Ok(()),
        };

        let video = oriented.and_then(|()| {
            self.build_pipeline(TrackKind::Video, &mut video_sources, video_output, muxer)
        });
        let audio = match &video {
            Ok(_) => self.build_pipeline(TrackKind::Audio, &mut audio_sources, audio_output, muxer),
            Err(_) => Ok(None),
        };
        // whatever no pipeline took over is released with the session
        session.idle_sources.append(&mut video_sources);
        session.idle_sources.append(&mut audio_sources);
        session.video = video?;
        session.audio = audio?;

        self.run_segments(session, timeline, cancel).await?;

        session
            .muxer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("muxer vanished"))?
            .finish()
    }

    /// Opens one demuxer per channel and carried track, and records the
    /// channels' lengths and frame lengths.
    fn probe(&self, session: &mut Session, timeline: &mut TimeLine) -> anyhow::Result<()> {
        let channels: Vec<(String, String, crate::timeline::ChannelKind)> = timeline
            .channels()
            .iter()
            .map(|c| (c.name().to_string(), c.source().to_string(), c.kind()))
            .collect();

        for (name, source, kind) in channels {
            for track in [TrackKind::Video, TrackKind::Audio] {
                if !kind.carries(track) {
                    continue;
                }
                let mut demuxer = self.factory.open_demuxer(&source)?;
                let Some((index, format)) = first_track(demuxer.as_ref(), track) else {
                    let err = TranscodeError::Configuration(format!(
                        "channel {} ({}) has no {} track",
                        name, source, track
                    ));
                    return Err(with_cleanup(err.into(), demuxer.release()));
                };
                session.idle_sources.push(TrackSource {
                    channel: name.clone(),
                    demuxer,
                    track_index: index,
                    format: format.clone(),
                });
                if let Some(opened) = session.idle_sources.last_mut() {
                    opened.demuxer.select_track(index)?;
                }

                self.log.debug(format_args!(
                    "channel {} {} track {}: {}",
                    name, track, index, format
                ));
                if let Some(channel) = timeline.channel_mut(&name) {
                    if let Some(length) = format.duration_us {
                        let known = channel.length_us().unwrap_or(0);
                        channel.set_length_us(known.max(length));
                    }
                    if track == TrackKind::Video {
                        let frame_length = format
                            .frame_length_us()
                            .unwrap_or_else(|| self.config.default_frame_length_us());
                        channel.set_frame_length_us(frame_length);
                    }
                }
            }
        }
        Ok(())
    }

    /// Builds the pipeline of `kind`. Sources it does not take over stay in
    /// `sources`.
    fn build_pipeline(
        &self,
        kind: TrackKind,
        sources: &mut Vec<TrackSource>,
        output: Option<MediaFormat>,
        muxer: &mut QueuedMuxer,
    ) -> anyhow::Result<Option<TrackTranscoder>> {
        if sources.is_empty() {
            return Ok(None);
        }
        let factory = self.factory.as_ref();
        let pipeline = match (kind, output) {
            (TrackKind::Video, Some(format)) => TrackTranscoder::Video(VideoTrackTranscoder::new(
                sources, &format, factory, &self.log,
            )?),
            (TrackKind::Audio, Some(format)) => TrackTranscoder::Audio(AudioTrackTranscoder::new(
                sources,
                &format,
                &self.config,
                factory,
                &self.log,
            )?),
            (kind, None) => TrackTranscoder::PassThrough(PassThroughTrackTranscoder::new(
                kind, sources, muxer, &self.log,
            )?),
        };
        Ok(Some(pipeline))
    }

    async fn run_segments(
        &mut self,
        session: &mut Session,
        timeline: &mut TimeLine,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let duration_us = timeline.duration_us();
        let interval = self.config.progress_interval.max(1);
        let backoff = self.config.backoff();
        let mut throttle = TranscodeThrottle::new(&self.config);
        let mut iterations: u64 = 0;

        for segment in 0..timeline.segments().len() {
            let clock_us = session.clock_us();
            timeline.start_segment(segment, clock_us)?;
            self.log.info(format_args!(
                "segment {} starts at {}us",
                segment, clock_us
            ));

            let Session {
                video,
                audio,
                muxer,
                ..
            } = &mut *session;
            let muxer = muxer
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("muxer vanished"))?;
            for pipeline in [video.as_mut(), audio.as_mut()].into_iter().flatten() {
                pipeline.setup_segment(
                    &mut *timeline,
                    segment,
                    &mut throttle,
                    self.factory.as_ref(),
                )?;
            }

            loop {
                if cancel.is_cancelled() {
                    anyhow::bail!(TranscodeError::Cancelled);
                }
                let finished = [video.as_ref(), audio.as_ref()]
                    .into_iter()
                    .flatten()
                    .all(TrackTranscoder::is_segment_finished);
                if finished {
                    break;
                }

                throttle.begin_step();
                let mut ctx = StepContext {
                    timeline: &mut *timeline,
                    segment,
                    throttle: &mut throttle,
                    muxer: &mut *muxer,
                };
                let mut stepped = false;
                for pipeline in [video.as_mut(), audio.as_mut()].into_iter().flatten() {
                    stepped |= pipeline.step(&mut ctx)?;
                }

                iterations += 1;
                if iterations % interval == 0 {
                    let clock_us = output_clock_us(video.as_ref(), audio.as_ref());
                    self.progress.report(clock_us, duration_us);
                }
                if !stepped {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            anyhow::bail!(TranscodeError::Cancelled);
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
            throttle.clear();
        }
        Ok(())
    }
}

/// How far the transcoded tracks have progressed. A passthrough track only
/// drives the clock when nothing is transcoded.
fn output_clock_us(video: Option<&TrackTranscoder>, audio: Option<&TrackTranscoder>) -> i64 {
    let pipelines = || [video, audio].into_iter().flatten();
    pipelines()
        .filter(|t| !matches!(t, TrackTranscoder::PassThrough(_)))
        .map(TrackTranscoder::output_presentation_time_us)
        .max()
        .or_else(|| pipelines().map(TrackTranscoder::output_presentation_time_us).max())
        .unwrap_or(0)
}

/// Format of the first channel carrying `kind` in the first segment that
/// has one, falling back to the first opened source.
fn primary_format(
    timeline: &TimeLine,
    kind: TrackKind,
    sources: &[TrackSource],
) -> Option<MediaFormat> {
    let first_channel = (0..timeline.segments().len())
        .flat_map(|segment| timeline.track_channels(segment, kind))
        .next();
    first_channel
        .and_then(|name| sources.iter().find(|s| s.channel == name))
        .or_else(|| sources.first())
        .map(|s| s.format.clone())
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod engine_test;
