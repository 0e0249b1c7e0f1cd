use std::collections::HashMap;

use crate::error::{TranscodeError, with_cleanup};
use crate::media::{Compositor, Layer, MediaFactory, MediaFormat, OutputStatus, TrackKind, VideoFrame};
use crate::pipeline::{
    DrainState, Sources, StepContext, TrackEncoder, TrackSource, drain_extractors, prepare_slots,
    release_slots, retry_stage,
};
use crate::slot::SlotPool;
use crate::telemetry::Telemetry;
use crate::throttle::{ChannelKey, TranscodeThrottle};
use crate::timeline::{Filter, TimeLine};

/// Decoded picture waiting to be composited.
#[derive(Debug, Default)]
pub struct OutputSurface {
    ready: Option<VideoFrame>,
    output_pts_us: i64,
    alpha: f32,
}

pub struct VideoTrackTranscoder {
    sources: Sources,
    pool: SlotPool<OutputSurface>,
    encoder: TrackEncoder,
    compositor: Box<dyn Compositor>,
    output_format: MediaFormat,
    active: Vec<String>,
    filters: HashMap<String, Option<Filter>>,
    segment_start_us: i64,
    segment_duration_us: i64,
    last_segment: bool,
    frame_end_us: i64,
    last_submitted_us: Option<i64>,
    eos_signalled: bool,
    segment_finished: bool,
    compositor_released: bool,
    log: Telemetry,
}

impl VideoTrackTranscoder {
    /// Takes over `sources` once every codec is open; on failure they are
    /// left in place for the caller to release.
    pub fn new(
        sources: &mut Vec<TrackSource>,
        output_format: &MediaFormat,
        factory: &dyn MediaFactory,
        log: &Telemetry,
    ) -> anyhow::Result<Self> {
        let log = log.component("video");
        let mut encoder = TrackEncoder::new(
            TrackKind::Video,
            factory.create_encoder(output_format)?,
            output_format,
            log.clone(),
        )?;
        let compositor = match factory.create_compositor(output_format) {
            Ok(compositor) => compositor,
            Err(e) => return Err(with_cleanup(e, encoder.release())),
        };
        log.info(format_args!(
            "video pipeline: {} channels -> {}",
            sources.len(),
            output_format
        ));
        Ok(Self {
            sources: Sources::new(TrackKind::Video, std::mem::take(sources)),
            pool: SlotPool::default(),
            encoder,
            compositor,
            output_format: output_format.clone(),
            active: Vec::new(),
            filters: HashMap::new(),
            segment_start_us: 0,
            segment_duration_us: 0,
            last_segment: false,
            frame_end_us: 0,
            last_submitted_us: None,
            eos_signalled: false,
            segment_finished: false,
            compositor_released: false,
            log,
        })
    }

    pub fn setup_segment(
        &mut self,
        timeline: &mut TimeLine,
        segment: usize,
        throttle: &mut TranscodeThrottle,
        factory: &dyn MediaFactory,
    ) -> anyhow::Result<()> {
        let Some(current) = timeline.segment(segment) else {
            anyhow::bail!(TranscodeError::Configuration(format!(
                "segment {} does not exist",
                segment
            )));
        };
        self.segment_start_us = current.output_start_us().unwrap_or(0);
        self.segment_duration_us = current.planned_duration_us().unwrap_or(0);
        self.last_segment = current.is_last();
        self.active = timeline
            .track_channels(segment, TrackKind::Video)
            .into_iter()
            .filter(|name| self.sources.contains(name))
            .collect();
        self.filters = self
            .active
            .iter()
            .map(|name| {
                let filter = current.channel(name).and_then(|c| c.filter());
                (name.clone(), filter)
            })
            .collect();
        self.segment_finished = false;

        prepare_slots(
            TrackKind::Video,
            &mut self.pool,
            &mut self.sources,
            &self.active,
            timeline,
            segment,
            throttle,
            factory,
            &self.log,
        )?;
        self.log.debug(format_args!(
            "segment {} at {}us: {:?}",
            segment, self.segment_start_us, self.active
        ));
        Ok(())
    }

    pub fn step(&mut self, ctx: &mut StepContext<'_>) -> anyhow::Result<bool> {
        let mut stepped = false;
        while self.encoder.drain(ctx.muxer)? != DrainState::None {
            stepped = true;
        }
        if self.segment_finished || self.eos_signalled {
            return Ok(stepped);
        }

        // at most one decoded frame per slot and one composite per step
        stepped |= retry_stage(|| self.drain_decoders(ctx))?;
        if self.composite()? {
            stepped = true;
        }
        self.check_segment_end()?;

        stepped |= retry_stage(|| {
            drain_extractors(
                TrackKind::Video,
                &mut self.pool,
                &self.active,
                ctx.timeline,
                ctx.segment,
            )
        })?;
        Ok(stepped)
    }

    fn drain_decoders(&mut self, ctx: &mut StepContext<'_>) -> anyhow::Result<DrainState> {
        let mut state = DrainState::None;
        let mut composite_pending = self.pool.iter().any(|slot| slot.surface.ready.is_some());

        for name in &self.active {
            let Some(slot) = self.pool.get_mut(name) else {
                continue;
            };
            if slot.is_finished() || slot.surface.ready.is_some() {
                continue;
            }
            let key = ChannelKey::new(TrackKind::Video, name);
            let (index, info) = match slot.next_output()? {
                OutputStatus::TryAgainLater => continue,
                OutputStatus::FormatChanged | OutputStatus::BuffersChanged => {
                    state = state.merge(DrainState::Retry);
                    continue;
                }
                OutputStatus::Buffer { index, info } => (index, info),
            };

            if info.is_end_of_stream() {
                slot.release_output(index, false)?;
                slot.decoder_eos = true;
                ctx.throttle.remove(&key);
                self.log.debug(format_args!("{} decoder reached end of stream", name));
                state = DrainState::Consumed;
                continue;
            }

            let channel = ctx.timeline.channel_mut(name).ok_or_else(|| {
                TranscodeError::Configuration(format!("unknown channel {}", name))
            })?;
            let pts = info.presentation_time_us;
            if pts >= channel.end_time_us() {
                // first frame of a later segment
                slot.hold(index, info);
                slot.segment_eos = true;
                ctx.throttle.remove(&key);
                state = DrainState::Consumed;
                continue;
            }
            let cursor = *channel.cursor(TrackKind::Video);
            if pts < cursor.input_start_us {
                slot.release_output(index, false)?;
                state = DrainState::Consumed;
                continue;
            }

            let output_us = cursor.output_time_us(pts);
            if !composite_pending && !ctx.throttle.can_proceed(&key, output_us) {
                slot.hold(index, info);
                ctx.throttle.report(&key, output_us);
                continue;
            }

            let data = slot.output_buffer(index)?;
            let (width, height) = slot
                .output_format()
                .map(|f| (f.width, f.height))
                .unwrap_or((self.output_format.width, self.output_format.height));
            slot.release_output(index, true)?;

            let frame_length_us = channel.frame_length_us();
            channel.cursor_mut(TrackKind::Video).actual_end_us = pts + frame_length_us;
            let frame_end_us = cursor.output_time_us(pts + frame_length_us);
            self.frame_end_us = self.frame_end_us.max(frame_end_us);

            let alpha = match self.filters.get(name).copied().flatten() {
                Some(filter) => filter.opacity(
                    output_us - self.segment_start_us,
                    self.segment_duration_us,
                ),
                None => 1.0,
            };
            slot.surface.ready = Some(VideoFrame::new(data, width, height, pts));
            slot.surface.output_pts_us = output_us;
            slot.surface.alpha = alpha;
            composite_pending = true;

            ctx.throttle.report(&key, output_us);
            state = DrainState::Consumed;
        }
        Ok(state)
    }

    /// Composes one output frame once every unfinished active slot is ready.
    fn composite(&mut self) -> anyhow::Result<bool> {
        let mut ready = 0;
        let mut pts_us = i64::MIN;
        for name in &self.active {
            let Some(slot) = self.pool.get(name) else {
                continue;
            };
            match &slot.surface.ready {
                Some(_) => {
                    ready += 1;
                    pts_us = pts_us.max(slot.surface.output_pts_us);
                }
                None if slot.is_finished() => {}
                None => return Ok(false),
            }
        }
        if ready == 0 {
            return Ok(false);
        }
        if let Some(last) = self.last_submitted_us {
            if pts_us <= last {
                pts_us = last + 1;
            }
        }

        let frame = {
            let layers: Vec<Layer<'_>> = self
                .active
                .iter()
                .filter_map(|name| self.pool.get(name))
                .filter_map(|slot| {
                    slot.surface.ready.as_ref().map(|frame| Layer {
                        frame,
                        alpha: slot.surface.alpha,
                    })
                })
                .collect();
            self.compositor.compose(&layers, pts_us)?
        };
        self.encoder.encoder().queue_frame(frame)?;
        self.last_submitted_us = Some(pts_us);
        self.log.trace(format_args!("composited {} layers at {}us", ready, pts_us));

        for slot in self.pool.iter_mut() {
            slot.surface.ready = None;
        }
        Ok(true)
    }

    fn check_segment_end(&mut self) -> anyhow::Result<()> {
        let all_finished = self.active.iter().all(|name| {
            self.pool
                .get(name)
                .map(|slot| slot.is_finished() && slot.surface.ready.is_none())
                .unwrap_or(true)
        });
        if !all_finished {
            return Ok(());
        }
        if self.last_segment {
            if !self.eos_signalled {
                self.log.info(format_args!(
                    "last segment done at {}us, signalling end of stream",
                    self.output_presentation_time_us()
                ));
                self.encoder.encoder().signal_end_of_input_stream()?;
                self.eos_signalled = true;
            }
        } else {
            self.segment_finished = true;
        }
        Ok(())
    }

    pub fn is_segment_finished(&self) -> bool {
        if self.last_segment {
            self.encoder.is_eos()
        } else {
            self.segment_finished
        }
    }

    pub fn output_presentation_time_us(&self) -> i64 {
        let submitted = self.last_submitted_us.map(|pts| pts + 1).unwrap_or(0);
        self.frame_end_us.max(submitted)
    }

    pub fn release_decoders(&mut self) -> anyhow::Result<()> {
        release_slots(&mut self.pool, &mut self.sources, None)
    }

    pub fn release_encoder(&mut self) -> anyhow::Result<()> {
        let encoder = self.encoder.release();
        let compositor = if self.compositor_released {
            Ok(())
        } else {
            self.compositor_released = true;
            self.compositor.release()
        };
        encoder.and(compositor)
    }

    pub fn release_demuxers(&mut self) -> anyhow::Result<()> {
        self.sources.release()
    }
}
