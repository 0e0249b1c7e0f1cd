use std::collections::HashMap;

use bytes::Bytes;

use crate::audio_mixer::AudioMixer;
use crate::config::EngineConfig;
use crate::error::TranscodeError;
use crate::media::{BufferFlags, BufferInfo, MediaFactory, MediaFormat, OutputStatus, POLL_TIMEOUT, TrackKind};
use crate::pipeline::{
    DrainState, Sources, StepContext, TrackEncoder, TrackSource, drain_extractors, prepare_slots,
    release_slots, retry_stage,
};
use crate::slot::SlotPool;
use crate::telemetry::Telemetry;
use crate::throttle::{ChannelKey, TranscodeThrottle};
use crate::timeline::{Filter, TimeLine};

/// Decoded PCM that could not be mixed yet: held back by the throttle or
/// belonging to the next segment.
#[derive(Debug, Default)]
pub struct PcmSurface {
    pending: Option<(i64, Bytes)>,
}

pub struct AudioTrackTranscoder {
    sources: Sources,
    pool: SlotPool<PcmSurface>,
    encoder: TrackEncoder,
    mixer: AudioMixer,
    active: Vec<String>,
    filters: HashMap<String, Option<Filter>>,
    segment_start_us: i64,
    segment_duration_us: i64,
    last_segment: bool,
    chunk_frames: usize,
    clock_us: i64,
    eos_queued: bool,
    segment_finished: bool,
    log: Telemetry,
}

impl AudioTrackTranscoder {
    /// Takes over `sources` once the encoder is open; on failure they are
    /// left in place for the caller to release.
    pub fn new(
        sources: &mut Vec<TrackSource>,
        output_format: &MediaFormat,
        config: &EngineConfig,
        factory: &dyn MediaFactory,
        log: &Telemetry,
    ) -> anyhow::Result<Self> {
        let log = log.component("audio");
        let mixer = AudioMixer::new(output_format)?;
        let encoder = TrackEncoder::new(
            TrackKind::Audio,
            factory.create_encoder(output_format)?,
            output_format,
            log.clone(),
        )?;
        log.info(format_args!(
            "audio pipeline: {} channels -> {}",
            sources.len(),
            output_format
        ));
        Ok(Self {
            sources: Sources::new(TrackKind::Audio, std::mem::take(sources)),
            pool: SlotPool::default(),
            encoder,
            mixer,
            active: Vec::new(),
            filters: HashMap::new(),
            segment_start_us: 0,
            segment_duration_us: 0,
            last_segment: false,
            chunk_frames: config.audio_chunk_frames.max(1),
            clock_us: 0,
            eos_queued: false,
            segment_finished: false,
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
            .track_channels(segment, TrackKind::Audio)
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

        self.mixer.configure_segment(&self.active);
        prepare_slots(
            TrackKind::Audio,
            &mut self.pool,
            &mut self.sources,
            &self.active,
            timeline,
            segment,
            throttle,
            factory,
            &self.log,
        )?;
        for name in &self.active {
            if self.pool.get(name).map(|slot| slot.decoder_eos).unwrap_or(true) {
                self.mixer.end_input(name);
            }
        }
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
        if self.segment_finished || self.eos_queued {
            return Ok(stepped);
        }

        stepped |= retry_stage(|| self.drain_decoders(ctx))?;
        while self.feed_encoder()? != DrainState::None {
            stepped = true;
        }
        stepped |= retry_stage(|| {
            drain_extractors(
                TrackKind::Audio,
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
        for name in &self.active {
            let Some(slot) = self.pool.get_mut(name) else {
                continue;
            };
            if slot.is_finished() {
                continue;
            }
            let key = ChannelKey::new(TrackKind::Audio, name);

            let (pts, pcm) = match slot.surface.pending.take() {
                Some(pending) => pending,
                None => match slot.next_output()? {
                    OutputStatus::TryAgainLater => continue,
                    OutputStatus::FormatChanged => {
                        if let Some(format) = slot.output_format() {
                            self.mixer.set_input_format(name, &format)?;
                        }
                        state = state.merge(DrainState::Retry);
                        continue;
                    }
                    OutputStatus::BuffersChanged => {
                        state = state.merge(DrainState::Retry);
                        continue;
                    }
                    OutputStatus::Buffer { index, info } => {
                        if info.is_end_of_stream() {
                            slot.release_output(index, false)?;
                            slot.decoder_eos = true;
                            self.mixer.end_input(name);
                            ctx.throttle.remove(&key);
                            self.log.debug(format_args!("{} decoder reached end of stream", name));
                            state = DrainState::Consumed;
                            continue;
                        }
                        let data = slot.output_buffer(index)?;
                        let size = info.size.min(data.len());
                        slot.release_output(index, false)?;
                        (info.presentation_time_us, data.slice(..size))
                    }
                },
            };

            let channel = ctx.timeline.channel_mut(name).ok_or_else(|| {
                TranscodeError::Configuration(format!("unknown channel {}", name))
            })?;
            let end_time_us = channel.end_time_us();
            let cursor = *channel.cursor(TrackKind::Audio);

            if pts >= end_time_us {
                slot.surface.pending = Some((pts, pcm));
                slot.segment_eos = true;
                self.mixer.end_input(name);
                ctx.throttle.remove(&key);
                state = DrainState::Consumed;
                continue;
            }
            if pts + self.mixer.duration_us(name, pcm.len()) <= cursor.input_start_us {
                state = DrainState::Consumed;
                continue;
            }

            let output_us = cursor.output_time_us(pts.max(cursor.input_start_us));
            if !ctx.throttle.can_proceed(&key, output_us) {
                slot.surface.pending = Some((pts, pcm));
                ctx.throttle.report(&key, output_us);
                continue;
            }

            state = DrainState::Consumed;
            let (mut pts, mut pcm) = (pts, pcm);
            if pts < cursor.input_start_us {
                let cut = self
                    .mixer
                    .bytes_for_us(name, cursor.input_start_us - pts)
                    .min(pcm.len());
                pts += self.mixer.duration_us(name, cut);
                pcm = pcm.slice(cut..);
            }
            if pts + self.mixer.duration_us(name, pcm.len()) > end_time_us {
                let keep = self.mixer.bytes_for_us(name, end_time_us - pts).min(pcm.len());
                let rest = pcm.slice(keep..);
                slot.surface.pending = Some((pts + self.mixer.duration_us(name, keep), rest));
                slot.segment_eos = true;
                self.mixer.end_input(name);
                ctx.throttle.remove(&key);
                pcm = pcm.slice(..keep);
                if pcm.is_empty() {
                    continue;
                }
            }

            let gain = if cursor.time_scale() > 1 {
                0.0
            } else {
                match self.filters.get(name).copied().flatten() {
                    Some(filter) => filter.gain(
                        output_us - self.segment_start_us,
                        self.segment_duration_us,
                    ),
                    None => 1.0,
                }
            };
            self.mixer
                .queue(name, &pcm, cursor.output_time_us(pts), gain)?;
            channel.cursor_mut(TrackKind::Audio).actual_end_us =
                pts + self.mixer.duration_us(name, pcm.len());
            if ctx.throttle.is_participating(&key) {
                ctx.throttle.report(&key, output_us);
            }
        }
        Ok(state)
    }

    /// Hands mixed PCM to the encoder, or its end of stream once the last
    /// segment is fully mixed.
    fn feed_encoder(&mut self) -> anyhow::Result<DrainState> {
        if self.eos_queued || self.segment_finished {
            return Ok(DrainState::None);
        }
        let all_finished = self.active.iter().all(|name| {
            self.pool
                .get(name)
                .map(|slot| slot.is_finished())
                .unwrap_or(true)
        });
        let available = self.mixer.available_frames(all_finished);

        if available == 0 {
            if !all_finished {
                return Ok(DrainState::None);
            }
            if !self.last_segment {
                self.segment_finished = true;
                return Ok(DrainState::None);
            }
            let Some(index) = self.encoder.encoder().dequeue_input_buffer(POLL_TIMEOUT)? else {
                return Ok(DrainState::None);
            };
            self.log.info(format_args!(
                "last segment mixed up to {}us, queueing end of stream",
                self.clock_us
            ));
            self.encoder.encoder().queue_input_buffer(
                index,
                &[],
                BufferInfo::end_of_stream(self.clock_us),
            )?;
            self.eos_queued = true;
            return Ok(DrainState::Consumed);
        }

        let Some(index) = self.encoder.encoder().dequeue_input_buffer(POLL_TIMEOUT)? else {
            return Ok(DrainState::None);
        };
        let chunk = self
            .mixer
            .mix(self.chunk_frames, all_finished)
            .ok_or_else(|| anyhow::anyhow!("mixer lost {} available frames", available))?;
        self.encoder.encoder().queue_input_buffer(
            index,
            &chunk.data,
            BufferInfo::new(chunk.data.len(), chunk.pts_us, BufferFlags::NONE),
        )?;
        self.clock_us = self.clock_us.max(chunk.end_us);
        Ok(DrainState::Consumed)
    }

    pub fn is_segment_finished(&self) -> bool {
        if self.last_segment {
            self.encoder.is_eos()
        } else {
            self.segment_finished
        }
    }

    pub fn output_presentation_time_us(&self) -> i64 {
        self.clock_us
    }

    pub fn release_decoders(&mut self) -> anyhow::Result<()> {
        release_slots(&mut self.pool, &mut self.sources, None)
    }

    pub fn release_encoder(&mut self) -> anyhow::Result<()> {
        self.encoder.release()
    }

    pub fn release_demuxers(&mut self) -> anyhow::Result<()> {
        self.sources.release()
    }
}
