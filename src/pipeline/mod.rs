//! Track pipelines: one per output track kind, stepped by the engine.
//!
//! A pipeline pulls samples out of per-channel demuxers into decoder slots,
//! turns decoded output into encoder input (compositing for video, mixing
//! for audio) and drains the encoder into the [`QueuedMuxer`]. Every stage is
//! non-blocking; `step` reports whether anything moved.

pub mod audio;
pub mod passthrough;
pub mod video;

use std::collections::HashMap;

pub use audio::AudioTrackTranscoder;
pub use passthrough::PassThroughTrackTranscoder;
pub use video::VideoTrackTranscoder;

use crate::error::{TranscodeError, with_cleanup};
use crate::media::{Demuxer, Encoder, MediaFactory, MediaFormat, OutputStatus, POLL_TIMEOUT, TrackKind};
use crate::muxer::QueuedMuxer;
use crate::slot::{DecoderSlot, FeedOutcome, SlotPool};
use crate::telemetry::Telemetry;
use crate::throttle::{ChannelKey, TranscodeThrottle};
use crate::timeline::TimeLine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    /// Nothing to do right now.
    None,
    /// Moved data, more may be available.
    Consumed,
    /// State changed without moving data, poll again immediately.
    Retry,
}

impl DrainState {
    fn merge(self, other: DrainState) -> DrainState {
        match (self, other) {
            (DrainState::Consumed, _) | (_, DrainState::Consumed) => DrainState::Consumed,
            (DrainState::Retry, _) | (_, DrainState::Retry) => DrainState::Retry,
            _ => DrainState::None,
        }
    }
}

/// Runs `stage` once, again only while it reports [`DrainState::Retry`].
/// Returns whether the stage made any progress.
pub(crate) fn retry_stage(
    mut stage: impl FnMut() -> anyhow::Result<DrainState>,
) -> anyhow::Result<bool> {
    let mut progressed = false;
    loop {
        match stage()? {
            DrainState::None => return Ok(progressed),
            DrainState::Consumed => return Ok(true),
            DrainState::Retry => progressed = true,
        }
    }
}

/// Shared state a pipeline step works on.
pub struct StepContext<'a> {
    pub timeline: &'a mut TimeLine,
    pub segment: usize,
    pub throttle: &'a mut TranscodeThrottle,
    pub muxer: &'a mut QueuedMuxer,
}

/// Input track of one channel, opened and selected.
pub struct TrackSource {
    pub channel: String,
    pub demuxer: Box<dyn Demuxer>,
    pub track_index: usize,
    pub format: MediaFormat,
}

pub enum TrackTranscoder {
    Video(VideoTrackTranscoder),
    Audio(AudioTrackTranscoder),
    PassThrough(PassThroughTrackTranscoder),
}

impl TrackTranscoder {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackTranscoder::Video(_) => TrackKind::Video,
            TrackTranscoder::Audio(_) => TrackKind::Audio,
            TrackTranscoder::PassThrough(t) => t.kind(),
        }
    }

    /// Binds the pipeline to segment `segment`, which must already be started.
    pub fn setup_segment(
        &mut self,
        timeline: &mut TimeLine,
        segment: usize,
        throttle: &mut TranscodeThrottle,
        factory: &dyn MediaFactory,
    ) -> anyhow::Result<()> {
        match self {
            TrackTranscoder::Video(t) => t.setup_segment(timeline, segment, throttle, factory),
            TrackTranscoder::Audio(t) => t.setup_segment(timeline, segment, throttle, factory),
            TrackTranscoder::PassThrough(t) => t.setup_segment(timeline, segment),
        }
    }

    pub fn step(&mut self, ctx: &mut StepContext<'_>) -> anyhow::Result<bool> {
        match self {
            TrackTranscoder::Video(t) => t.step(ctx),
            TrackTranscoder::Audio(t) => t.step(ctx),
            TrackTranscoder::PassThrough(t) => t.step(ctx),
        }
    }

    pub fn is_segment_finished(&self) -> bool {
        match self {
            TrackTranscoder::Video(t) => t.is_segment_finished(),
            TrackTranscoder::Audio(t) => t.is_segment_finished(),
            TrackTranscoder::PassThrough(t) => t.is_segment_finished(),
        }
    }

    /// Output time up to which this track has produced data.
    pub fn output_presentation_time_us(&self) -> i64 {
        match self {
            TrackTranscoder::Video(t) => t.output_presentation_time_us(),
            TrackTranscoder::Audio(t) => t.output_presentation_time_us(),
            TrackTranscoder::PassThrough(t) => t.output_presentation_time_us(),
        }
    }

    pub fn release_decoders(&mut self) -> anyhow::Result<()> {
        match self {
            TrackTranscoder::Video(t) => t.release_decoders(),
            TrackTranscoder::Audio(t) => t.release_decoders(),
            TrackTranscoder::PassThrough(_) => Ok(()),
        }
    }

    pub fn release_encoder(&mut self) -> anyhow::Result<()> {
        match self {
            TrackTranscoder::Video(t) => t.release_encoder(),
            TrackTranscoder::Audio(t) => t.release_encoder(),
            TrackTranscoder::PassThrough(_) => Ok(()),
        }
    }

    pub fn release_demuxers(&mut self) -> anyhow::Result<()> {
        match self {
            TrackTranscoder::Video(t) => t.release_demuxers(),
            TrackTranscoder::Audio(t) => t.release_demuxers(),
            TrackTranscoder::PassThrough(t) => t.release_demuxers(),
        }
    }
}

/// Releases every item, returning a single leak error naming all failures.
pub(crate) fn release_all<T>(
    items: impl IntoIterator<Item = T>,
    mut release: impl FnMut(T) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let failures: Vec<String> = items
        .into_iter()
        .filter_map(|item| release(item).err().map(|e| format!("{:#}", e)))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(TranscodeError::ResourceLeak(failures.join("; ")).into())
    }
}

/// Demuxers of a pipeline that are not currently owned by a decoder slot.
pub(crate) struct Sources {
    kind: TrackKind,
    parked: HashMap<String, TrackSource>,
    tracks: HashMap<String, (usize, MediaFormat)>,
}

impl Sources {
    pub(crate) fn new(kind: TrackKind, sources: Vec<TrackSource>) -> Self {
        let mut parked = HashMap::new();
        let mut tracks = HashMap::new();
        for source in sources {
            tracks.insert(
                source.channel.clone(),
                (source.track_index, source.format.clone()),
            );
            parked.insert(source.channel.clone(), source);
        }
        Self {
            kind,
            parked,
            tracks,
        }
    }

    pub(crate) fn contains(&self, channel: &str) -> bool {
        self.tracks.contains_key(channel)
    }

    fn checkout(&mut self, channel: &str) -> anyhow::Result<TrackSource> {
        self.parked.remove(channel).ok_or_else(|| {
            TranscodeError::Configuration(format!("no {} input for channel {}", self.kind, channel))
                .into()
        })
    }

    fn park(&mut self, channel: &str, demuxer: Box<dyn Demuxer>) {
        if let Some((track_index, format)) = self.tracks.get(channel) {
            self.parked.insert(
                channel.to_string(),
                TrackSource {
                    channel: channel.to_string(),
                    demuxer,
                    track_index: *track_index,
                    format: format.clone(),
                },
            );
        }
    }

    fn release(&mut self) -> anyhow::Result<()> {
        let sources: Vec<TrackSource> = self.parked.drain().map(|(_, source)| source).collect();
        release_all(sources, |mut source| source.demuxer.release())
    }
}

/// Releases every slot of `pool`, handing the demuxers back to `sources`.
pub(crate) fn release_slots<S>(
    pool: &mut SlotPool<S>,
    sources: &mut Sources,
    throttle: Option<&mut TranscodeThrottle>,
) -> anyhow::Result<()> {
    let slots: Vec<DecoderSlot<S>> = pool.drain().collect();
    let mut throttle = throttle;
    release_all(slots, |slot| {
        let channel = slot.channel().to_string();
        if let Some(throttle) = throttle.as_deref_mut() {
            throttle.remove(&ChannelKey::new(slot.kind(), &channel));
        }
        let (demuxer, result) = slot.release();
        sources.park(&channel, demuxer);
        result
    })
}

/// Makes sure every channel in `active` owns a started decoder slot, evicting
/// slots of channels that left the segment when the pool is full.
#[allow(clippy::too_many_arguments)]
pub(crate) fn prepare_slots<S: Default>(
    kind: TrackKind,
    pool: &mut SlotPool<S>,
    sources: &mut Sources,
    active: &[String],
    timeline: &mut TimeLine,
    segment: usize,
    throttle: &mut TranscodeThrottle,
    factory: &dyn MediaFactory,
    log: &Telemetry,
) -> anyhow::Result<()> {
    for name in active {
        if !pool.contains(name) {
            if let Some(evicted) = pool.make_room(active)? {
                let channel = evicted.channel().to_string();
                log.debug(format_args!("evicting {} decoder of {}", kind, channel));
                throttle.remove(&ChannelKey::new(kind, &channel));
                let (demuxer, result) = evicted.release();
                sources.park(&channel, demuxer);
                result?;
            }
            let source = sources.checkout(name)?;
            let decoder = match factory.create_decoder(&source.format) {
                Ok(decoder) => decoder,
                Err(e) => {
                    sources.park(name, source.demuxer);
                    return Err(e);
                }
            };
            let mut slot = DecoderSlot::new(
                name,
                kind,
                source.demuxer,
                decoder,
                source.track_index,
                source.format,
                log.clone(),
            );

            // a fresh decoder starts at the channel's input position
            let input_start = timeline
                .channel(name)
                .map(|c| c.cursor(kind).input_start_us)
                .unwrap_or(0);
            let resume = (input_start > 0).then_some(input_start);
            if let Some(channel) = timeline.segment_channel_mut(segment, name) {
                channel.mark_seek_fired(kind);
            }
            if let Err(e) = slot.start(resume) {
                let (demuxer, released) = slot.release();
                sources.park(name, demuxer);
                return Err(with_cleanup(e, released));
            }
            pool.insert(slot)?;
        }

        let Some(slot) = pool.get_mut(name) else {
            continue;
        };
        slot.segment_eos = false;
        if slot.decoder_eos {
            continue;
        }
        let Some(channel) = timeline.channel(name) else {
            continue;
        };
        let cursor = channel.cursor(kind);
        throttle.participate(
            ChannelKey::new(kind, name),
            cursor.output_time_us(cursor.input_start_us),
        );
    }
    Ok(())
}

/// Applies pending seeks and feeds one sample into every active decoder.
pub(crate) fn drain_extractors<S>(
    kind: TrackKind,
    pool: &mut SlotPool<S>,
    active: &[String],
    timeline: &mut TimeLine,
    segment: usize,
) -> anyhow::Result<DrainState> {
    let mut state = DrainState::None;
    for name in active {
        let Some(slot) = pool.get_mut(name) else {
            continue;
        };
        if let Some(channel) = timeline.segment_channel_mut(segment, name) {
            if let Some(target) = channel.pending_seek(kind) {
                channel.mark_seek_fired(kind);
                if slot.apply_seek(target)? {
                    state = DrainState::Consumed;
                }
            }
        }
        match slot.feed()? {
            FeedOutcome::Idle => {}
            FeedOutcome::Skipped | FeedOutcome::Fed(_) | FeedOutcome::EndOfStream => {
                state = DrainState::Consumed;
            }
        }
    }
    Ok(state)
}

/// Encoder end of a track pipeline.
pub(crate) struct TrackEncoder {
    kind: TrackKind,
    encoder: Box<dyn Encoder>,
    actual_format: Option<MediaFormat>,
    eos: bool,
    started: bool,
    released: bool,
    log: Telemetry,
}

impl TrackEncoder {
    pub(crate) fn new(
        kind: TrackKind,
        mut encoder: Box<dyn Encoder>,
        format: &MediaFormat,
        log: Telemetry,
    ) -> anyhow::Result<Self> {
        if let Err(e) = encoder.configure(format).and_then(|()| encoder.start()) {
            return Err(with_cleanup(e, encoder.release()));
        }
        Ok(Self {
            kind,
            encoder,
            actual_format: None,
            eos: false,
            started: true,
            released: false,
            log,
        })
    }

    pub(crate) fn encoder(&mut self) -> &mut dyn Encoder {
        self.encoder.as_mut()
    }

    pub(crate) fn is_eos(&self) -> bool {
        self.eos
    }

    /// Moves one encoder output into the muxer.
    pub(crate) fn drain(&mut self, muxer: &mut QueuedMuxer) -> anyhow::Result<DrainState> {
        if self.eos || self.released {
            return Ok(DrainState::None);
        }
        match self.encoder.dequeue_output_buffer(POLL_TIMEOUT)? {
            OutputStatus::TryAgainLater => Ok(DrainState::None),
            OutputStatus::BuffersChanged => Ok(DrainState::Retry),
            OutputStatus::FormatChanged => {
                if self.actual_format.is_some() {
                    anyhow::bail!(TranscodeError::Format(format!(
                        "{} encoder output format changed twice",
                        self.kind
                    )));
                }
                let format = self.encoder.output_format().ok_or_else(|| {
                    TranscodeError::Format(format!(
                        "{} encoder announced a format change without a format",
                        self.kind
                    ))
                })?;
                self.log
                    .info(format_args!("{} encoder output format {}", self.kind, format));
                muxer.set_output_format(self.kind, &format)?;
                self.actual_format = Some(format);
                Ok(DrainState::Retry)
            }
            OutputStatus::Buffer { index, info } => {
                if self.actual_format.is_none() {
                    anyhow::bail!(TranscodeError::Format(format!(
                        "{} encoder produced output before its format",
                        self.kind
                    )));
                }
                if info.flags.is_codec_config() {
                    // already carried by the output format
                    self.encoder.release_output_buffer(index, false)?;
                    return Ok(DrainState::Retry);
                }
                if info.size > 0 {
                    let data = self.encoder.output_buffer(index)?;
                    let size = info.size.min(data.len());
                    muxer.write_sample_data(self.kind, &data[..size], &info)?;
                }
                self.encoder.release_output_buffer(index, false)?;
                if info.is_end_of_stream() {
                    self.log.debug(format_args!("{} encoder reached end of stream", self.kind));
                    self.eos = true;
                }
                Ok(DrainState::Consumed)
            }
        }
    }

    pub(crate) fn release(&mut self) -> anyhow::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if self.started {
            self.started = false;
            self.encoder.stop()?;
        }
        self.encoder.release()
    }
}
