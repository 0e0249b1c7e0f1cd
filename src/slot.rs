//! Decoder slots: one demuxer + decoder pair per active channel of a track
//! pipeline, and the bounded pool that owns them.

use crate::error::TranscodeError;
use crate::media::{
    BufferFlags, BufferInfo, Codec, Demuxer, MediaFormat, OutputStatus, POLL_TIMEOUT, SeekMode,
    TrackKind,
};
use crate::telemetry::Telemetry;
use bytes::Bytes;

/// Hardware decoders are scarce: a pipeline never keeps more than this many
/// open at once.
pub const MAX_DECODER_SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Decoder not started yet.
    Idle,
    /// Next output has to be dequeued from the decoder.
    PendingDequeue,
    /// A decoded buffer was held back and is returned again on the next poll.
    Held { index: usize, info: BufferInfo },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Decoder has no free input buffer, or the input is already finished.
    Idle,
    /// Skipped a sample that belongs to another track.
    Skipped,
    Fed(i64),
    EndOfStream,
}

pub struct DecoderSlot<S> {
    channel: String,
    kind: TrackKind,
    demuxer: Box<dyn Demuxer>,
    decoder: Box<dyn Codec>,
    track_index: usize,
    input_format: MediaFormat,
    state: SlotState,
    pub extractor_eos: bool,
    pub decoder_eos: bool,
    pub segment_eos: bool,
    sample: Vec<u8>,
    /// Pipeline specific per-slot state.
    pub surface: S,
    log: Telemetry,
}

impl<S: Default> DecoderSlot<S> {
    pub fn new(
        channel: &str,
        kind: TrackKind,
        demuxer: Box<dyn Demuxer>,
        decoder: Box<dyn Codec>,
        track_index: usize,
        input_format: MediaFormat,
        log: Telemetry,
    ) -> Self {
        Self {
            channel: channel.to_string(),
            kind,
            demuxer,
            decoder,
            track_index,
            input_format,
            state: SlotState::Idle,
            extractor_eos: false,
            decoder_eos: false,
            segment_eos: false,
            sample: Vec::new(),
            surface: S::default(),
            log,
        }
    }
}

impl<S> DecoderSlot<S> {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state != SlotState::Idle
    }

    pub fn is_holding(&self) -> bool {
        matches!(self.state, SlotState::Held { .. })
    }

    /// No more output for the current segment.
    pub fn is_finished(&self) -> bool {
        self.decoder_eos || self.segment_eos
    }

    /// Configures and starts the decoder, first moving the demuxer to
    /// `resume_at_us` when the channel does not start from the beginning.
    pub fn start(&mut self, resume_at_us: Option<i64>) -> anyhow::Result<()> {
        if self.is_started() {
            return Ok(());
        }
        self.decoder.configure(&self.input_format)?;
        if let Some(time_us) = resume_at_us {
            self.log.debug(format_args!(
                "{} {} resumes at {}us",
                self.kind, self.channel, time_us
            ));
            self.demuxer.seek_to(time_us, SeekMode::PreviousKeyframe)?;
        }
        self.decoder.start()?;
        self.state = SlotState::PendingDequeue;
        Ok(())
    }

    /// Moves the demuxer to `target_us` unless it is already past it.
    /// Returns whether a seek was issued.
    pub fn apply_seek(&mut self, target_us: i64) -> anyhow::Result<bool> {
        let current = self
            .demuxer
            .read_sample(&mut self.sample)?
            .map(|sample| sample.presentation_time_us);
        if matches!(current, Some(pts) if pts >= target_us) {
            return Ok(false);
        }
        self.log.debug(format_args!(
            "{} {} seeks from {:?} to {}us",
            self.kind, self.channel, current, target_us
        ));
        self.demuxer.seek_to(target_us, SeekMode::PreviousKeyframe)?;
        self.extractor_eos = false;
        Ok(true)
    }

    /// Moves one sample from the demuxer into the decoder.
    pub fn feed(&mut self) -> anyhow::Result<FeedOutcome> {
        if self.extractor_eos || !self.is_started() {
            return Ok(FeedOutcome::Idle);
        }
        if let Some(track) = self.demuxer.sample_track_index() {
            if track != self.track_index {
                self.demuxer.advance();
                return Ok(FeedOutcome::Skipped);
            }
        }

        let Some(index) = self.decoder.dequeue_input_buffer(POLL_TIMEOUT)? else {
            return Ok(FeedOutcome::Idle);
        };

        match self.demuxer.read_sample(&mut self.sample)? {
            None => {
                self.decoder
                    .queue_input_buffer(index, &[], BufferInfo::end_of_stream(0))?;
                self.extractor_eos = true;
                Ok(FeedOutcome::EndOfStream)
            }
            Some(sample) => {
                let flags = if sample.key_frame {
                    BufferFlags::KEY_FRAME
                } else {
                    BufferFlags::NONE
                };
                let size = sample.size.min(self.sample.len());
                self.decoder.queue_input_buffer(
                    index,
                    &self.sample[..size],
                    BufferInfo::new(size, sample.presentation_time_us, flags),
                )?;
                self.demuxer.advance();
                Ok(FeedOutcome::Fed(sample.presentation_time_us))
            }
        }
    }

    /// Held buffer if there is one, otherwise the decoder's next output.
    pub fn next_output(&mut self) -> anyhow::Result<OutputStatus> {
        match self.state {
            SlotState::Idle => Ok(OutputStatus::TryAgainLater),
            SlotState::Held { index, info } => {
                self.state = SlotState::PendingDequeue;
                Ok(OutputStatus::Buffer { index, info })
            }
            SlotState::PendingDequeue => self.decoder.dequeue_output_buffer(POLL_TIMEOUT),
        }
    }

    /// Keeps a dequeued buffer for a later poll.
    pub fn hold(&mut self, index: usize, info: BufferInfo) {
        self.state = SlotState::Held { index, info };
    }

    pub fn output_buffer(&mut self, index: usize) -> anyhow::Result<Bytes> {
        self.decoder.output_buffer(index)
    }

    pub fn release_output(&mut self, index: usize, render: bool) -> anyhow::Result<()> {
        self.decoder.release_output_buffer(index, render)
    }

    pub fn output_format(&self) -> Option<MediaFormat> {
        self.decoder.output_format()
    }

    /// Stops and releases the decoder and hands the demuxer back, together
    /// with the outcome of the release.
    pub fn release(mut self) -> (Box<dyn Demuxer>, anyhow::Result<()>) {
        let result = self.shutdown();
        (self.demuxer, result)
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        if let SlotState::Held { index, .. } = self.state {
            self.decoder.release_output_buffer(index, false)?;
        }
        if self.is_started() {
            self.decoder.stop()?;
        }
        self.state = SlotState::Idle;
        self.decoder.release()
    }
}

/// Decoder slots of one track pipeline, keyed by channel name.
pub struct SlotPool<S> {
    slots: Vec<DecoderSlot<S>>,
    capacity: usize,
}

impl<S> Default for SlotPool<S> {
    fn default() -> Self {
        Self::new(MAX_DECODER_SLOTS)
    }
}

impl<S> SlotPool<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.slots.iter().any(|slot| slot.channel == channel)
    }

    pub fn get(&self, channel: &str) -> Option<&DecoderSlot<S>> {
        self.slots.iter().find(|slot| slot.channel == channel)
    }

    pub fn get_mut(&mut self, channel: &str) -> Option<&mut DecoderSlot<S>> {
        self.slots.iter_mut().find(|slot| slot.channel == channel)
    }

    /// Frees one slot when the pool is full, picking one whose channel is not
    /// in `active`. The evicted slot is returned for release.
    pub fn make_room(&mut self, active: &[String]) -> anyhow::Result<Option<DecoderSlot<S>>> {
        if self.slots.len() < self.capacity {
            return Ok(None);
        }
        let Some(position) = self
            .slots
            .iter()
            .position(|slot| !active.iter().any(|name| *name == slot.channel))
        else {
            anyhow::bail!(TranscodeError::Resource(format!(
                "all {} decoder slots are in use",
                self.capacity
            )));
        };
        Ok(Some(self.slots.remove(position)))
    }

    pub fn insert(&mut self, slot: DecoderSlot<S>) -> anyhow::Result<()> {
        if self.slots.len() >= self.capacity {
            anyhow::bail!(TranscodeError::Resource(format!(
                "no free decoder slot for {} {}",
                slot.kind, slot.channel
            )));
        }
        self.slots.push(slot);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DecoderSlot<S>> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DecoderSlot<S>> {
        self.slots.iter_mut()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = DecoderSlot<S>> + '_ {
        self.slots.drain(..)
    }
}

#[cfg(test)]
#[path = "slot_test.rs"]
mod slot_test;
