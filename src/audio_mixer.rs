//! Software mixer for the audio pipeline.
//!
//! Decoded PCM from every audio channel of a segment is queued at its output
//! time; [`AudioMixer::mix`] sums the inputs sample by sample into packed
//! signed 16 bit chunks in the encoder's layout. Gaps between an input's
//! buffers are filled with silence, data behind the mix position is dropped.

use std::collections::{BTreeMap, VecDeque};

use crate::error::TranscodeError;
use crate::media::MediaFormat;

const BYTES_PER_SAMPLE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PcmLayout {
    sample_rate: u32,
    channels: usize,
}

#[derive(Debug)]
struct MixerInput {
    layout: Option<PcmLayout>,
    /// Output-layout samples, first one at `start_frame`.
    pending: VecDeque<i16>,
    start_frame: i64,
    ended: bool,
}

impl MixerInput {
    fn new() -> Self {
        Self {
            layout: None,
            pending: VecDeque::new(),
            start_frame: 0,
            ended: false,
        }
    }

    fn end_frame(&self, channels: usize) -> i64 {
        self.start_frame + (self.pending.len() / channels) as i64
    }
}

/// One chunk of mixed audio ready for the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct MixedChunk {
    pub pts_us: i64,
    pub end_us: i64,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct AudioMixer {
    sample_rate: u32,
    channels: usize,
    inputs: BTreeMap<String, MixerInput>,
    position: i64,
}

impl AudioMixer {
    /// Mixer producing PCM at the rate and channel count of `output`.
    pub fn new(output: &MediaFormat) -> anyhow::Result<Self> {
        if output.sample_rate == 0 || output.channel_count == 0 {
            anyhow::bail!(TranscodeError::Format(format!(
                "unusable mixer output format {}",
                output
            )));
        }
        Ok(Self {
            sample_rate: output.sample_rate,
            channels: output.channel_count as usize,
            inputs: BTreeMap::new(),
            position: 0,
        })
    }

    /// Makes `channels` the set of inputs. Inputs that stay keep their
    /// pending data but are no longer considered ended.
    pub fn configure_segment(&mut self, channels: &[String]) {
        self.inputs.retain(|name, _| channels.contains(name));
        for name in channels {
            let input = self
                .inputs
                .entry(name.clone())
                .or_insert_with(MixerInput::new);
            input.ended = false;
            if input.pending.is_empty() {
                input.start_frame = self.position;
            }
        }
    }

    /// Layout of the PCM the decoder of `channel` produces.
    pub fn set_input_format(&mut self, channel: &str, format: &MediaFormat) -> anyhow::Result<()> {
        if format.sample_rate != self.sample_rate {
            anyhow::bail!(TranscodeError::Format(format!(
                "channel {} decodes at {}Hz, output is {}Hz",
                channel, format.sample_rate, self.sample_rate
            )));
        }
        if format.channel_count == 0 {
            anyhow::bail!(TranscodeError::Format(format!(
                "channel {} decodes without audio channels",
                channel
            )));
        }
        let input = self
            .inputs
            .entry(channel.to_string())
            .or_insert_with(MixerInput::new);
        input.layout = Some(PcmLayout {
            sample_rate: format.sample_rate,
            channels: format.channel_count as usize,
        });
        Ok(())
    }

    /// Output time covered by `bytes` of `channel`'s PCM.
    pub fn duration_us(&self, channel: &str, bytes: usize) -> i64 {
        let layout = self.layout(channel);
        let frames = bytes / (BYTES_PER_SAMPLE * layout.channels);
        frames as i64 * 1_000_000 / layout.sample_rate as i64
    }

    /// Whole frames of `channel`'s PCM fitting in `time_us`, in bytes.
    pub fn bytes_for_us(&self, channel: &str, time_us: i64) -> usize {
        let layout = self.layout(channel);
        let frames = (time_us.max(0) as i128 * layout.sample_rate as i128 / 1_000_000) as usize;
        frames * BYTES_PER_SAMPLE * layout.channels
    }

    /// Queues decoded PCM of `channel` that starts at `output_time_us`.
    pub fn queue(
        &mut self,
        channel: &str,
        pcm: &[u8],
        output_time_us: i64,
        gain: f32,
    ) -> anyhow::Result<()> {
        let layout = self.layout(channel);
        let out_channels = self.channels;
        let position = self.position;
        let start_frame = self.frame_at(output_time_us);
        let Some(input) = self.inputs.get_mut(channel) else {
            anyhow::bail!(TranscodeError::Configuration(format!(
                "audio channel {} is not mixed in this segment",
                channel
            )));
        };

        let samples: Vec<i16> = pcm
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        let mut frames: Vec<i16> = Vec::with_capacity(samples.len() / layout.channels * out_channels);
        for frame in samples.chunks_exact(layout.channels) {
            for c in 0..out_channels {
                let sample = if layout.channels == 1 {
                    frame[0]
                } else if c < layout.channels {
                    frame[c]
                } else {
                    0
                };
                frames.push(apply_gain(sample, gain));
            }
        }

        if input.pending.is_empty() {
            input.start_frame = input.start_frame.max(position);
        }
        let end = input.end_frame(out_channels);
        let mut skip_frames = 0usize;
        if start_frame > end {
            let gap = (start_frame - end) as usize;
            input
                .pending
                .extend(std::iter::repeat(0i16).take(gap * out_channels));
        } else {
            skip_frames = (end - start_frame) as usize;
        }
        let skip = (skip_frames * out_channels).min(frames.len());
        input.pending.extend(frames.drain(skip..));
        Ok(())
    }

    /// No more data will be queued for `channel` in this segment.
    pub fn end_input(&mut self, channel: &str) {
        if let Some(input) = self.inputs.get_mut(channel) {
            input.ended = true;
        }
    }

    /// Frames that can be mixed now. Without `flush` only frames every live
    /// input has already delivered count.
    pub fn available_frames(&self, flush: bool) -> usize {
        let live = self.inputs.values().filter(|input| !input.ended);
        let limit = if flush || live.clone().count() == 0 {
            self.inputs
                .values()
                .map(|input| input.end_frame(self.channels))
                .max()
        } else {
            live.map(|input| input.end_frame(self.channels)).min()
        };
        limit
            .map(|end| (end - self.position).max(0) as usize)
            .unwrap_or(0)
    }

    /// Mixes up to `max_frames` frames starting at the current position.
    pub fn mix(&mut self, max_frames: usize, flush: bool) -> Option<MixedChunk> {
        let frames = self.available_frames(flush).min(max_frames);
        if frames == 0 {
            return None;
        }
        let channels = self.channels;
        let position = self.position;
        let mut mixed = vec![0i32; frames * channels];

        for input in self.inputs.values_mut() {
            if input.start_frame > position {
                let lead = ((input.start_frame - position) as usize).min(frames);
                if lead == frames {
                    continue;
                }
                for (i, sample) in input
                    .pending
                    .drain(..((frames - lead) * channels).min(input.pending.len()))
                    .enumerate()
                {
                    mixed[lead * channels + i] += sample as i32;
                }
                input.start_frame = position + frames as i64;
                continue;
            }
            let take = (frames * channels).min(input.pending.len());
            for (i, sample) in input.pending.drain(..take).enumerate() {
                mixed[i] += sample as i32;
            }
            input.start_frame = position + frames as i64;
        }

        self.position += frames as i64;
        let mut data = Vec::with_capacity(mixed.len() * BYTES_PER_SAMPLE);
        for sample in mixed {
            let clamped = sample.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            data.extend_from_slice(&clamped.to_le_bytes());
        }
        Some(MixedChunk {
            pts_us: self.time_at(position),
            end_us: self.time_at(self.position),
            data,
        })
    }

    fn layout(&self, channel: &str) -> PcmLayout {
        self.inputs
            .get(channel)
            .and_then(|input| input.layout)
            .unwrap_or(PcmLayout {
                sample_rate: self.sample_rate,
                channels: self.channels,
            })
    }

    fn frame_at(&self, time_us: i64) -> i64 {
        (time_us as i128 * self.sample_rate as i128 / 1_000_000) as i64
    }

    fn time_at(&self, frame: i64) -> i64 {
        (frame as i128 * 1_000_000 / self.sample_rate as i128) as i64
    }
}

fn apply_gain(sample: i16, gain: f32) -> i16 {
    if gain >= 1.0 {
        return sample;
    }
    (sample as f32 * gain.max(0.0)).round() as i16
}

#[cfg(test)]
#[path = "audio_mixer_test.rs"]
mod audio_mixer_test;
