//! Edit timeline: input channels and the ordered segments that select them.
//!
//! A [`TimeLine`] owns every [`InputChannel`] for the whole transcode. Each
//! [`Segment`] binds a subset of them through [`SegmentChannel`]s; starting a
//! segment moves the channels' input cursors so that the first sample of the
//! segment lands where the previous output ended.

use crate::config::EngineConfig;
use crate::error::TranscodeError;
use crate::media::TrackKind;

/// Segment length used when neither an explicit duration nor the length of
/// its first channel is known: the segment runs until its decoders end.
pub const UNBOUNDED_US: i64 = i64::MAX / 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Video,
    Audio,
    AudioVideo,
    Image,
}

impl ChannelKind {
    pub fn carries(self, track: TrackKind) -> bool {
        match track {
            TrackKind::Video => matches!(
                self,
                ChannelKind::Video | ChannelKind::AudioVideo | ChannelKind::Image
            ),
            TrackKind::Audio => matches!(self, ChannelKind::Audio | ChannelKind::AudioVideo),
        }
    }
}

/// Per-channel compositing / mixing hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    OpacityUpRamp,
    OpacityDownRamp,
    Mute,
    Suppress,
}

impl Filter {
    /// Layer opacity after `elapsed_us` of a segment lasting `duration_us`.
    pub fn opacity(self, elapsed_us: i64, duration_us: i64) -> f32 {
        match self {
            Filter::OpacityUpRamp => ramp(elapsed_us, duration_us),
            Filter::OpacityDownRamp => 1.0 - ramp(elapsed_us, duration_us),
            Filter::Mute | Filter::Suppress => 1.0,
        }
    }

    /// Mixing gain after `elapsed_us` of a segment lasting `duration_us`.
    pub fn gain(self, elapsed_us: i64, duration_us: i64) -> f32 {
        match self {
            Filter::OpacityUpRamp => ramp(elapsed_us, duration_us),
            Filter::OpacityDownRamp => 1.0 - ramp(elapsed_us, duration_us),
            Filter::Mute => 0.0,
            Filter::Suppress => 0.5,
        }
    }
}

fn ramp(elapsed_us: i64, duration_us: i64) -> f32 {
    if duration_us <= 0 {
        return 1.0;
    }
    (elapsed_us as f64 / duration_us as f64).clamp(0.0, 1.0) as f32
}

/// Snaps `value` down to a multiple of `frame`, banking the truncated part in
/// `shortage` and paying it back once it adds up to whole frames.
fn snap(value: i64, frame: i64, shortage: &mut i64) -> i64 {
    let base = value / frame * frame;
    *shortage += value - base;
    let addition = *shortage / frame * frame;
    *shortage -= addition;
    base + addition
}

/// Mapping between one track of a channel's input time and the output clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackCursor {
    /// First input timestamp contributing to the current segment.
    pub input_start_us: i64,
    /// Input time up to which this track has actually been consumed.
    pub actual_end_us: i64,
    anchor_input_us: i64,
    anchor_output_us: i64,
    time_scale: i64,
}

impl Default for TrackCursor {
    fn default() -> Self {
        Self {
            input_start_us: 0,
            actual_end_us: 0,
            anchor_input_us: 0,
            anchor_output_us: 0,
            time_scale: 1,
        }
    }
}

impl TrackCursor {
    /// Output clock minus input time at the segment anchor.
    pub fn input_offset_us(&self) -> i64 {
        self.anchor_output_us - self.anchor_input_us
    }

    pub fn output_time_us(&self, input_us: i64) -> i64 {
        self.anchor_output_us + (input_us - self.anchor_input_us) / self.time_scale
    }

    pub fn input_time_us(&self, output_us: i64) -> i64 {
        self.anchor_input_us + (output_us - self.anchor_output_us) * self.time_scale
    }

    pub fn time_scale(&self) -> i64 {
        self.time_scale
    }
}

#[derive(Debug, Clone)]
pub struct InputChannel {
    name: String,
    source: String,
    kind: ChannelKind,
    length_us: Option<i64>,
    frame_length_us: i64,
    end_time_us: i64,
    seek_shortage_us: i64,
    duration_shortage_us: i64,
    video: TrackCursor,
    audio: TrackCursor,
}

impl InputChannel {
    fn new(name: &str, source: &str, kind: ChannelKind, frame_length_us: i64) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            kind,
            length_us: None,
            frame_length_us,
            end_time_us: 0,
            seek_shortage_us: 0,
            duration_shortage_us: 0,
            video: TrackCursor::default(),
            audio: TrackCursor::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Source length, known once the input has been probed.
    pub fn length_us(&self) -> Option<i64> {
        self.length_us
    }

    pub fn set_length_us(&mut self, length_us: i64) {
        self.length_us = Some(length_us.max(0));
    }

    pub fn frame_length_us(&self) -> i64 {
        self.frame_length_us
    }

    pub fn set_frame_length_us(&mut self, frame_length_us: i64) {
        if frame_length_us > 0 {
            self.frame_length_us = frame_length_us;
        }
    }

    /// Input time at which the channel's current segment ends.
    pub fn end_time_us(&self) -> i64 {
        self.end_time_us
    }

    pub fn cursor(&self, track: TrackKind) -> &TrackCursor {
        match track {
            TrackKind::Video => &self.video,
            TrackKind::Audio => &self.audio,
        }
    }

    pub fn cursor_mut(&mut self, track: TrackKind) -> &mut TrackCursor {
        match track {
            TrackKind::Video => &mut self.video,
            TrackKind::Audio => &mut self.audio,
        }
    }
}

fn track_slot(track: TrackKind) -> usize {
    match track {
        TrackKind::Video => 0,
        TrackKind::Audio => 1,
    }
}

/// Binding of one input channel into one segment.
#[derive(Debug, Clone)]
pub struct SegmentChannel {
    filter: Option<Filter>,
    time_scale: i64,
    seek_target_us: Option<i64>,
    seek_fired: [bool; 2],
}

impl SegmentChannel {
    fn new(filter: Option<Filter>) -> Self {
        Self {
            filter,
            time_scale: 1,
            seek_target_us: None,
            seek_fired: [false; 2],
        }
    }

    pub fn filter(&self) -> Option<Filter> {
        self.filter
    }

    pub fn time_scale(&self) -> i64 {
        self.time_scale
    }

    /// Absolute input timestamp the demuxer has to jump to, if the segment seeks.
    pub fn seek_target_us(&self) -> Option<i64> {
        self.seek_target_us
    }

    /// Seek still to be applied on `track`'s demuxer.
    pub fn pending_seek(&self, track: TrackKind) -> Option<i64> {
        if self.seek_fired[track_slot(track)] {
            None
        } else {
            self.seek_target_us
        }
    }

    pub fn mark_seek_fired(&mut self, track: TrackKind) {
        self.seek_fired[track_slot(track)] = true;
    }
}

#[derive(Debug, Clone)]
pub struct Segment {
    channels: Vec<(String, SegmentChannel)>,
    seeks: Vec<(String, i64)>,
    duration_us: Option<i64>,
    output_start_us: Option<i64>,
    planned_duration_us: Option<i64>,
    last: bool,
}

impl Segment {
    fn new() -> Self {
        Self {
            channels: Vec::new(),
            seeks: Vec::new(),
            duration_us: None,
            output_start_us: None,
            planned_duration_us: None,
            last: true,
        }
    }

    /// Channel names in the order they were output.
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|(name, _)| name.as_str())
    }

    pub fn channel(&self, name: &str) -> Option<&SegmentChannel> {
        self.channels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, channel)| channel)
    }

    fn channel_mut(&mut self, name: &str) -> Option<&mut SegmentChannel> {
        self.channels
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, channel)| channel)
    }

    pub fn is_last(&self) -> bool {
        self.last
    }

    /// Output clock at which the segment started, once started.
    pub fn output_start_us(&self) -> Option<i64> {
        self.output_start_us
    }

    /// Duration resolved when the segment started.
    pub fn planned_duration_us(&self) -> Option<i64> {
        self.planned_duration_us
    }

    pub fn requested_seek_us(&self, name: &str) -> i64 {
        self.seeks
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, seek)| *seek)
            .unwrap_or(0)
    }

    /// Explicit duration, or the remaining length of the first channel.
    pub fn duration_us(&self, channels: &[InputChannel]) -> Option<i64> {
        if let Some(duration) = self.duration_us {
            return Some(duration);
        }
        let (first, _) = self.channels.first()?;
        let length = channels.iter().find(|c| c.name == *first)?.length_us?;
        Some((length - self.requested_seek_us(first)).max(0))
    }

    fn start(&mut self, output_clock_us: i64, channels: &mut [InputChannel]) -> anyhow::Result<()> {
        let duration = self.duration_us(channels).unwrap_or(UNBOUNDED_US);
        self.output_start_us = Some(output_clock_us);
        self.planned_duration_us = Some(duration);

        for (name, segment_channel) in self.channels.iter_mut() {
            let channel = channels
                .iter_mut()
                .find(|c| c.name == *name)
                .ok_or_else(|| {
                    TranscodeError::Configuration(format!("unknown channel {}", name))
                })?;
            let frame = channel.frame_length_us.max(1);

            let requested_seek = self
                .seeks
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, seek)| *seek)
                .unwrap_or(0);
            let seek = snap(requested_seek, frame, &mut channel.seek_shortage_us);
            let duration = if duration >= UNBOUNDED_US {
                UNBOUNDED_US
            } else {
                snap(duration, frame, &mut channel.duration_shortage_us)
            };

            let scale = segment_channel.time_scale;
            let input_start = channel.end_time_us + seek;
            for cursor in [&mut channel.video, &mut channel.audio] {
                cursor.input_start_us = input_start;
                cursor.anchor_input_us = seek + cursor.actual_end_us;
                cursor.anchor_output_us = output_clock_us;
                cursor.time_scale = scale;
            }

            channel.end_time_us = input_start.saturating_add(duration.saturating_mul(scale));
            channel.video.actual_end_us = channel.end_time_us;
            channel.audio.actual_end_us = channel.end_time_us;

            segment_channel.seek_target_us = (seek > 0).then_some(input_start);
            segment_channel.seek_fired = [false; 2];
        }
        Ok(())
    }
}

/// Authoring handle returned by [`TimeLine::create_segment`]. Errors are
/// collected and reported by [`SegmentBuilder::build`].
pub struct SegmentBuilder<'a> {
    timeline: &'a mut TimeLine,
    segment: Segment,
    error: Option<TranscodeError>,
}

impl<'a> SegmentBuilder<'a> {
    /// Explicit segment duration in milliseconds.
    pub fn duration(mut self, ms: i64) -> Self {
        if ms < 0 {
            self.fail(format!("negative segment duration {}ms", ms));
        } else {
            self.segment.duration_us = Some(ms * 1000);
        }
        self
    }

    /// Starts `channel` `ms` milliseconds after where it would otherwise resume.
    pub fn seek(mut self, channel: &str, ms: i64) -> Self {
        if !self.timeline.has_channel(channel) {
            self.fail(format!("seek on unknown channel {}", channel));
        } else if ms < 0 {
            self.fail(format!("negative seek {}ms on channel {}", ms, channel));
        } else {
            self.segment.seeks.retain(|(n, _)| n != channel);
            self.segment.seeks.push((channel.to_string(), ms * 1000));
        }
        self
    }

    pub fn output(self, channel: &str) -> Self {
        self.add_output(channel, None)
    }

    pub fn output_with(self, channel: &str, filter: Filter) -> Self {
        self.add_output(channel, Some(filter))
    }

    /// Applies `filter` to the most recently output channel.
    pub fn filter(mut self, filter: Filter) -> Self {
        match self.segment.channels.last_mut() {
            Some((_, channel)) => channel.filter = Some(filter),
            None => self.fail("filter applied before any output channel".to_string()),
        }
        self
    }

    /// Speeds the most recently output channel up by `factor`.
    pub fn time_scale(mut self, factor: i64) -> Self {
        if factor < 1 {
            self.fail(format!("time scale {} would slow the channel down", factor));
            return self;
        }
        match self.segment.channels.last_mut() {
            Some((_, channel)) => channel.time_scale = factor,
            None => self.fail("time scale applied before any output channel".to_string()),
        }
        self
    }

    pub fn build(self) -> anyhow::Result<&'a mut TimeLine> {
        let SegmentBuilder {
            timeline,
            segment,
            error,
        } = self;
        if let Some(error) = error {
            return Err(error.into());
        }
        let index = timeline.segments.len();
        if segment.channels.is_empty() {
            anyhow::bail!(TranscodeError::Configuration(format!(
                "segment {} has no output channels",
                index
            )));
        }
        if let Some((name, _)) = segment
            .seeks
            .iter()
            .find(|(name, _)| segment.channel(name).is_none())
        {
            anyhow::bail!(TranscodeError::Configuration(format!(
                "segment {} seeks channel {} without outputting it",
                index, name
            )));
        }

        for previous in timeline.segments.iter_mut() {
            previous.last = false;
        }
        timeline.segments.push(segment);
        Ok(timeline)
    }

    fn add_output(mut self, channel: &str, filter: Option<Filter>) -> Self {
        if !self.timeline.has_channel(channel) {
            self.fail(format!("output of unknown channel {}", channel));
        } else if self.segment.channel(channel).is_some() {
            self.fail(format!("channel {} output twice in one segment", channel));
        } else {
            self.segment
                .channels
                .push((channel.to_string(), SegmentChannel::new(filter)));
        }
        self
    }

    fn fail(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(TranscodeError::Configuration(message));
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeLine {
    channels: Vec<InputChannel>,
    segments: Vec<Segment>,
    frame_length_us: i64,
}

impl Default for TimeLine {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeLine {
    pub fn new() -> Self {
        Self::with_frame_length_us(EngineConfig::global().default_frame_length_us())
    }

    /// Timeline whose channels snap to `frame_length_us` until their video
    /// track reports a frame rate.
    pub fn with_frame_length_us(frame_length_us: i64) -> Self {
        Self {
            channels: Vec::new(),
            segments: Vec::new(),
            frame_length_us: frame_length_us.max(1),
        }
    }

    pub fn add_channel(
        &mut self,
        name: &str,
        source: &str,
        kind: ChannelKind,
    ) -> anyhow::Result<&mut Self> {
        if self.has_channel(name) {
            anyhow::bail!(TranscodeError::Configuration(format!(
                "channel {} already registered",
                name
            )));
        }
        self.channels
            .push(InputChannel::new(name, source, kind, self.frame_length_us));
        Ok(self)
    }

    pub fn create_segment(&mut self) -> SegmentBuilder<'_> {
        SegmentBuilder {
            timeline: self,
            segment: Segment::new(),
            error: None,
        }
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.iter().any(|c| c.name == name)
    }

    pub fn channels(&self) -> &[InputChannel] {
        &self.channels
    }

    pub fn channel(&self, name: &str) -> Option<&InputChannel> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut InputChannel> {
        self.channels.iter_mut().find(|c| c.name == name)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn segment_channel_mut(&mut self, index: usize, name: &str) -> Option<&mut SegmentChannel> {
        self.segments.get_mut(index)?.channel_mut(name)
    }

    /// Names of the channels of segment `index` that carry `track`, in output order.
    pub fn track_channels(&self, index: usize, track: TrackKind) -> Vec<String> {
        let Some(segment) = self.segments.get(index) else {
            return Vec::new();
        };
        segment
            .channel_names()
            .filter(|name| {
                self.channel(name)
                    .map(|c| c.kind.carries(track))
                    .unwrap_or(false)
            })
            .map(str::to_string)
            .collect()
    }

    /// Total output duration, `None` if any segment cannot be resolved.
    pub fn duration_us(&self) -> Option<i64> {
        self.segments.iter().try_fold(0i64, |total, segment| {
            total.checked_add(segment.duration_us(&self.channels)?)
        })
    }

    /// Activates segment `index` with its first sample at `output_clock_us`.
    pub fn start_segment(&mut self, index: usize, output_clock_us: i64) -> anyhow::Result<()> {
        let TimeLine {
            channels, segments, ..
        } = self;
        let segment = segments.get_mut(index).ok_or_else(|| {
            TranscodeError::Configuration(format!("segment {} does not exist", index))
        })?;
        segment.start(output_clock_us, channels)
    }
}

#[cfg(test)]
#[path = "timeline_test.rs"]
mod timeline_test;
