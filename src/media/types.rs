use std::fmt::{Display, Formatter};
use std::ops::BitOr;

use bytes::Bytes;

/// Elementary stream kind handled by one track pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackKind {
    Video,
    Audio,
}

impl Display for TrackKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// Description of an elementary stream, either as found in an input or as
/// requested from / reported by an encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFormat {
    // "video/avc", "audio/mp4a-latm", ...
    pub mime: String,
    pub kind: TrackKind,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<u32>,
    pub sample_rate: u32,
    pub channel_count: u16,
    // bps
    pub bit_rate: Option<u64>,
    pub duration_us: Option<i64>,
    pub rotation_degrees: i32,
    /// Codec specific data (SPS/PPS, AudioSpecificConfig...).
    pub codec_config: Option<Bytes>,
}

impl MediaFormat {
    pub fn video(mime: &str, width: u32, height: u32) -> Self {
        Self {
            mime: mime.to_string(),
            kind: TrackKind::Video,
            width,
            height,
            frame_rate: None,
            sample_rate: 0,
            channel_count: 0,
            bit_rate: None,
            duration_us: None,
            rotation_degrees: 0,
            codec_config: None,
        }
    }

    pub fn audio(mime: &str, sample_rate: u32, channel_count: u16) -> Self {
        Self {
            mime: mime.to_string(),
            kind: TrackKind::Audio,
            width: 0,
            height: 0,
            frame_rate: None,
            sample_rate,
            channel_count,
            bit_rate: None,
            duration_us: None,
            rotation_degrees: 0,
            codec_config: None,
        }
    }

    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    pub fn with_bit_rate(mut self, bit_rate: u64) -> Self {
        self.bit_rate = Some(bit_rate);
        self
    }

    pub fn with_duration_us(mut self, duration_us: i64) -> Self {
        self.duration_us = Some(duration_us);
        self
    }

    pub fn with_rotation(mut self, degrees: i32) -> Self {
        self.rotation_degrees = degrees;
        self
    }

    pub fn with_codec_config(mut self, config: Bytes) -> Self {
        self.codec_config = Some(config);
        self
    }

    /// Frame duration derived from the declared frame rate.
    pub fn frame_length_us(&self) -> Option<i64> {
        match self.frame_rate {
            Some(fps) if fps > 0 => Some(1_000_000 / fps as i64),
            _ => None,
        }
    }
}

impl Display for MediaFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            TrackKind::Video => write!(
                f,
                "{} {}x{} fps: {:?}",
                self.mime, self.width, self.height, self.frame_rate
            ),
            TrackKind::Audio => write!(
                f,
                "{} {}Hz x{}",
                self.mime, self.sample_rate, self.channel_count
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    pub const KEY_FRAME: BufferFlags = BufferFlags(1);
    pub const CODEC_CONFIG: BufferFlags = BufferFlags(1 << 1);
    pub const END_OF_STREAM: BufferFlags = BufferFlags(1 << 2);

    pub fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_key_frame(self) -> bool {
        self.contains(Self::KEY_FRAME)
    }

    pub fn is_codec_config(self) -> bool {
        self.contains(Self::CODEC_CONFIG)
    }

    pub fn is_end_of_stream(self) -> bool {
        self.contains(Self::END_OF_STREAM)
    }
}

impl BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

/// Metadata travelling with a codec buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

impl BufferInfo {
    pub fn new(size: usize, presentation_time_us: i64, flags: BufferFlags) -> Self {
        Self {
            size,
            presentation_time_us,
            flags,
        }
    }

    /// Zero sized buffer carrying only the end-of-stream flag.
    pub fn end_of_stream(presentation_time_us: i64) -> Self {
        Self::new(0, presentation_time_us, BufferFlags::END_OF_STREAM)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.is_end_of_stream()
    }
}

/// Result of polling a codec for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStatus {
    TryAgainLater,
    FormatChanged,
    BuffersChanged,
    Buffer { index: usize, info: BufferInfo },
}

/// Coded sample read by a demuxer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub size: usize,
    pub presentation_time_us: i64,
    pub key_frame: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Closest keyframe at or before the target.
    PreviousKeyframe,
    /// Closest keyframe at or after the target.
    NextKeyframe,
}

/// Decoded or composed picture, packed RGBA.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub pts_us: i64,
}

impl VideoFrame {
    pub const BYTES_PER_PIXEL: usize = 4;

    pub fn new(data: Bytes, width: u32, height: u32, pts_us: i64) -> Self {
        Self {
            data,
            width,
            height,
            pts_us,
        }
    }

    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * Self::BYTES_PER_PIXEL
    }
}

impl Display for VideoFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VideoFrame data_len: {}, width: {}, height: {}, pts: {}",
            self.data.len(),
            self.width,
            self.height,
            self.pts_us
        )
    }
}
