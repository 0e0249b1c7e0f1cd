//! In-memory media capabilities used by the unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::Level;

use crate::error::TranscodeError;
use crate::media::{
    BufferFlags, BufferInfo, Codec, Compositor, ContainerWriter, Demuxer, Encoder, FormatStrategy,
    Layer, MediaFactory, MediaFormat, OutputStatus, SampleInfo, SeekMode, SoftwareCompositor,
    TrackKind, VideoFrame,
};
use crate::telemetry::{Telemetry, TelemetrySink};

const VIDEO_MIME: &str = "video/avc";
const AUDIO_MIME: &str = "audio/mp4a-latm";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ------------------------------------------------------------------------
// Sources
// ------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FakeSample {
    pub pts_us: i64,
    pub key: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FakeTrack {
    pub format: MediaFormat,
    pub samples: Vec<FakeSample>,
}

impl FakeTrack {
    /// 2x2 RGBA frames; every `keyframe_interval`th frame is a keyframe.
    pub fn video(fps: u32, frames: usize, keyframe_interval: usize) -> Self {
        let frame_us = 1_000_000 / fps as i64;
        let samples = (0..frames)
            .map(|i| FakeSample {
                pts_us: i as i64 * frame_us,
                key: i % keyframe_interval.max(1) == 0,
                data: vec![(i % 251) as u8; VideoFrame::expected_len(2, 2)],
            })
            .collect();
        Self {
            format: MediaFormat::video(VIDEO_MIME, 2, 2)
                .with_frame_rate(fps)
                .with_duration_us(frames as i64 * frame_us),
            samples,
        }
    }

    /// Interleaved s16 buffers of `frames_per_buffer` frames each.
    pub fn audio(sample_rate: u32, channels: u16, frames_per_buffer: usize, buffers: usize) -> Self {
        let buffer_us = frames_per_buffer as i64 * 1_000_000 / sample_rate as i64;
        let value: i16 = 1000;
        let mut pcm = Vec::with_capacity(frames_per_buffer * channels as usize * 2);
        for _ in 0..frames_per_buffer * channels as usize {
            pcm.extend_from_slice(&value.to_le_bytes());
        }
        let samples = (0..buffers)
            .map(|i| FakeSample {
                pts_us: i as i64 * buffer_us,
                key: true,
                data: pcm.clone(),
            })
            .collect();
        Self {
            format: MediaFormat::audio(AUDIO_MIME, sample_rate, channels)
                .with_duration_us(buffers as i64 * buffer_us),
            samples,
        }
    }
}

// ------------------------------------------------------------------------
// Recorder
// ------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    pub pts_us: i64,
    /// Source timestamp and alpha of each layer.
    pub layers: Vec<(i64, f32)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriterEvent {
    AddTrack(MediaFormat),
    Orientation(i32),
    Start,
    Sample {
        track: usize,
        pts_us: i64,
        size: usize,
        flags: BufferFlags,
    },
    Stop,
    Release,
}

#[derive(Debug, Default)]
pub struct Recorder {
    pub seeks: Vec<(String, i64, SeekMode)>,
    pub open_decoders: BTreeMap<TrackKind, usize>,
    pub max_open_decoders: BTreeMap<TrackKind, usize>,
    pub decoders_created: usize,
    pub compositions: Vec<Composition>,
    pub audio_inputs: Vec<BufferInfo>,
    /// Mixed samples handed to the audio encoder, in order.
    pub audio_pcm: Vec<i16>,
    pub eos_signals: usize,
    pub writers_opened: usize,
    pub writer_events: Vec<WriterEvent>,
    pub releases: Vec<String>,
}

pub type SharedRecorder = Arc<Mutex<Recorder>>;

impl Recorder {
    pub fn samples(&self, track: usize) -> Vec<(i64, usize, BufferFlags)> {
        self.writer_events
            .iter()
            .filter_map(|event| match event {
                WriterEvent::Sample {
                    track: t,
                    pts_us,
                    size,
                    flags,
                } if *t == track => Some((*pts_us, *size, *flags)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: &WriterEvent) -> usize {
        self.writer_events.iter().filter(|e| *e == event).count()
    }

    pub fn first_release(&self, prefix: &str) -> Option<usize> {
        self.releases.iter().position(|r| r.starts_with(prefix))
    }

    pub fn last_release(&self, prefix: &str) -> Option<usize> {
        self.releases.iter().rposition(|r| r.starts_with(prefix))
    }
}

// ------------------------------------------------------------------------
// Demuxer
// ------------------------------------------------------------------------

pub struct FakeDemuxer {
    source: String,
    tracks: Vec<FakeTrack>,
    selected: Option<usize>,
    cursor: usize,
    recorder: SharedRecorder,
}

impl FakeDemuxer {
    pub fn new(source: &str, tracks: Vec<FakeTrack>, recorder: SharedRecorder) -> Self {
        Self {
            source: source.to_string(),
            tracks,
            selected: None,
            cursor: 0,
            recorder,
        }
    }

    fn samples(&self) -> &[FakeSample] {
        match self.selected {
            Some(track) => &self.tracks[track].samples,
            None => &[],
        }
    }
}

impl Demuxer for FakeDemuxer {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Option<MediaFormat> {
        self.tracks.get(index).map(|track| track.format.clone())
    }

    fn select_track(&mut self, index: usize) -> anyhow::Result<()> {
        if index >= self.tracks.len() {
            anyhow::bail!(TranscodeError::Resource(format!("no track {}", index)));
        }
        self.selected = Some(index);
        self.cursor = 0;
        Ok(())
    }

    fn sample_track_index(&self) -> Option<usize> {
        if self.cursor < self.samples().len() {
            self.selected
        } else {
            None
        }
    }

    fn read_sample(&mut self, buffer: &mut Vec<u8>) -> anyhow::Result<Option<SampleInfo>> {
        let Some(sample) = self.samples().get(self.cursor) else {
            return Ok(None);
        };
        buffer.clear();
        buffer.extend_from_slice(&sample.data);
        Ok(Some(SampleInfo {
            size: sample.data.len(),
            presentation_time_us: sample.pts_us,
            key_frame: sample.key,
        }))
    }

    fn advance(&mut self) -> bool {
        if self.cursor < self.samples().len() {
            self.cursor += 1;
        }
        self.cursor < self.samples().len()
    }

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> anyhow::Result<()> {
        self.recorder
            .lock()
            .unwrap()
            .seeks
            .push((self.source.clone(), time_us, mode));
        let samples = self.samples();
        self.cursor = match mode {
            SeekMode::PreviousKeyframe => samples
                .iter()
                .rposition(|s| s.key && s.pts_us <= time_us)
                .unwrap_or(0),
            SeekMode::NextKeyframe => samples
                .iter()
                .position(|s| s.key && s.pts_us >= time_us)
                .unwrap_or(samples.len()),
        };
        Ok(())
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.recorder
            .lock()
            .unwrap()
            .releases
            .push(format!("demuxer:{}", self.source));
        Ok(())
    }
}

// ------------------------------------------------------------------------
// Codecs
// ------------------------------------------------------------------------

/// Buffer bookkeeping shared by the fake decoder and encoder.
#[derive(Default)]
struct Buffers {
    queue: VecDeque<(Bytes, BufferInfo)>,
    dequeued: HashMap<usize, (Bytes, BufferInfo)>,
    next_index: usize,
}

impl Buffers {
    fn in_flight(&self) -> usize {
        self.queue.len() + self.dequeued.len()
    }

    fn pop(&mut self) -> Option<OutputStatus> {
        let (data, info) = self.queue.pop_front()?;
        let index = self.next_index;
        self.next_index += 1;
        self.dequeued.insert(index, (data, info));
        Some(OutputStatus::Buffer { index, info })
    }

    fn get(&self, index: usize) -> anyhow::Result<Bytes> {
        self.dequeued
            .get(&index)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| anyhow::anyhow!("output buffer {} is not dequeued", index))
    }

    fn release(&mut self, index: usize) -> anyhow::Result<()> {
        self.dequeued
            .remove(&index)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("output buffer {} released twice", index))
    }
}

/// Decodes by passing sample payloads through unchanged.
pub struct FakeDecoder {
    kind: TrackKind,
    format: Option<MediaFormat>,
    started: bool,
    format_reported: bool,
    capacity: usize,
    buffers: Buffers,
    recorder: SharedRecorder,
}

impl FakeDecoder {
    pub fn new(kind: TrackKind, recorder: SharedRecorder) -> Self {
        Self {
            kind,
            format: None,
            started: false,
            format_reported: false,
            capacity: 4,
            buffers: Buffers::default(),
            recorder,
        }
    }
}

impl Codec for FakeDecoder {
    fn configure(&mut self, format: &MediaFormat) -> anyhow::Result<()> {
        let mut output = format.clone();
        output.mime = match self.kind {
            TrackKind::Video => "video/raw".to_string(),
            TrackKind::Audio => "audio/raw".to_string(),
        };
        self.format = Some(output);
        let mut recorder = self.recorder.lock().unwrap();
        let open = recorder.open_decoders.entry(self.kind).or_insert(0);
        *open += 1;
        let open = *open;
        let max = recorder.max_open_decoders.entry(self.kind).or_insert(0);
        *max = (*max).max(open);
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.started = false;
        Ok(())
    }

    fn release(&mut self) -> anyhow::Result<()> {
        let mut recorder = self.recorder.lock().unwrap();
        if self.format.take().is_some() {
            if let Some(open) = recorder.open_decoders.get_mut(&self.kind) {
                *open -= 1;
            }
        }
        recorder.releases.push(format!("decoder:{}", self.kind));
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> anyhow::Result<Option<usize>> {
        if !self.started || self.buffers.in_flight() >= self.capacity {
            return Ok(None);
        }
        Ok(Some(0))
    }

    fn queue_input_buffer(
        &mut self,
        _index: usize,
        data: &[u8],
        info: BufferInfo,
    ) -> anyhow::Result<()> {
        self.buffers
            .queue
            .push_back((Bytes::copy_from_slice(data), info));
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> anyhow::Result<OutputStatus> {
        if !self.started {
            return Ok(OutputStatus::TryAgainLater);
        }
        if !self.format_reported {
            self.format_reported = true;
            return Ok(OutputStatus::FormatChanged);
        }
        Ok(self.buffers.pop().unwrap_or(OutputStatus::TryAgainLater))
    }

    fn output_buffer(&mut self, index: usize) -> anyhow::Result<Bytes> {
        self.buffers.get(index)
    }

    fn output_format(&self) -> Option<MediaFormat> {
        self.format.clone()
    }

    fn release_output_buffer(&mut self, index: usize, _render: bool) -> anyhow::Result<()> {
        self.buffers.release(index)
    }
}

/// Reports its format, then a codec config buffer, then one output per input.
pub struct FakeEncoder {
    kind: TrackKind,
    format: MediaFormat,
    started: bool,
    format_reported: bool,
    config_sent: bool,
    last_pts_us: i64,
    buffers: Buffers,
    recorder: SharedRecorder,
}

impl FakeEncoder {
    pub fn new(format: &MediaFormat, recorder: SharedRecorder) -> Self {
        Self {
            kind: format.kind,
            format: format
                .clone()
                .with_codec_config(Bytes::from_static(&[0x01, 0x02])),
            started: false,
            format_reported: false,
            config_sent: false,
            last_pts_us: 0,
            buffers: Buffers::default(),
            recorder,
        }
    }
}

impl Codec for FakeEncoder {
    fn configure(&mut self, _format: &MediaFormat) -> anyhow::Result<()> {
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.started = false;
        Ok(())
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.recorder
            .lock()
            .unwrap()
            .releases
            .push(format!("encoder:{}", self.kind));
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> anyhow::Result<Option<usize>> {
        Ok(self.started.then_some(0))
    }

    fn queue_input_buffer(
        &mut self,
        _index: usize,
        data: &[u8],
        info: BufferInfo,
    ) -> anyhow::Result<()> {
        {
            let mut recorder = self.recorder.lock().unwrap();
            recorder.audio_inputs.push(info);
            recorder.audio_pcm.extend(
                data.chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]])),
            );
        }
        self.last_pts_us = info.presentation_time_us;
        let payload = if info.is_end_of_stream() {
            Bytes::new()
        } else {
            Bytes::copy_from_slice(data)
        };
        self.buffers.queue.push_back((payload, info));
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> anyhow::Result<OutputStatus> {
        if !self.started {
            return Ok(OutputStatus::TryAgainLater);
        }
        if !self.format_reported {
            self.format_reported = true;
            return Ok(OutputStatus::FormatChanged);
        }
        if !self.config_sent {
            self.config_sent = true;
            self.buffers.queue.push_front((
                Bytes::from_static(&[0x01, 0x02]),
                BufferInfo::new(2, 0, BufferFlags::CODEC_CONFIG),
            ));
        }
        Ok(self.buffers.pop().unwrap_or(OutputStatus::TryAgainLater))
    }

    fn output_buffer(&mut self, index: usize) -> anyhow::Result<Bytes> {
        self.buffers.get(index)
    }

    fn output_format(&self) -> Option<MediaFormat> {
        self.format_reported.then(|| self.format.clone())
    }

    fn release_output_buffer(&mut self, index: usize, _render: bool) -> anyhow::Result<()> {
        self.buffers.release(index)
    }
}

impl Encoder for FakeEncoder {
    fn queue_frame(&mut self, frame: VideoFrame) -> anyhow::Result<()> {
        self.last_pts_us = frame.pts_us;
        let info = BufferInfo::new(frame.data.len(), frame.pts_us, BufferFlags::KEY_FRAME);
        self.buffers.queue.push_back((frame.data, info));
        Ok(())
    }

    fn signal_end_of_input_stream(&mut self) -> anyhow::Result<()> {
        self.recorder.lock().unwrap().eos_signals += 1;
        self.buffers
            .queue
            .push_back((Bytes::new(), BufferInfo::end_of_stream(self.last_pts_us)));
        Ok(())
    }
}

// ------------------------------------------------------------------------
// Compositor and writer
// ------------------------------------------------------------------------

pub struct RecordingCompositor {
    inner: SoftwareCompositor,
    recorder: SharedRecorder,
}

impl Compositor for RecordingCompositor {
    fn compose(&mut self, layers: &[Layer<'_>], pts_us: i64) -> anyhow::Result<VideoFrame> {
        self.recorder.lock().unwrap().compositions.push(Composition {
            pts_us,
            layers: layers
                .iter()
                .map(|layer| (layer.frame.pts_us, layer.alpha))
                .collect(),
        });
        self.inner.compose(layers, pts_us)
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.recorder
            .lock()
            .unwrap()
            .releases
            .push("compositor".to_string());
        Ok(())
    }
}

pub struct FakeWriter {
    tracks: usize,
    recorder: SharedRecorder,
}

impl FakeWriter {
    pub fn new(recorder: SharedRecorder) -> Self {
        Self {
            tracks: 0,
            recorder,
        }
    }

    fn push(&self, event: WriterEvent) {
        self.recorder.lock().unwrap().writer_events.push(event);
    }
}

impl ContainerWriter for FakeWriter {
    fn add_track(&mut self, format: &MediaFormat) -> anyhow::Result<usize> {
        self.push(WriterEvent::AddTrack(format.clone()));
        self.tracks += 1;
        Ok(self.tracks - 1)
    }

    fn set_orientation_hint(&mut self, degrees: i32) -> anyhow::Result<()> {
        self.push(WriterEvent::Orientation(degrees));
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.push(WriterEvent::Start);
        Ok(())
    }

    fn write_sample_data(
        &mut self,
        track: usize,
        data: &[u8],
        info: &BufferInfo,
    ) -> anyhow::Result<()> {
        self.push(WriterEvent::Sample {
            track,
            pts_us: info.presentation_time_us,
            size: data.len(),
            flags: info.flags,
        });
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.push(WriterEvent::Stop);
        Ok(())
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.push(WriterEvent::Release);
        self.recorder
            .lock()
            .unwrap()
            .releases
            .push("writer".to_string());
        Ok(())
    }
}

// ------------------------------------------------------------------------
// Factory and strategy
// ------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeFactory {
    sources: HashMap<String, Vec<FakeTrack>>,
    pub recorder: SharedRecorder,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, name: &str, tracks: Vec<FakeTrack>) -> Self {
        self.sources.insert(name.to_string(), tracks);
        self
    }

    pub fn demuxer(&self, source: &str) -> FakeDemuxer {
        FakeDemuxer::new(
            source,
            self.sources.get(source).cloned().unwrap_or_default(),
            self.recorder.clone(),
        )
    }
}

impl MediaFactory for FakeFactory {
    fn open_demuxer(&self, source: &str) -> anyhow::Result<Box<dyn Demuxer>> {
        if !self.sources.contains_key(source) {
            anyhow::bail!(TranscodeError::Resource(format!("cannot open {}", source)));
        }
        Ok(Box::new(self.demuxer(source)))
    }

    fn create_decoder(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Codec>> {
        self.recorder.lock().unwrap().decoders_created += 1;
        Ok(Box::new(FakeDecoder::new(format.kind, self.recorder.clone())))
    }

    fn create_encoder(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Encoder>> {
        Ok(Box::new(FakeEncoder::new(format, self.recorder.clone())))
    }

    fn create_compositor(&self, format: &MediaFormat) -> anyhow::Result<Box<dyn Compositor>> {
        Ok(Box::new(RecordingCompositor {
            inner: SoftwareCompositor::new(format.width, format.height),
            recorder: self.recorder.clone(),
        }))
    }

    fn open_writer(&self) -> anyhow::Result<Box<dyn ContainerWriter>> {
        self.recorder.lock().unwrap().writers_opened += 1;
        Ok(Box::new(FakeWriter::new(self.recorder.clone())))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeStrategy {
    pub video: Option<MediaFormat>,
    pub audio: Option<MediaFormat>,
}

impl FakeStrategy {
    pub fn video_output() -> MediaFormat {
        MediaFormat::video(VIDEO_MIME, 2, 2)
            .with_frame_rate(25)
            .with_bit_rate(1_000_000)
    }

    pub fn audio_output() -> MediaFormat {
        MediaFormat::audio(AUDIO_MIME, 48_000, 2).with_bit_rate(128_000)
    }

    pub fn reencode() -> Self {
        Self {
            video: Some(Self::video_output()),
            audio: Some(Self::audio_output()),
        }
    }

    pub fn video_only() -> Self {
        Self {
            video: Some(Self::video_output()),
            audio: None,
        }
    }

    pub fn passthrough() -> Self {
        Self::default()
    }
}

impl FormatStrategy for FakeStrategy {
    fn video_output_format(&self, _input: &MediaFormat) -> Option<MediaFormat> {
        self.video.clone()
    }

    fn audio_output_format(&self, _input: &MediaFormat) -> Option<MediaFormat> {
        self.audio.clone()
    }
}

// ------------------------------------------------------------------------
// Telemetry
// ------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySink {
    pub records: Mutex<Vec<(Level, String, String)>>,
}

impl MemorySink {
    pub fn contains(&self, needle: &str) -> bool {
        self.records
            .lock()
            .unwrap()
            .iter()
            .any(|(_, _, message)| message.contains(needle))
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, level: Level, component: &str, message: fmt::Arguments<'_>) {
        self.records
            .lock()
            .unwrap()
            .push((level, component.to_string(), message.to_string()));
    }
}

pub fn memory_telemetry() -> (Arc<MemorySink>, Telemetry) {
    let sink = Arc::new(MemorySink::default());
    let telemetry = Telemetry::new(sink.clone());
    (sink, telemetry)
}
