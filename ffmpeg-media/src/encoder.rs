use std::time::Duration;

use bytes::Bytes;
use ffmpeg_next::format::{Pixel, Sample, sample};
use ffmpeg_next::{ChannelLayout, Dictionary, Packet, Rational, codec, ffi, frame};
use timeline_transcoder::TranscodeError;
use timeline_transcoder::media::{
    BufferFlags, BufferInfo, Codec, Encoder, MediaFormat, OutputStatus, TrackKind, VideoFrame,
};

use crate::buffers::OutputQueue;
use crate::hw::{find_hw_encoder, pixel_format_for_encoder, software_encoder_for};
use crate::scaler::{Resampler, Scaler, rgba_frame};
use crate::stream::{MICROS, codec_id_for, to_micros};

const MAX_PENDING_OUTPUT: usize = 16;
const DEFAULT_GOP: u32 = 30;

enum EncoderType {
    Video {
        encoder: codec::encoder::Video,
        scaler: Option<Scaler>,
    },
    Audio {
        encoder: codec::encoder::Audio,
        resampler: Option<Resampler>,
        // interleaved s16 waiting for a full encoder frame
        fifo: Vec<u8>,
        frame_size: usize,
        samples_sent: i64,
        base_us: Option<i64>,
    },
}

impl EncoderType {
    fn time_base(&self) -> Rational {
        unsafe {
            match self {
                EncoderType::Video { encoder, .. } => (*encoder.0.as_ptr()).time_base.into(),
                EncoderType::Audio { encoder, .. } => (*encoder.0.as_ptr()).time_base.into(),
            }
        }
    }

    fn extradata(&self) -> Option<Bytes> {
        let raw = unsafe {
            match self {
                EncoderType::Video { encoder, .. } => &*encoder.0.as_ptr(),
                EncoderType::Audio { encoder, .. } => &*encoder.0.as_ptr(),
            }
        };
        if raw.extradata.is_null() || raw.extradata_size <= 0 {
            return None;
        }
        let data = unsafe { std::slice::from_raw_parts(raw.extradata, raw.extradata_size as usize) };
        Some(Bytes::copy_from_slice(data))
    }

    fn send_eof(&mut self) -> anyhow::Result<()> {
        match self {
            EncoderType::Video { encoder, .. } => encoder.send_eof()?,
            EncoderType::Audio { encoder, .. } => encoder.send_eof()?,
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> anyhow::Result<Option<Packet>> {
        let mut packet = Packet::empty();
        let result = match self {
            EncoderType::Video { encoder, .. } => encoder.receive_packet(&mut packet),
            EncoderType::Audio { encoder, .. } => encoder.receive_packet(&mut packet),
        };
        match result {
            Ok(()) => Ok(Some(packet)),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn open_video(
    codec: ffmpeg_next::Codec,
    format: &MediaFormat,
) -> anyhow::Result<codec::encoder::Video> {
    let mut context = codec::Context::new_with_codec(codec);
    context.set_flags(codec::Flags::GLOBAL_HEADER);
    let mut encoder = context.encoder().video()?;
    encoder.set_width(format.width);
    encoder.set_height(format.height);
    encoder.set_format(pixel_format_for_encoder(codec.name()));
    let fps = format.frame_rate.unwrap_or(DEFAULT_GOP).max(1);
    encoder.set_frame_rate(Some(Rational::new(fps as i32, 1)));
    encoder.set_time_base(MICROS);
    encoder.set_gop(fps);
    // pts must be monotonic in decode order
    encoder.set_max_b_frames(0);
    if let Some(bit_rate) = format.bit_rate {
        encoder.set_bit_rate(bit_rate as usize);
    }

    let mut opts = Dictionary::new();
    opts.set("preset", "ultrafast");
    opts.set("tune", "zerolatency");
    Ok(encoder.open_with(opts)?)
}

fn open_audio(
    codec: ffmpeg_next::Codec,
    format: &MediaFormat,
) -> anyhow::Result<codec::encoder::Audio> {
    let sample_format = codec
        .audio()?
        .formats()
        .and_then(|mut formats| formats.next())
        .unwrap_or(Sample::F32(sample::Type::Planar));

    let mut context = codec::Context::new_with_codec(codec);
    context.set_flags(codec::Flags::GLOBAL_HEADER);
    unsafe {
        ffi::av_channel_layout_default(
            &mut (*context.as_mut_ptr()).ch_layout,
            format.channel_count.max(1) as i32,
        );
    }
    let mut encoder = context.encoder().audio()?;
    encoder.set_rate(format.sample_rate as i32);
    encoder.set_format(sample_format);
    encoder.set_time_base(Rational::new(1, format.sample_rate as i32));
    encoder.set_bit_rate(format.bit_rate.unwrap_or(128_000) as usize);
    Ok(encoder.open_with(Dictionary::new())?)
}

/// Encoder for the composed video track or the mixed audio track.
///
/// Video takes packed RGBA frames through `queue_frame`; audio takes
/// interleaved s16 PCM through the buffer input.
pub struct FfmpegEncoder {
    kind: TrackKind,
    inner: Option<EncoderType>,
    requested: Option<MediaFormat>,
    output_format: Option<MediaFormat>,
    announce: bool,
    started: bool,
    input_pending: bool,
    next_input: usize,
    output: OutputQueue,
    eos_sent: bool,
    last_pts_us: i64,
}

unsafe impl Send for FfmpegEncoder {}

impl FfmpegEncoder {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            inner: None,
            requested: None,
            output_format: None,
            announce: false,
            started: false,
            input_pending: false,
            next_input: 0,
            output: OutputQueue::default(),
            eos_sent: false,
            last_pts_us: 0,
        }
    }

    fn inner(&mut self) -> anyhow::Result<&mut EncoderType> {
        let kind = self.kind;
        self.inner.as_mut().ok_or_else(|| {
            TranscodeError::Resource(format!("{} encoder is not configured", kind)).into()
        })
    }

    fn open(&self, format: &MediaFormat) -> anyhow::Result<EncoderType> {
        let software = software_encoder_for(&format.mime);
        let fallback = || -> anyhow::Result<ffmpeg_next::Codec> {
            software
                .and_then(ffmpeg_next::encoder::find_by_name)
                .or_else(|| codec_id_for(&format.mime).and_then(ffmpeg_next::encoder::find))
                .ok_or_else(|| {
                    TranscodeError::Format(format!("no encoder for {}", format.mime)).into()
                })
        };

        match format.kind {
            TrackKind::Video => {
                let hw = software.and_then(find_hw_encoder);
                let encoder = match hw {
                    Some(hw_codec) => match open_video(hw_codec, format) {
                        Ok(encoder) => {
                            log::info!("encoder opened successfully: {}", hw_codec.name());
                            encoder
                        }
                        Err(e) => {
                            let codec = fallback()?;
                            log::warn!(
                                "hardware encoder {} failed: {}, falling back to {}",
                                hw_codec.name(),
                                e,
                                codec.name()
                            );
                            open_video(codec, format)?
                        }
                    },
                    None => {
                        let codec = fallback()?;
                        log::info!("no hardware encoder found, using {}", codec.name());
                        open_video(codec, format)?
                    }
                };
                Ok(EncoderType::Video {
                    encoder,
                    scaler: None,
                })
            }
            TrackKind::Audio => {
                let encoder = open_audio(fallback()?, format)?;
                let frame_size = match encoder.frame_size() {
                    0 => 1024,
                    size => size as usize,
                };
                Ok(EncoderType::Audio {
                    encoder,
                    resampler: None,
                    fifo: Vec::new(),
                    frame_size,
                    samples_sent: 0,
                    base_us: None,
                })
            }
        }
    }

    /// Moves every finished packet into the output queue.
    fn receive_packets(&mut self) -> anyhow::Result<()> {
        let inner = self.inner()?;
        let time_base = inner.time_base();
        let mut packets = Vec::new();
        while let Some(packet) = inner.receive_packet()? {
            packets.push(packet);
        }
        for packet in packets {
            let pts_us = packet
                .pts()
                .or(packet.dts())
                .map(|ts| to_micros(ts, time_base))
                .unwrap_or(self.last_pts_us);
            self.last_pts_us = pts_us;
            let data = Bytes::copy_from_slice(packet.data().unwrap_or_default());
            let flags = if packet.is_key() {
                BufferFlags::KEY_FRAME
            } else {
                BufferFlags::NONE
            };
            self.output
                .push(data.clone(), BufferInfo::new(data.len(), pts_us, flags));
        }
        Ok(())
    }

    fn send_video(&mut self, frame: VideoFrame) -> anyhow::Result<()> {
        let Some(EncoderType::Video { encoder, scaler }) = self.inner.as_mut() else {
            anyhow::bail!(TranscodeError::Resource(format!(
                "{} encoder has no input surface",
                self.kind
            )));
        };
        let source = rgba_frame(&frame.data, frame.width, frame.height);
        let scaler = Scaler::reuse(
            scaler,
            (Pixel::RGBA, frame.width, frame.height),
            (encoder.format(), encoder.width(), encoder.height()),
        )?;
        let mut converted = frame::Video::empty();
        scaler.run(&source, &mut converted)?;
        converted.set_pts(Some(frame.pts_us));
        encoder.send_frame(&converted)?;
        self.receive_packets()
    }

    fn send_pcm(&mut self, data: &[u8], pts_us: i64, flush: bool) -> anyhow::Result<()> {
        let format = self
            .requested
            .clone()
            .ok_or_else(|| TranscodeError::Resource("audio encoder is not configured".into()))?;
        let channels = format.channel_count.max(1);
        let rate = format.sample_rate;
        let Some(EncoderType::Audio {
            encoder,
            resampler,
            fifo,
            frame_size,
            samples_sent,
            base_us,
        }) = self.inner.as_mut()
        else {
            anyhow::bail!(TranscodeError::Resource(format!(
                "{} encoder takes no PCM",
                self.kind
            )));
        };
        base_us.get_or_insert(pts_us);
        fifo.extend_from_slice(data);

        let frame_bytes = *frame_size * channels as usize * 2;
        while fifo.len() >= frame_bytes || (flush && !fifo.is_empty()) {
            let take = fifo.len().min(frame_bytes);
            let samples = take / (channels as usize * 2);
            if samples == 0 {
                fifo.clear();
                break;
            }
            let chunk: Vec<u8> = fifo.drain(..samples * channels as usize * 2).collect();

            let packed = Sample::I16(sample::Type::Packed);
            let mut pcm = frame::Audio::new(packed, samples, ChannelLayout::default(channels as i32));
            pcm.set_rate(rate);
            pcm.data_mut(0)[..chunk.len()].copy_from_slice(&chunk);

            let resampler = Resampler::reuse(
                resampler,
                (packed, channels, rate),
                (encoder.format(), channels, rate),
            )?;
            let mut converted = resampler.run(&pcm)?;
            let start = base_us.unwrap_or(0) * rate as i64 / 1_000_000;
            converted.set_pts(Some(start + *samples_sent));
            *samples_sent += samples as i64;
            encoder.send_frame(&converted)?;
        }
        self.receive_packets()
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if self.eos_sent {
            return Ok(());
        }
        self.eos_sent = true;
        if matches!(self.inner, Some(EncoderType::Audio { .. })) {
            self.send_pcm(&[], self.last_pts_us, true)?;
        }
        self.inner()?.send_eof()?;
        self.receive_packets()?;
        self.output.push_end_of_stream(self.last_pts_us);
        log::debug!("{} encoder flushed", self.kind);
        Ok(())
    }
}

impl Codec for FfmpegEncoder {
    fn configure(&mut self, format: &MediaFormat) -> anyhow::Result<()> {
        let inner = self.open(format)?;
        let mut actual = format.clone();
        actual.codec_config = inner.extradata();
        self.inner = Some(inner);
        self.requested = Some(format.clone());
        self.output_format = Some(actual);
        self.announce = true;
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.inner()?;
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.started = false;
        Ok(())
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.started = false;
        self.output.clear();
        self.inner = None;
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> anyhow::Result<Option<usize>> {
        let accepts_buffers = matches!(self.inner, Some(EncoderType::Audio { .. }));
        if !self.started
            || !accepts_buffers
            || self.input_pending
            || self.eos_sent
            || self.output.in_flight() >= MAX_PENDING_OUTPUT
        {
            return Ok(None);
        }
        self.input_pending = true;
        Ok(Some(self.next_input))
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        data: &[u8],
        info: BufferInfo,
    ) -> anyhow::Result<()> {
        if !self.input_pending || index != self.next_input {
            anyhow::bail!(TranscodeError::Resource(format!(
                "{} encoder input buffer {} was not dequeued",
                self.kind, index
            )));
        }
        self.input_pending = false;
        self.next_input = self.next_input.wrapping_add(1);
        let size = info.size.min(data.len());
        if size > 0 {
            self.send_pcm(&data[..size], info.presentation_time_us, false)?;
        }
        if info.is_end_of_stream() {
            self.finish()?;
        }
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> anyhow::Result<OutputStatus> {
        if self.announce {
            self.announce = false;
            return Ok(OutputStatus::FormatChanged);
        }
        Ok(self.output.dequeue())
    }

    fn output_buffer(&mut self, index: usize) -> anyhow::Result<Bytes> {
        self.output.get(index)
    }

    fn output_format(&self) -> Option<MediaFormat> {
        self.output_format.clone()
    }

    fn release_output_buffer(&mut self, index: usize, _render: bool) -> anyhow::Result<()> {
        self.output.release(index)
    }
}

impl Encoder for FfmpegEncoder {
    fn queue_frame(&mut self, frame: VideoFrame) -> anyhow::Result<()> {
        if self.eos_sent {
            anyhow::bail!(TranscodeError::Resource(format!(
                "{} encoder already reached end of input",
                self.kind
            )));
        }
        self.send_video(frame)
    }

    fn signal_end_of_input_stream(&mut self) -> anyhow::Result<()> {
        self.finish()
    }
}
