use std::time::Duration;

use bytes::Bytes;
use ffmpeg_next::format::{Pixel, Sample, sample};
use ffmpeg_next::{Packet, codec, ffi, frame};
use timeline_transcoder::TranscodeError;
use timeline_transcoder::media::{
    BufferFlags, BufferInfo, Codec, MediaFormat, OutputStatus, TrackKind, VideoFrame,
};

use crate::buffers::OutputQueue;
use crate::scaler::{Resampler, Scaler, channel_count, pack_rgba, pack_s16};
use crate::stream::{MICROS, codec_id_for, set_extradata};

/// Decoded frames kept before the decoder stops accepting input.
const MAX_PENDING_OUTPUT: usize = 8;

enum DecoderType {
    Video(codec::decoder::Video),
    Audio(codec::decoder::Audio),
}

impl DecoderType {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), ffmpeg_next::Error> {
        match self {
            DecoderType::Video(decoder) => decoder.send_packet(packet),
            DecoderType::Audio(decoder) => decoder.send_packet(packet),
        }
    }

    fn send_eof(&mut self) -> Result<(), ffmpeg_next::Error> {
        match self {
            DecoderType::Video(decoder) => decoder.send_eof(),
            DecoderType::Audio(decoder) => decoder.send_eof(),
        }
    }
}

enum Decoded {
    Video(frame::Video),
    Audio(frame::Audio),
}

fn again_or_eof<T>(result: Result<T, ffmpeg_next::Error>) -> anyhow::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ffmpeg_next::Error::Eof) => Ok(None),
        Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

/// Software decoder producing packed RGBA pictures or interleaved s16 PCM.
///
/// Every picture is scaled to the size of the first decoded frame so the
/// announced output format stays valid for the whole stream. PCM is
/// resampled to `pcm_sample_rate` when one is set.
pub struct FfmpegDecoder {
    kind: TrackKind,
    pcm_sample_rate: Option<u32>,
    inner: Option<DecoderType>,
    started: bool,
    input_pending: bool,
    next_input: usize,
    output: OutputQueue,
    output_format: Option<MediaFormat>,
    announce: bool,
    scaler: Option<Scaler>,
    resampler: Option<Resampler>,
    last_pts_us: i64,
    // end of the last PCM buffer
    last_end_us: i64,
}

unsafe impl Send for FfmpegDecoder {}

impl FfmpegDecoder {
    pub fn new(kind: TrackKind, pcm_sample_rate: Option<u32>) -> Self {
        Self {
            kind,
            pcm_sample_rate,
            inner: None,
            started: false,
            input_pending: false,
            next_input: 0,
            output: OutputQueue::default(),
            output_format: None,
            announce: false,
            scaler: None,
            resampler: None,
            last_pts_us: 0,
            last_end_us: 0,
        }
    }

    fn inner(&mut self) -> anyhow::Result<&mut DecoderType> {
        self.inner.as_mut().ok_or_else(|| {
            TranscodeError::Resource(format!("{} decoder is not configured", self.kind)).into()
        })
    }

    fn announce_format(&mut self, format: MediaFormat) {
        log::debug!("{} decoder output {}", self.kind, format);
        self.output_format = Some(format);
        self.announce = true;
    }

    fn receive_frame(&mut self) -> anyhow::Result<Option<Decoded>> {
        match self.inner()? {
            DecoderType::Video(decoder) => {
                let mut decoded = frame::Video::empty();
                Ok(again_or_eof(decoder.receive_frame(&mut decoded))?
                    .map(|()| Decoded::Video(decoded)))
            }
            DecoderType::Audio(decoder) => {
                let mut decoded = frame::Audio::empty();
                Ok(again_or_eof(decoder.receive_frame(&mut decoded))?
                    .map(|()| Decoded::Audio(decoded)))
            }
        }
    }

    /// Moves every frame the decoder has ready into the output queue.
    fn receive_frames(&mut self) -> anyhow::Result<()> {
        loop {
            match self.receive_frame()? {
                Some(Decoded::Video(decoded)) => self.push_video(&decoded)?,
                Some(Decoded::Audio(decoded)) => self.push_audio(&decoded)?,
                None => return Ok(()),
            }
        }
    }

    fn frame_pts(&mut self, pts: Option<i64>) -> i64 {
        let pts_us = pts.unwrap_or(self.last_pts_us);
        self.last_pts_us = pts_us;
        pts_us
    }

    fn push_video(&mut self, decoded: &frame::Video) -> anyhow::Result<()> {
        let (width, height) = match &self.output_format {
            Some(format) => (format.width, format.height),
            None => {
                let (width, height) = (decoded.width(), decoded.height());
                self.announce_format(MediaFormat::video("video/raw", width, height));
                (width, height)
            }
        };
        let pts_us = self.frame_pts(decoded.timestamp().or(decoded.pts()));

        let data = if decoded.format() == Pixel::RGBA
            && decoded.width() == width
            && decoded.height() == height
        {
            pack_rgba(decoded)
        } else {
            let scaler = Scaler::reuse(
                &mut self.scaler,
                (decoded.format(), decoded.width(), decoded.height()),
                (Pixel::RGBA, width, height),
            )?;
            let mut rgba = frame::Video::empty();
            scaler.run(decoded, &mut rgba)?;
            pack_rgba(&rgba)
        };
        debug_assert_eq!(data.len(), VideoFrame::expected_len(width, height));
        let info = BufferInfo::new(data.len(), pts_us, BufferFlags::NONE);
        self.output.push(data, info);
        Ok(())
    }

    fn push_audio(&mut self, decoded: &frame::Audio) -> anyhow::Result<()> {
        let channels = channel_count(decoded).max(1);
        let (rate, out_channels) = match &self.output_format {
            Some(format) => (format.sample_rate, format.channel_count),
            None => {
                let rate = self.pcm_sample_rate.unwrap_or(decoded.rate());
                self.announce_format(MediaFormat::audio("audio/raw", rate, channels));
                (rate, channels)
            }
        };
        let pts_us = self.frame_pts(decoded.timestamp().or(decoded.pts()));

        let target = (Sample::I16(sample::Type::Packed), out_channels, rate);
        let resampler = Resampler::reuse(
            &mut self.resampler,
            (decoded.format(), channels, decoded.rate()),
            target,
        )?;
        let converted = resampler.run(decoded)?;
        if converted.samples() == 0 {
            return Ok(());
        }
        let data = pack_s16(&converted, out_channels);
        let info = BufferInfo::new(data.len(), pts_us, BufferFlags::NONE);
        self.output.push(data, info);
        self.last_end_us = pts_us + converted.samples() as i64 * 1_000_000 / rate.max(1) as i64;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.inner()?.send_eof()?;
        self.receive_frames()?;
        if let Some(resampler) = self.resampler.as_mut() {
            if let Some(tail) = resampler.flush()? {
                let (_, channels, _) = resampler.output();
                let data = pack_s16(&tail, channels);
                let info = BufferInfo::new(data.len(), self.last_end_us, BufferFlags::NONE);
                self.output.push(data, info);
            }
        }
        self.output
            .push_end_of_stream(self.last_pts_us.max(self.last_end_us));
        Ok(())
    }
}

impl Codec for FfmpegDecoder {
    fn configure(&mut self, format: &MediaFormat) -> anyhow::Result<()> {
        let id = codec_id_for(&format.mime).ok_or_else(|| {
            TranscodeError::Format(format!("no decoder for {}", format.mime))
        })?;
        let found = ffmpeg_next::decoder::find(id)
            .ok_or_else(|| TranscodeError::Format(format!("no decoder for {:?}", id)))?;
        let mut context = codec::Context::new_with_codec(found);
        unsafe {
            let raw = context.as_mut_ptr();
            let micros: ffi::AVRational = MICROS.into();
            (*raw).time_base = micros;
            (*raw).pkt_timebase = micros;
            match format.kind {
                TrackKind::Video => {
                    (*raw).width = format.width as i32;
                    (*raw).height = format.height as i32;
                }
                TrackKind::Audio => {
                    (*raw).sample_rate = format.sample_rate as i32;
                    ffi::av_channel_layout_default(
                        &mut (*raw).ch_layout,
                        format.channel_count.max(1) as i32,
                    );
                }
            }
            if let Some(config) = &format.codec_config {
                set_extradata(&mut (*raw).extradata, &mut (*raw).extradata_size, config);
            }
        }

        let inner = match format.kind {
            TrackKind::Video => DecoderType::Video(context.decoder().video()?),
            TrackKind::Audio => DecoderType::Audio(context.decoder().audio()?),
        };
        log::debug!("{} decoder opened for {}", self.kind, format);
        self.inner = Some(inner);
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
        self.scaler = None;
        self.resampler = None;
        self.inner = None;
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> anyhow::Result<Option<usize>> {
        if !self.started || self.input_pending || self.output.in_flight() >= MAX_PENDING_OUTPUT {
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
                "{} decoder input buffer {} was not dequeued",
                self.kind, index
            )));
        }
        self.input_pending = false;
        self.next_input = self.next_input.wrapping_add(1);

        if info.is_end_of_stream() {
            return self.finish();
        }
        let mut packet = Packet::copy(data);
        packet.set_pts(Some(info.presentation_time_us));
        packet.set_dts(None);
        if info.flags.is_key_frame() {
            packet.set_flags(codec::packet::Flags::KEY);
        }
        match self.inner()?.send_packet(&packet) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::InvalidData) => {
                log::warn!(
                    "{} decoder dropped a corrupt packet at {}us",
                    self.kind,
                    info.presentation_time_us
                );
            }
            Err(e) => return Err(e.into()),
        }
        self.receive_frames()
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
