use bytes::Bytes;
use ffmpeg_next::format::{Pixel, Sample};
use ffmpeg_next::software::{resampling, scaling};
use ffmpeg_next::{ChannelLayout, frame};

pub struct Scaler {
    context: scaling::Context,
    src: (Pixel, u32, u32),
    dst: (Pixel, u32, u32),
}

impl Scaler {
    pub fn new(src: (Pixel, u32, u32), dst: (Pixel, u32, u32)) -> anyhow::Result<Self> {
        let context = scaling::Context::get(
            src.0,
            src.1,
            src.2,
            dst.0,
            dst.1,
            dst.2,
            scaling::flag::Flags::BILINEAR,
        )?;
        Ok(Self { context, src, dst })
    }

    /// Reuses `cached` when it converts between the same geometries.
    pub fn reuse(
        cached: &mut Option<Scaler>,
        src: (Pixel, u32, u32),
        dst: (Pixel, u32, u32),
    ) -> anyhow::Result<&mut Scaler> {
        let stale = cached
            .as_ref()
            .map(|scaler| scaler.src != src || scaler.dst != dst)
            .unwrap_or(true);
        if stale {
            *cached = Some(Scaler::new(src, dst)?);
        }
        cached
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("scaler not initialised"))
    }

    pub fn run(&mut self, frame: &frame::Video, dst: &mut frame::Video) -> anyhow::Result<()> {
        self.context.run(frame, dst).map_err(|e| e.into())
    }
}

unsafe impl Send for Scaler {}

/// Tightly packed copy of the first plane of a packed RGBA frame.
pub fn pack_rgba(frame: &frame::Video) -> Bytes {
    let row = frame.width() as usize * 4;
    let stride = frame.stride(0);
    let data = frame.data(0);
    if stride == row {
        return Bytes::copy_from_slice(&data[..row * frame.height() as usize]);
    }
    let mut packed = Vec::with_capacity(row * frame.height() as usize);
    for line in data.chunks(stride).take(frame.height() as usize) {
        packed.extend_from_slice(&line[..row.min(line.len())]);
    }
    Bytes::from(packed)
}

/// RGBA frame wrapping packed pixel data.
pub fn rgba_frame(data: &[u8], width: u32, height: u32) -> frame::Video {
    let mut frame = frame::Video::new(Pixel::RGBA, width, height);
    let row = width as usize * 4;
    let stride = frame.stride(0);
    let plane = frame.data_mut(0);
    for (y, line) in data.chunks(row).take(height as usize).enumerate() {
        plane[y * stride..y * stride + line.len()].copy_from_slice(line);
    }
    frame
}

pub struct Resampler {
    context: resampling::Context,
    src: (Sample, u16, u32),
    dst: (Sample, u16, u32),
}

impl Resampler {
    pub fn new(src: (Sample, u16, u32), dst: (Sample, u16, u32)) -> anyhow::Result<Self> {
        let context = resampling::Context::get(
            src.0,
            ChannelLayout::default(src.1 as i32),
            src.2,
            dst.0,
            ChannelLayout::default(dst.1 as i32),
            dst.2,
        )?;
        Ok(Self { context, src, dst })
    }

    pub fn reuse(
        cached: &mut Option<Resampler>,
        src: (Sample, u16, u32),
        dst: (Sample, u16, u32),
    ) -> anyhow::Result<&mut Resampler> {
        let stale = cached
            .as_ref()
            .map(|resampler| resampler.src != src || resampler.dst != dst)
            .unwrap_or(true);
        if stale {
            *cached = Some(Resampler::new(src, dst)?);
        }
        cached
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("resampler not initialised"))
    }

    pub fn run(&mut self, frame: &frame::Audio) -> anyhow::Result<frame::Audio> {
        let mut converted = frame::Audio::empty();
        self.context.run(frame, &mut converted)?;
        Ok(converted)
    }

    /// Samples still buffered inside the resampler.
    pub fn flush(&mut self) -> anyhow::Result<Option<frame::Audio>> {
        let mut converted = frame::Audio::empty();
        self.context.flush(&mut converted)?;
        Ok((converted.samples() > 0).then_some(converted))
    }

    pub fn output(&self) -> (Sample, u16, u32) {
        self.dst
    }
}

unsafe impl Send for Resampler {}

/// Interleaved s16 payload of a packed s16 frame.
pub fn pack_s16(frame: &frame::Audio, channels: u16) -> Bytes {
    let len = frame.samples() * channels as usize * 2;
    let data = frame.data(0);
    Bytes::copy_from_slice(&data[..len.min(data.len())])
}

pub fn channel_count(frame: &frame::Audio) -> u16 {
    unsafe { (*frame.as_ptr()).ch_layout.nb_channels.max(0) as u16 }
}
