use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame;
use timeline_transcoder::media::{Compositor, Layer, SoftwareCompositor, VideoFrame};

use crate::scaler::{Scaler, pack_rgba, rgba_frame};

/// Scales layers of any size to the canvas before blending them.
pub struct FfmpegCompositor {
    width: u32,
    height: u32,
    scaler: Option<Scaler>,
    blender: SoftwareCompositor,
}

impl FfmpegCompositor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            scaler: None,
            blender: SoftwareCompositor::new(width, height),
        }
    }

    fn fit(&mut self, source: &VideoFrame) -> anyhow::Result<Option<VideoFrame>> {
        if source.width == self.width && source.height == self.height {
            return Ok(None);
        }
        let input = rgba_frame(&source.data, source.width, source.height);
        let scaler = Scaler::reuse(
            &mut self.scaler,
            (Pixel::RGBA, source.width, source.height),
            (Pixel::RGBA, self.width, self.height),
        )?;
        let mut scaled = frame::Video::empty();
        scaler.run(&input, &mut scaled)?;
        Ok(Some(VideoFrame::new(
            pack_rgba(&scaled),
            self.width,
            self.height,
            source.pts_us,
        )))
    }
}

impl Compositor for FfmpegCompositor {
    fn compose(&mut self, layers: &[Layer<'_>], pts_us: i64) -> anyhow::Result<VideoFrame> {
        let scaled = layers
            .iter()
            .map(|layer| self.fit(layer.frame))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let fitted: Vec<Layer<'_>> = layers
            .iter()
            .zip(&scaled)
            .map(|(layer, scaled)| Layer {
                frame: scaled.as_ref().unwrap_or(layer.frame),
                alpha: layer.alpha,
            })
            .collect();
        self.blender.compose(&fitted, pts_us)
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.scaler = None;
        Ok(())
    }
}
