use bytes::Bytes;

use crate::error::TranscodeError;
use crate::media::types::VideoFrame;

/// One ready source picture and the opacity it is drawn with.
#[derive(Debug, Clone, Copy)]
pub struct Layer<'a> {
    pub frame: &'a VideoFrame,
    pub alpha: f32,
}

/// Blends the ready pictures of a segment into exactly one output frame.
pub trait Compositor: Send {
    fn compose(&mut self, layers: &[Layer<'_>], pts_us: i64) -> anyhow::Result<VideoFrame>;

    fn release(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// CPU compositor for packed RGBA frames: layers are drawn in order with
/// "over" blending onto a black canvas.
pub struct SoftwareCompositor {
    width: u32,
    height: u32,
    canvas: Vec<u8>,
}

impl SoftwareCompositor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            canvas: Vec::new(),
        }
    }
}

impl Compositor for SoftwareCompositor {
    fn compose(&mut self, layers: &[Layer<'_>], pts_us: i64) -> anyhow::Result<VideoFrame> {
        let len = VideoFrame::expected_len(self.width, self.height);
        self.canvas.clear();
        self.canvas.resize(len, 0);

        for layer in layers {
            let frame = layer.frame;
            if frame.width != self.width || frame.height != self.height || frame.data.len() < len {
                anyhow::bail!(TranscodeError::Format(format!(
                    "layer {}x{} ({} bytes) does not fit canvas {}x{}",
                    frame.width,
                    frame.height,
                    frame.data.len(),
                    self.width,
                    self.height
                )));
            }
            let alpha = layer.alpha.clamp(0.0, 1.0);
            for (dst, src) in self.canvas.iter_mut().zip(frame.data.iter()) {
                *dst = (*src as f32 * alpha + *dst as f32 * (1.0 - alpha)).round() as u8;
            }
        }

        Ok(VideoFrame::new(
            Bytes::copy_from_slice(&self.canvas),
            self.width,
            self.height,
            pts_us,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(value: u8, pts_us: i64) -> VideoFrame {
        VideoFrame::new(Bytes::from(vec![value; VideoFrame::expected_len(2, 2)]), 2, 2, pts_us)
    }

    #[test]
    fn test_single_layer_fades_from_black() -> anyhow::Result<()> {
        let mut compositor = SoftwareCompositor::new(2, 2);
        let frame = solid(200, 0);
        let out = compositor.compose(&[Layer { frame: &frame, alpha: 0.5 }], 40_000)?;
        assert_eq!(out.pts_us, 40_000);
        assert!(out.data.iter().all(|b| *b == 100));
        Ok(())
    }

    #[test]
    fn test_layers_blend_in_order() -> anyhow::Result<()> {
        let mut compositor = SoftwareCompositor::new(2, 2);
        let bottom = solid(100, 0);
        let top = solid(200, 0);
        let out = compositor.compose(
            &[
                Layer { frame: &bottom, alpha: 1.0 },
                Layer { frame: &top, alpha: 0.25 },
            ],
            0,
        )?;
        assert!(out.data.iter().all(|b| *b == 125));
        Ok(())
    }

    #[test]
    fn test_mismatched_layer_is_rejected() {
        let mut compositor = SoftwareCompositor::new(4, 4);
        let frame = solid(1, 0);
        assert!(compositor.compose(&[Layer { frame: &frame, alpha: 1.0 }], 0).is_err());
    }
}
