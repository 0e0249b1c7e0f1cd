use crate::media::types::{BufferInfo, MediaFormat};

/// Container multiplexer. Tracks can only be added before `start`.
pub trait ContainerWriter: Send {
    fn add_track(&mut self, format: &MediaFormat) -> anyhow::Result<usize>;
    fn set_orientation_hint(&mut self, degrees: i32) -> anyhow::Result<()>;
    fn start(&mut self) -> anyhow::Result<()>;
    fn write_sample_data(
        &mut self,
        track: usize,
        data: &[u8],
        info: &BufferInfo,
    ) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
    fn release(&mut self) -> anyhow::Result<()>;
}
