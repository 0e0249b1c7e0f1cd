use std::time::Duration;

use bytes::Bytes;

use crate::error::TranscodeError;
use crate::media::types::{BufferInfo, MediaFormat, OutputStatus, VideoFrame};

/// Poll timeout used by every pipeline stage; codecs must never block on it.
pub const POLL_TIMEOUT: Duration = Duration::ZERO;

/// Buffer-indexed codec protocol shared by decoders and encoders.
///
/// Input buffers are dequeued by index, filled and queued back; output
/// buffers are dequeued by index and must be released exactly once.
pub trait Codec: Send {
    fn configure(&mut self, format: &MediaFormat) -> anyhow::Result<()>;
    fn start(&mut self) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
    fn release(&mut self) -> anyhow::Result<()>;

    /// `None` when no input buffer is free right now.
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> anyhow::Result<Option<usize>>;
    fn queue_input_buffer(
        &mut self,
        index: usize,
        data: &[u8],
        info: BufferInfo,
    ) -> anyhow::Result<()>;

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> anyhow::Result<OutputStatus>;
    /// Payload of a dequeued, not yet released, output buffer.
    fn output_buffer(&mut self, index: usize) -> anyhow::Result<Bytes>;
    fn output_format(&self) -> Option<MediaFormat>;
    fn release_output_buffer(&mut self, index: usize, render: bool) -> anyhow::Result<()>;
}

/// Encoder side of the codec protocol. Video encoders take composed frames
/// through their input surface; audio encoders use buffer input only.
pub trait Encoder: Codec {
    fn queue_frame(&mut self, frame: VideoFrame) -> anyhow::Result<()> {
        let _ = frame;
        anyhow::bail!(TranscodeError::Resource(
            "encoder has no input surface".to_string()
        ))
    }

    fn signal_end_of_input_stream(&mut self) -> anyhow::Result<()>;
}
