pub mod codec;
pub mod compositor;
pub mod demuxer;
pub mod factory;
pub mod types;
pub mod writer;

pub use codec::{Codec, Encoder, POLL_TIMEOUT};
pub use compositor::{Compositor, Layer, SoftwareCompositor};
pub use demuxer::{Demuxer, first_track};
pub use factory::{FormatStrategy, MediaFactory};
pub use types::{
    BufferFlags, BufferInfo, MediaFormat, OutputStatus, SampleInfo, SeekMode, TrackKind,
    VideoFrame,
};
pub use writer::ContainerWriter;
