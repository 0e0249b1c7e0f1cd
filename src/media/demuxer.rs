use crate::media::types::{MediaFormat, SampleInfo, SeekMode, TrackKind};

pub trait Demuxer: Send {
    fn track_count(&self) -> usize;
    fn track_format(&self, index: usize) -> Option<MediaFormat>;
    fn select_track(&mut self, index: usize) -> anyhow::Result<()>;

    /// Track of the sample under the cursor, `None` once the input is exhausted.
    fn sample_track_index(&self) -> Option<usize>;

    /// Copies the current sample into `buffer`; `None` at end of stream.
    fn read_sample(&mut self, buffer: &mut Vec<u8>) -> anyhow::Result<Option<SampleInfo>>;

    /// Moves to the next sample, returns false when none is left.
    fn advance(&mut self) -> bool;

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> anyhow::Result<()>;
    fn release(&mut self) -> anyhow::Result<()>;
}

/// First track of `kind` and its format.
pub fn first_track(demuxer: &dyn Demuxer, kind: TrackKind) -> Option<(usize, MediaFormat)> {
    (0..demuxer.track_count()).find_map(|index| {
        demuxer
            .track_format(index)
            .filter(|format| format.kind == kind)
            .map(|format| (index, format))
    })
}
