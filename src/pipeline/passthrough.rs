use crate::error::TranscodeError;
use crate::media::{BufferFlags, BufferInfo, Demuxer, TrackKind};
use crate::muxer::QueuedMuxer;
use crate::pipeline::{StepContext, TrackSource};
use crate::telemetry::Telemetry;
use crate::timeline::TimeLine;

/// Copies the coded samples of one input track straight into the output.
pub struct PassThroughTrackTranscoder {
    kind: TrackKind,
    channel: String,
    demuxer: Box<dyn Demuxer>,
    track_index: usize,
    buffer: Vec<u8>,
    last_segment: bool,
    eos: bool,
    written_us: i64,
    released: bool,
    log: Telemetry,
}

impl PassThroughTrackTranscoder {
    /// Copies the first of `sources`, removing it from the list once the
    /// muxer accepted its format. The others stay with the caller.
    pub fn new(
        kind: TrackKind,
        sources: &mut Vec<TrackSource>,
        muxer: &mut QueuedMuxer,
        log: &Telemetry,
    ) -> anyhow::Result<Self> {
        let log = log.component("passthrough");
        let Some(first) = sources.first() else {
            anyhow::bail!(TranscodeError::Configuration(format!(
                "no {} input to copy",
                kind
            )));
        };
        muxer.set_output_format(kind, &first.format)?;
        let source = sources.remove(0);
        log.info(format_args!(
            "copying {} track {} of {} ({})",
            kind, source.track_index, source.channel, source.format
        ));
        if !sources.is_empty() {
            log.warn(format_args!(
                "{} other channels are not copied",
                sources.len()
            ));
        }
        Ok(Self {
            kind,
            channel: source.channel,
            demuxer: source.demuxer,
            track_index: source.track_index,
            buffer: Vec::new(),
            last_segment: false,
            eos: false,
            written_us: 0,
            released: false,
            log,
        })
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn setup_segment(&mut self, timeline: &mut TimeLine, segment: usize) -> anyhow::Result<()> {
        self.last_segment = timeline
            .segment(segment)
            .map(|s| s.is_last())
            .unwrap_or(true);
        Ok(())
    }

    pub fn step(&mut self, ctx: &mut StepContext<'_>) -> anyhow::Result<bool> {
        if self.eos {
            return Ok(false);
        }
        match self.demuxer.sample_track_index() {
            Some(track) if track != self.track_index => {
                self.demuxer.advance();
                return Ok(true);
            }
            _ => {}
        }

        match self.demuxer.read_sample(&mut self.buffer)? {
            None => {
                self.eos = true;
                ctx.muxer.write_sample_data(
                    self.kind,
                    &[],
                    &BufferInfo::end_of_stream(self.written_us),
                )?;
                self.log.debug(format_args!(
                    "{} of {} copied up to {}us",
                    self.kind, self.channel, self.written_us
                ));
            }
            Some(sample) => {
                let flags = if sample.key_frame {
                    BufferFlags::KEY_FRAME
                } else {
                    BufferFlags::NONE
                };
                let size = sample.size.min(self.buffer.len());
                ctx.muxer.write_sample_data(
                    self.kind,
                    &self.buffer[..size],
                    &BufferInfo::new(size, sample.presentation_time_us, flags),
                )?;
                self.written_us = self.written_us.max(sample.presentation_time_us);
                self.demuxer.advance();
            }
        }
        Ok(true)
    }

    /// Segments do not apply to a copied track; only the end of the last
    /// segment waits for the copy to complete.
    pub fn is_segment_finished(&self) -> bool {
        !self.last_segment || self.eos
    }

    pub fn output_presentation_time_us(&self) -> i64 {
        self.written_us
    }

    pub fn release_demuxers(&mut self) -> anyhow::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.demuxer.release()
    }
}
