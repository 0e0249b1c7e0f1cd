//! Container writer front that holds samples back until every expected track
//! has announced its output format.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;

use crate::config::EngineConfig;
use crate::error::TranscodeError;
use crate::media::{BufferInfo, ContainerWriter, MediaFormat, TrackKind};
use crate::telemetry::Telemetry;

/// Checks the final encoder formats before the writer starts.
pub type FormatValidator =
    Box<dyn FnMut(Option<&MediaFormat>, Option<&MediaFormat>) -> anyhow::Result<()> + Send>;

struct PendingSample {
    kind: TrackKind,
    data: Bytes,
    info: BufferInfo,
}

pub struct QueuedMuxer {
    writer: Box<dyn ContainerWriter>,
    expected: Vec<TrackKind>,
    formats: BTreeMap<TrackKind, MediaFormat>,
    tracks: BTreeMap<TrackKind, usize>,
    pending: VecDeque<PendingSample>,
    pending_bytes: usize,
    queue_limit: usize,
    started: bool,
    finished: bool,
    released: bool,
    validator: Option<FormatValidator>,
    log: Telemetry,
}

impl QueuedMuxer {
    pub fn new(
        writer: Box<dyn ContainerWriter>,
        expected: &[TrackKind],
        config: &EngineConfig,
        log: Telemetry,
    ) -> Self {
        let mut expected = expected.to_vec();
        expected.sort();
        expected.dedup();
        Self {
            writer,
            expected,
            formats: BTreeMap::new(),
            tracks: BTreeMap::new(),
            pending: VecDeque::new(),
            pending_bytes: 0,
            queue_limit: config.muxer_queue_limit_bytes,
            started: false,
            finished: false,
            released: false,
            validator: None,
            log: log.component("muxer"),
        }
    }

    pub fn with_validator(mut self, validator: FormatValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn output_format(&self, kind: TrackKind) -> Option<&MediaFormat> {
        self.formats.get(&kind)
    }

    pub fn set_orientation_hint(&mut self, degrees: i32) -> anyhow::Result<()> {
        if self.started {
            anyhow::bail!(TranscodeError::Format(
                "orientation hint after the writer started".to_string()
            ));
        }
        self.writer.set_orientation_hint(degrees)
    }

    /// Records the actual format of `kind`. Starts the writer and replays the
    /// queued samples once every expected track is known.
    pub fn set_output_format(&mut self, kind: TrackKind, format: &MediaFormat) -> anyhow::Result<()> {
        if !self.expected.contains(&kind) {
            anyhow::bail!(TranscodeError::Format(format!(
                "no {} track expected in the output",
                kind
            )));
        }
        if let Some(known) = self.formats.get(&kind) {
            if known == format {
                return Ok(());
            }
            anyhow::bail!(TranscodeError::Format(format!(
                "{} output format changed from {} to {}",
                kind, known, format
            )));
        }
        self.log.info(format_args!("{} output format {}", kind, format));
        self.formats.insert(kind, format.clone());

        if self.expected.iter().all(|k| self.formats.contains_key(k)) {
            self.start_writer()?;
        }
        Ok(())
    }

    pub fn write_sample_data(
        &mut self,
        kind: TrackKind,
        data: &[u8],
        info: &BufferInfo,
    ) -> anyhow::Result<()> {
        if info.size == 0 || data.is_empty() {
            return Ok(());
        }
        if self.finished {
            anyhow::bail!(TranscodeError::Format(format!(
                "{} sample at {}us after the writer stopped",
                kind, info.presentation_time_us
            )));
        }
        if self.started {
            return self.write_direct(kind, data, info);
        }

        if self.pending_bytes + data.len() > self.queue_limit {
            anyhow::bail!(TranscodeError::Resource(format!(
                "{} bytes queued before the writer started, limit {}",
                self.pending_bytes + data.len(),
                self.queue_limit
            )));
        }
        self.pending_bytes += data.len();
        self.pending.push_back(PendingSample {
            kind,
            data: Bytes::copy_from_slice(data),
            info: *info,
        });
        Ok(())
    }

    /// Stops the writer. Only the first call has an effect.
    pub fn finish(&mut self) -> anyhow::Result<()> {
        if !self.started {
            anyhow::bail!(TranscodeError::Format(
                "output finished before every track reported its format".to_string()
            ));
        }
        if !self.finished {
            self.finished = true;
            self.writer.stop()?;
        }
        Ok(())
    }

    pub fn release(&mut self) -> anyhow::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.pending.clear();
        self.writer.release()
    }

    fn start_writer(&mut self) -> anyhow::Result<()> {
        if let Some(validator) = self.validator.as_mut() {
            validator(
                self.formats.get(&TrackKind::Video),
                self.formats.get(&TrackKind::Audio),
            )?;
        }
        for kind in &self.expected {
            if let Some(format) = self.formats.get(kind) {
                let track = self.writer.add_track(format)?;
                self.tracks.insert(*kind, track);
            }
        }
        self.writer.start()?;
        self.started = true;

        self.log.debug(format_args!(
            "writer started, replaying {} samples ({} bytes)",
            self.pending.len(),
            self.pending_bytes
        ));
        while let Some(sample) = self.pending.pop_front() {
            self.write_direct(sample.kind, &sample.data, &sample.info)?;
        }
        self.pending_bytes = 0;
        Ok(())
    }

    fn write_direct(&mut self, kind: TrackKind, data: &[u8], info: &BufferInfo) -> anyhow::Result<()> {
        let Some(track) = self.tracks.get(&kind).copied() else {
            anyhow::bail!(TranscodeError::Format(format!("no {} track in the output", kind)));
        };
        self.writer.write_sample_data(track, data, info)
    }
}

#[cfg(test)]
#[path = "muxer_test.rs"]
mod muxer_test;
