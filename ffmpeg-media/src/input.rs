use std::path::Path;

use ffmpeg_next::codec::packet::Packet;
use timeline_transcoder::TranscodeError;
use timeline_transcoder::media::{Demuxer, MediaFormat, SampleInfo, SeekMode};

use crate::stream::{AvStream, to_micros};

/// File demuxer with a one packet lookahead, so the current sample can be
/// inspected before it is consumed.
pub struct FfmpegDemuxer {
    url: String,
    inner: Option<ffmpeg_next::format::context::Input>,
    streams: Vec<AvStream>,
    container_duration_us: Option<i64>,
    selected: Option<usize>,
    current: Option<Packet>,
    last_pts_us: i64,
}

unsafe impl Send for FfmpegDemuxer {}

impl FfmpegDemuxer {
    pub fn open(url: &str) -> anyhow::Result<Self> {
        let input = ffmpeg_next::format::input(&Path::new(url))
            .map_err(|e| TranscodeError::Resource(format!("open {}: {}", url, e)))?;
        let streams: Vec<AvStream> = input.streams().map(AvStream::from).collect();
        // container duration is in AV_TIME_BASE units already
        let duration = input.duration();
        let container_duration_us = (duration > 0).then_some(duration);
        log::debug!("opened {} ({} streams)", url, streams.len());
        Ok(Self {
            url: url.to_string(),
            inner: Some(input),
            streams,
            container_duration_us,
            selected: None,
            current: None,
            last_pts_us: 0,
        })
    }

    fn input(&mut self) -> anyhow::Result<&mut ffmpeg_next::format::context::Input> {
        let url = &self.url;
        self.inner
            .as_mut()
            .ok_or_else(|| TranscodeError::Resource(format!("{} already released", url)).into())
    }

    /// Reads ahead to the next packet of the selected stream.
    fn fill(&mut self) -> anyhow::Result<()> {
        self.current = None;
        let Some(selected) = self.selected else {
            return Ok(());
        };
        loop {
            let mut packet = Packet::empty();
            match packet.read(self.input()?) {
                Ok(()) => {
                    if packet.stream() == selected {
                        self.current = Some(packet);
                        return Ok(());
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(()),
                Err(e) => {
                    anyhow::bail!(TranscodeError::Resource(format!(
                        "read {}: {}",
                        self.url, e
                    )))
                }
            }
        }
    }

    fn selected_stream(&self) -> Option<&AvStream> {
        self.selected.and_then(|index| self.streams.get(index))
    }
}

impl Demuxer for FfmpegDemuxer {
    fn track_count(&self) -> usize {
        self.streams.len()
    }

    fn track_format(&self, index: usize) -> Option<MediaFormat> {
        self.streams
            .get(index)
            .and_then(|stream| stream.media_format(self.container_duration_us))
    }

    fn select_track(&mut self, index: usize) -> anyhow::Result<()> {
        if index >= self.streams.len() {
            anyhow::bail!(TranscodeError::Resource(format!(
                "{} has no track {}",
                self.url, index
            )));
        }
        self.selected = Some(index);
        self.fill()
    }

    fn sample_track_index(&self) -> Option<usize> {
        self.current.as_ref().map(|packet| packet.stream())
    }

    fn read_sample(&mut self, buffer: &mut Vec<u8>) -> anyhow::Result<Option<SampleInfo>> {
        let Some(stream) = self.selected_stream() else {
            return Ok(None);
        };
        let (time_base, start_us) = (stream.time_base(), stream.start_us());
        let Some(packet) = self.current.as_ref() else {
            return Ok(None);
        };

        let pts_us = match packet.pts().or(packet.dts()) {
            Some(ts) => to_micros(ts, time_base) - start_us,
            None => self.last_pts_us + 1,
        };
        let data = packet.data().unwrap_or_default();
        buffer.clear();
        buffer.extend_from_slice(data);
        let info = SampleInfo {
            size: data.len(),
            presentation_time_us: pts_us,
            key_frame: packet.is_key(),
        };
        self.last_pts_us = pts_us;
        Ok(Some(info))
    }

    fn advance(&mut self) -> bool {
        if let Err(e) = self.fill() {
            log::warn!("{}: {:#}, treating as end of stream", self.url, e);
            self.current = None;
        }
        self.current.is_some()
    }

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> anyhow::Result<()> {
        let target = time_us + self.selected_stream().map(|s| s.start_us()).unwrap_or(0);
        let url = self.url.clone();
        let input = self.input()?;
        let result = match mode {
            SeekMode::PreviousKeyframe => input.seek(target, ..target),
            SeekMode::NextKeyframe => input.seek(target, target..),
        };
        result.map_err(|e| TranscodeError::Resource(format!("seek {} to {}us: {}", url, time_us, e)))?;
        log::debug!("{} seeked to {}us ({:?})", url, time_us, mode);
        self.fill()
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.current = None;
        if self.inner.take().is_some() {
            log::debug!("closed {}", self.url);
        }
        Ok(())
    }
}
