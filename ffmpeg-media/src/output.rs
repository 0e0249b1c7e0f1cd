use std::path::{Path, PathBuf};

use ffmpeg_next::{Packet, Rational, codec, ffi, media};
use timeline_transcoder::TranscodeError;
use timeline_transcoder::media::{BufferInfo, ContainerWriter, MediaFormat, TrackKind};

use crate::stream::{codec_id_for, from_micros, set_extradata};

/// Container output. The header is written on `start`, the trailer on `stop`.
pub struct FfmpegWriter {
    path: PathBuf,
    inner: Option<ffmpeg_next::format::context::Output>,
    kinds: Vec<TrackKind>,
    orientation: i32,
    have_written_header: bool,
    have_written_trailer: bool,
}

unsafe impl Send for FfmpegWriter {}

impl FfmpegWriter {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let output = ffmpeg_next::format::output(&path).map_err(|e| {
            TranscodeError::Resource(format!("create {}: {}", path.display(), e))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Some(output),
            kinds: Vec::new(),
            orientation: 0,
            have_written_header: false,
            have_written_trailer: false,
        })
    }

    fn output(&mut self) -> anyhow::Result<&mut ffmpeg_next::format::context::Output> {
        let path = &self.path;
        self.inner.as_mut().ok_or_else(|| {
            TranscodeError::Resource(format!("{} already released", path.display())).into()
        })
    }

    /// Writes a display matrix on every video stream.
    fn apply_orientation(&mut self) -> anyhow::Result<()> {
        let degrees = self.orientation;
        if degrees == 0 {
            return Ok(());
        }
        let kinds = self.kinds.clone();
        let output = self.output()?;
        for (index, kind) in kinds.iter().enumerate() {
            if *kind != TrackKind::Video {
                continue;
            }
            let Some(stream) = output.stream(index) else {
                continue;
            };
            unsafe {
                let par = (*stream.as_ptr()).codecpar;
                let side = ffi::av_packet_side_data_new(
                    &mut (*par).coded_side_data,
                    &mut (*par).nb_coded_side_data,
                    ffi::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX,
                    9 * std::mem::size_of::<i32>(),
                    0,
                );
                if side.is_null() {
                    anyhow::bail!(TranscodeError::Resource(
                        "cannot allocate display matrix".to_string()
                    ));
                }
                ffi::av_display_rotation_set((*side).data as *mut i32, -(degrees as f64));
            }
        }
        Ok(())
    }
}

impl ContainerWriter for FfmpegWriter {
    fn add_track(&mut self, format: &MediaFormat) -> anyhow::Result<usize> {
        if self.have_written_header {
            anyhow::bail!(TranscodeError::Resource(
                "tracks can only be added before start".to_string()
            ));
        }
        let id = codec_id_for(&format.mime)
            .ok_or_else(|| TranscodeError::Format(format!("no codec for {}", format.mime)))?;
        let output = self.output()?;
        let mut stream = output.add_stream(ffmpeg_next::encoder::find(id))?;
        let time_base = match format.kind {
            TrackKind::Video => Rational::new(1, 90_000),
            TrackKind::Audio => Rational::new(1, format.sample_rate.max(1) as i32),
        };
        stream.set_time_base(time_base);
        let index = stream.index();

        unsafe {
            let par = (*stream.as_mut_ptr()).codecpar;
            (*par).codec_id = id.into();
            match format.kind {
                TrackKind::Video => {
                    (*par).codec_type = media::Type::Video.into();
                    (*par).width = format.width as i32;
                    (*par).height = format.height as i32;
                }
                TrackKind::Audio => {
                    (*par).codec_type = media::Type::Audio.into();
                    (*par).sample_rate = format.sample_rate as i32;
                    ffi::av_channel_layout_default(
                        &mut (*par).ch_layout,
                        format.channel_count.max(1) as i32,
                    );
                }
            }
            if let Some(bit_rate) = format.bit_rate {
                (*par).bit_rate = bit_rate as i64;
            }
            if let Some(config) = &format.codec_config {
                set_extradata(&mut (*par).extradata, &mut (*par).extradata_size, config);
            }
        }
        self.kinds.push(format.kind);
        log::info!("{}: track {} {}", self.path.display(), index, format);
        Ok(index)
    }

    fn set_orientation_hint(&mut self, degrees: i32) -> anyhow::Result<()> {
        if self.have_written_header {
            anyhow::bail!(TranscodeError::Resource(
                "orientation hint after start".to_string()
            ));
        }
        self.orientation = degrees.rem_euclid(360);
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.have_written_header {
            return Ok(());
        }
        self.apply_orientation()?;
        self.output()?.write_header()?;
        self.have_written_header = true;
        Ok(())
    }

    fn write_sample_data(
        &mut self,
        track: usize,
        data: &[u8],
        info: &BufferInfo,
    ) -> anyhow::Result<()> {
        if !self.have_written_header {
            anyhow::bail!(TranscodeError::Resource(
                "sample written before start".to_string()
            ));
        }
        let output = self.output()?;
        let time_base = output
            .stream(track)
            .map(|stream| stream.time_base())
            .ok_or_else(|| TranscodeError::Resource(format!("no output track {}", track)))?;

        let ts = from_micros(info.presentation_time_us, time_base);
        let mut packet = Packet::copy(data);
        packet.set_stream(track);
        packet.set_pts(Some(ts));
        packet.set_dts(Some(ts));
        packet.set_position(-1);
        if info.flags.is_key_frame() {
            packet.set_flags(codec::packet::Flags::KEY);
        }
        packet.write_interleaved(output)?;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.output()?.write_trailer()?;
            log::info!("{} finished", self.path.display());
        }
        Ok(())
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.inner = None;
        Ok(())
    }
}
