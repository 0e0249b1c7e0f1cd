use ffmpeg_next::{Rational, Rescale, codec, ffi, format::stream, media, util::mathematics::rescale};
use timeline_transcoder::{MediaFormat, TrackKind};

/// Microsecond time base every timestamp crossing the crate boundary uses.
pub const MICROS: Rational = rescale::TIME_BASE;

const MIME_TABLE: &[(&str, codec::Id)] = &[
    ("video/avc", codec::Id::H264),
    ("video/hevc", codec::Id::HEVC),
    ("video/mp4v-es", codec::Id::MPEG4),
    ("video/x-vnd.on2.vp8", codec::Id::VP8),
    ("video/x-vnd.on2.vp9", codec::Id::VP9),
    ("video/av01", codec::Id::AV1),
    ("video/raw", codec::Id::RAWVIDEO),
    ("audio/mp4a-latm", codec::Id::AAC),
    ("audio/mpeg", codec::Id::MP3),
    ("audio/opus", codec::Id::OPUS),
    ("audio/raw", codec::Id::PCM_S16LE),
];

pub fn mime_for(id: codec::Id, kind: TrackKind) -> String {
    MIME_TABLE
        .iter()
        .find(|(_, known)| *known == id)
        .map(|(mime, _)| mime.to_string())
        .unwrap_or_else(|| format!("{}/{}", kind, id.name()))
}

pub fn codec_id_for(mime: &str) -> Option<codec::Id> {
    if let Some((_, id)) = MIME_TABLE.iter().find(|(known, _)| *known == mime) {
        return Some(*id);
    }
    let name = mime.split_once('/').map(|(_, name)| name)?;
    ffmpeg_next::decoder::find_by_name(name)
        .or_else(|| ffmpeg_next::encoder::find_by_name(name))
        .map(|codec| codec.id())
}

pub fn to_micros(ts: i64, time_base: Rational) -> i64 {
    ts.rescale(time_base, MICROS)
}

pub fn from_micros(us: i64, time_base: Rational) -> i64 {
    us.rescale(MICROS, time_base)
}

/// Input stream as seen by the demuxer: its parameters and timing.
pub struct AvStream {
    index: usize,
    parameters: codec::Parameters,
    time_base: Rational,
    rate: Rational,
    start_time: Option<i64>,
    duration: Option<i64>,
    rotate_tag: Option<i32>,
}

unsafe impl Send for AvStream {}
unsafe impl Sync for AvStream {}

impl AvStream {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn parameters(&self) -> &codec::Parameters {
        &self.parameters
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn is_video(&self) -> bool {
        self.parameters.medium() == media::Type::Video
    }

    pub fn is_audio(&self) -> bool {
        self.parameters.medium() == media::Type::Audio
    }

    /// Offset subtracted from every timestamp so the track starts at zero.
    pub fn start_us(&self) -> i64 {
        self.start_time
            .map(|ts| to_micros(ts, self.time_base))
            .unwrap_or(0)
    }

    pub fn duration_us(&self) -> Option<i64> {
        self.duration.map(|ts| to_micros(ts, self.time_base))
    }

    fn raw(&self) -> &ffi::AVCodecParameters {
        unsafe { &*self.parameters.as_ptr() }
    }

    /// Clockwise rotation from the display matrix, or the legacy tag.
    pub fn rotation_degrees(&self) -> i32 {
        let par = self.raw();
        let matrix = unsafe {
            ffi::av_packet_side_data_get(
                par.coded_side_data,
                par.nb_coded_side_data,
                ffi::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX,
            )
        };
        if !matrix.is_null() {
            let degrees = unsafe { ffi::av_display_rotation_get((*matrix).data as *const i32) };
            if degrees.is_finite() {
                return (-degrees.round() as i32).rem_euclid(360);
            }
        }
        self.rotate_tag.unwrap_or(0).rem_euclid(360)
    }

    pub fn codec_config(&self) -> Option<bytes::Bytes> {
        let par = self.raw();
        if par.extradata.is_null() || par.extradata_size <= 0 {
            return None;
        }
        let data =
            unsafe { std::slice::from_raw_parts(par.extradata, par.extradata_size as usize) };
        Some(bytes::Bytes::copy_from_slice(data))
    }

    pub fn media_format(&self, container_duration_us: Option<i64>) -> Option<MediaFormat> {
        let par = self.raw();
        let id = self.parameters.id();
        let mut format = if self.is_video() {
            let mut format = MediaFormat::video(
                &mime_for(id, TrackKind::Video),
                par.width.max(0) as u32,
                par.height.max(0) as u32,
            )
            .with_rotation(self.rotation_degrees());
            if self.rate.numerator() > 0 && self.rate.denominator() > 0 {
                let fps = (self.rate.numerator() as f64 / self.rate.denominator() as f64).round();
                format = format.with_frame_rate(fps as u32);
            }
            format
        } else if self.is_audio() {
            MediaFormat::audio(
                &mime_for(id, TrackKind::Audio),
                par.sample_rate.max(0) as u32,
                par.ch_layout.nb_channels.max(0) as u16,
            )
        } else {
            return None;
        };
        if par.bit_rate > 0 {
            format = format.with_bit_rate(par.bit_rate as u64);
        }
        if let Some(duration) = self.duration_us().or(container_duration_us) {
            format = format.with_duration_us(duration);
        }
        if let Some(config) = self.codec_config() {
            format = format.with_codec_config(config);
        }
        Some(format)
    }
}

impl From<stream::Stream<'_>> for AvStream {
    fn from(stream: stream::Stream<'_>) -> Self {
        let known = |ts: i64| (ts != ffi::AV_NOPTS_VALUE && ts >= 0).then_some(ts);
        Self {
            index: stream.index(),
            parameters: stream.parameters(),
            time_base: stream.time_base(),
            rate: stream.avg_frame_rate(),
            start_time: known(stream.start_time()),
            duration: known(stream.duration()).filter(|d| *d > 0),
            rotate_tag: stream
                .metadata()
                .get("rotate")
                .and_then(|value| value.parse().ok()),
        }
    }
}

/// Copies `data` into a freshly allocated, padded extradata buffer.
///
/// # Safety
/// `extradata` and `size` must point into a live codec context or codec
/// parameters that own their extradata.
pub unsafe fn set_extradata(extradata: *mut *mut u8, size: *mut i32, data: &[u8]) {
    unsafe {
        if !(*extradata).is_null() {
            ffi::av_freep(extradata as *mut std::ffi::c_void);
        }
        let padding = ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
        let buffer = ffi::av_mallocz(data.len() + padding) as *mut u8;
        if buffer.is_null() {
            *size = 0;
            return;
        }
        std::ptr::copy_nonoverlapping(data.as_ptr(), buffer, data.len());
        *extradata = buffer;
        *size = data.len() as i32;
    }
}
