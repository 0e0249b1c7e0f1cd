//! Hardware encoder discovery with software fallback.

use ffmpeg_next::format::Pixel;

/// First hardware encoder available for the given software codec name.
pub fn find_hw_encoder(codec_name: &str) -> Option<ffmpeg_next::Codec> {
    let hw_names: &[&str] = match codec_name {
        "libx264" | "h264" => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        "libx265" | "hevc" => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        "libvpx-vp9" | "vp9" => &["vp9_vaapi", "vp9_qsv"],
        "libaom-av1" | "libsvtav1" | "av1" => &["av1_nvenc", "av1_vaapi", "av1_qsv"],
        _ => &[],
    };

    for name in hw_names {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

pub fn is_hw_encoder(codec_name: &str) -> bool {
    ["nvenc", "vaapi", "qsv", "v4l2m2m"]
        .iter()
        .any(|suffix| codec_name.contains(suffix))
}

/// Pixel format composed RGBA pictures are converted to before encoding.
pub fn pixel_format_for_encoder(codec_name: &str) -> Pixel {
    if is_hw_encoder(codec_name) {
        Pixel::NV12
    } else {
        Pixel::YUV420P
    }
}

/// Software encoder name for an output mime type.
pub fn software_encoder_for(mime: &str) -> Option<&'static str> {
    match mime {
        "video/avc" => Some("libx264"),
        "video/hevc" => Some("libx265"),
        "video/x-vnd.on2.vp9" => Some("libvpx-vp9"),
        "video/av01" => Some("libsvtav1"),
        "audio/mp4a-latm" => Some("aac"),
        "audio/opus" => Some("libopus"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hw_encoders_take_nv12() {
        assert_eq!(pixel_format_for_encoder("h264_vaapi"), Pixel::NV12);
        assert_eq!(pixel_format_for_encoder("libx264"), Pixel::YUV420P);
        assert!(!is_hw_encoder("aac"));
    }

    #[test]
    fn test_software_encoder_names() {
        assert_eq!(software_encoder_for("video/avc"), Some("libx264"));
        assert_eq!(software_encoder_for("audio/mp4a-latm"), Some("aac"));
        assert_eq!(software_encoder_for("video/raw"), None);
    }
}
