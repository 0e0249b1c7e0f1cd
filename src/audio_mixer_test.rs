use super::*;
use crate::error::{ErrorKind, TranscodeError};

fn stereo() -> MediaFormat {
    MediaFormat::audio("audio/raw", 48_000, 2)
}

fn pcm(frames: usize, channels: usize, value: i16) -> Vec<u8> {
    let mut data = Vec::with_capacity(frames * channels * 2);
    for _ in 0..frames * channels {
        data.extend_from_slice(&value.to_le_bytes());
    }
    data
}

fn samples(chunk: &MixedChunk) -> Vec<i16> {
    chunk
        .data
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

fn mixer(channels: &[&str]) -> AudioMixer {
    let mut mixer = AudioMixer::new(&stereo()).unwrap();
    let names: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
    mixer.configure_segment(&names);
    for name in &names {
        mixer.set_input_format(name, &stereo()).unwrap();
    }
    mixer
}

#[test]
fn test_rejects_unusable_formats() {
    let err = AudioMixer::new(&MediaFormat::audio("audio/raw", 0, 2)).unwrap_err();
    assert_eq!(TranscodeError::classify(&err), ErrorKind::Format);

    let mut mixer = mixer(&["A"]);
    let err = mixer
        .set_input_format("A", &MediaFormat::audio("audio/raw", 44_100, 2))
        .unwrap_err();
    assert_eq!(TranscodeError::classify(&err), ErrorKind::Format);
}

#[test]
fn test_single_input_passes_through() -> anyhow::Result<()> {
    let mut mixer = mixer(&["A"]);
    mixer.queue("A", &pcm(960, 2, 1000), 0, 1.0)?;
    assert_eq!(mixer.duration_us("A", 960 * 4), 20_000);
    assert_eq!(mixer.bytes_for_us("A", 10_000), 480 * 4);
    assert_eq!(mixer.available_frames(false), 960);

    let chunk = mixer.mix(1024, false).unwrap();
    assert_eq!(chunk.pts_us, 0);
    assert_eq!(chunk.end_us, 20_000);
    assert_eq!(chunk.data.len(), 960 * 4);
    assert!(samples(&chunk).iter().all(|s| *s == 1000));
    assert_eq!(mixer.available_frames(true), 0);
    assert!(mixer.mix(1024, false).is_none());
    Ok(())
}

#[test]
fn test_waits_for_every_live_input() -> anyhow::Result<()> {
    let mut mixer = mixer(&["A", "B"]);
    mixer.queue("A", &pcm(960, 2, 1000), 0, 1.0)?;
    assert_eq!(mixer.available_frames(false), 0);

    mixer.queue("B", &pcm(480, 2, 1000), 0, 1.0)?;
    assert_eq!(mixer.available_frames(false), 480);
    let chunk = mixer.mix(4096, false).unwrap();
    assert!(samples(&chunk).iter().all(|s| *s == 2000));

    mixer.end_input("B");
    assert_eq!(mixer.available_frames(false), 480);
    let chunk = mixer.mix(4096, false).unwrap();
    assert_eq!(chunk.pts_us, 10_000);
    assert!(samples(&chunk).iter().all(|s| *s == 1000));
    Ok(())
}

#[test]
fn test_mono_input_is_upmixed_with_gain() -> anyhow::Result<()> {
    let mut mixer = mixer(&["A"]);
    mixer.set_input_format("A", &MediaFormat::audio("audio/raw", 48_000, 1))?;
    mixer.queue("A", &pcm(10, 1, 1000), 0, 0.5)?;

    let chunk = mixer.mix(100, false).unwrap();
    assert_eq!(samples(&chunk), vec![500; 20]);
    Ok(())
}

#[test]
fn test_gap_is_filled_with_silence() -> anyhow::Result<()> {
    let mut mixer = mixer(&["A"]);
    mixer.queue("A", &pcm(480, 2, 1000), 10_000, 1.0)?;
    assert_eq!(mixer.available_frames(false), 960);

    let mixed = samples(&mixer.mix(960, false).unwrap());
    assert!(mixed[..960].iter().all(|s| *s == 0));
    assert!(mixed[960..].iter().all(|s| *s == 1000));
    Ok(())
}

#[test]
fn test_overlap_is_dropped() -> anyhow::Result<()> {
    let mut mixer = mixer(&["A"]);
    mixer.queue("A", &pcm(960, 2, 1000), 0, 1.0)?;
    mixer.queue("A", &pcm(960, 2, 2000), 10_000, 1.0)?;
    assert_eq!(mixer.available_frames(false), 1440);

    let mixed = samples(&mixer.mix(2000, false).unwrap());
    assert_eq!(mixed.len(), 1440 * 2);
    assert!(mixed[..1920].iter().all(|s| *s == 1000));
    assert!(mixed[1920..].iter().all(|s| *s == 2000));
    Ok(())
}

#[test]
fn test_sum_saturates() -> anyhow::Result<()> {
    let mut mixer = mixer(&["A", "B"]);
    mixer.queue("A", &pcm(4, 2, i16::MAX), 0, 1.0)?;
    mixer.queue("B", &pcm(4, 2, i16::MAX), 0, 1.0)?;
    let mixed = samples(&mixer.mix(4, false).unwrap());
    assert!(mixed.iter().all(|s| *s == i16::MAX));
    Ok(())
}

#[test]
fn test_flush_drains_ragged_inputs() -> anyhow::Result<()> {
    let mut mixer = mixer(&["A", "B"]);
    mixer.queue("A", &pcm(100, 2, 1000), 0, 1.0)?;
    mixer.queue("B", &pcm(40, 2, 1000), 0, 1.0)?;
    assert_eq!(mixer.available_frames(false), 40);
    assert_eq!(mixer.available_frames(true), 100);

    let mixed = samples(&mixer.mix(1000, true).unwrap());
    assert_eq!(mixed.len(), 200);
    assert!(mixed[..80].iter().all(|s| *s == 2000));
    assert!(mixed[80..].iter().all(|s| *s == 1000));
    assert_eq!(mixer.available_frames(true), 0);
    Ok(())
}

#[test]
fn test_segment_reconfiguration_keeps_remaining_inputs() -> anyhow::Result<()> {
    let mut mixer = mixer(&["A", "B"]);
    mixer.queue("A", &pcm(100, 2, 1000), 0, 1.0)?;
    mixer.end_input("A");
    mixer.end_input("B");

    mixer.configure_segment(&["A".to_string(), "C".to_string()]);
    // C has delivered nothing yet
    assert_eq!(mixer.available_frames(false), 0);
    mixer.end_input("C");
    assert_eq!(mixer.available_frames(false), 100);

    let err = mixer.queue("B", &pcm(1, 2, 1), 0, 1.0).unwrap_err();
    assert_eq!(TranscodeError::classify(&err), ErrorKind::Configuration);
    Ok(())
}
