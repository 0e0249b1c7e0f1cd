use std::sync::Arc;

use super::*;
use crate::error::ErrorKind;
use crate::media::BufferFlags;
use crate::testing::{FakeStrategy, FakeWriter, SharedRecorder, WriterEvent};

fn muxer(recorder: &SharedRecorder, expected: &[TrackKind]) -> QueuedMuxer {
    QueuedMuxer::new(
        Box::new(FakeWriter::new(Arc::clone(recorder))),
        expected,
        &EngineConfig::default(),
        Telemetry::default(),
    )
}

fn sample(pts_us: i64, size: usize) -> (Vec<u8>, BufferInfo) {
    (vec![7; size], BufferInfo::new(size, pts_us, BufferFlags::KEY_FRAME))
}

#[test]
fn test_queues_until_every_format_is_known() -> anyhow::Result<()> {
    let recorder = SharedRecorder::default();
    let mut muxer = muxer(&recorder, &[TrackKind::Video, TrackKind::Audio]);

    let (data, info) = sample(0, 10);
    muxer.write_sample_data(TrackKind::Video, &data, &info)?;
    muxer.set_output_format(TrackKind::Video, &FakeStrategy::video_output())?;
    let (data, info) = sample(40_000, 12);
    muxer.write_sample_data(TrackKind::Video, &data, &info)?;
    assert!(!muxer.is_started());
    assert!(recorder.lock().unwrap().writer_events.is_empty());

    muxer.set_output_format(TrackKind::Audio, &FakeStrategy::audio_output())?;
    assert!(muxer.is_started());
    let (data, info) = sample(0, 4);
    muxer.write_sample_data(TrackKind::Audio, &data, &info)?;

    let recorder = recorder.lock().unwrap();
    assert_eq!(
        recorder.writer_events[..3],
        [
            WriterEvent::AddTrack(FakeStrategy::video_output()),
            WriterEvent::AddTrack(FakeStrategy::audio_output()),
            WriterEvent::Start,
        ]
    );
    assert_eq!(
        recorder.samples(0),
        vec![(0, 10, BufferFlags::KEY_FRAME), (40_000, 12, BufferFlags::KEY_FRAME)]
    );
    assert_eq!(recorder.samples(1), vec![(0, 4, BufferFlags::KEY_FRAME)]);
    Ok(())
}

#[test]
fn test_format_is_idempotent_but_not_replaceable() -> anyhow::Result<()> {
    let recorder = SharedRecorder::default();
    let mut muxer = muxer(&recorder, &[TrackKind::Video]);
    muxer.set_output_format(TrackKind::Video, &FakeStrategy::video_output())?;
    muxer.set_output_format(TrackKind::Video, &FakeStrategy::video_output())?;
    assert_eq!(recorder.lock().unwrap().count(&WriterEvent::Start), 1);

    let other = FakeStrategy::video_output().with_bit_rate(1);
    let err = muxer.set_output_format(TrackKind::Video, &other).unwrap_err();
    assert_eq!(TranscodeError::classify(&err), ErrorKind::Format);

    let err = muxer
        .set_output_format(TrackKind::Audio, &FakeStrategy::audio_output())
        .unwrap_err();
    assert_eq!(TranscodeError::classify(&err), ErrorKind::Format);
    Ok(())
}

#[test]
fn test_empty_samples_are_ignored() -> anyhow::Result<()> {
    let recorder = SharedRecorder::default();
    let mut muxer = muxer(&recorder, &[TrackKind::Audio]);
    muxer.set_output_format(TrackKind::Audio, &FakeStrategy::audio_output())?;
    muxer.write_sample_data(TrackKind::Audio, &[], &BufferInfo::end_of_stream(20_000))?;
    assert!(recorder.lock().unwrap().samples(0).is_empty());
    Ok(())
}

#[test]
fn test_queue_limit() {
    let recorder = SharedRecorder::default();
    let mut muxer = QueuedMuxer::new(
        Box::new(FakeWriter::new(Arc::clone(&recorder))),
        &[TrackKind::Video],
        &EngineConfig {
            muxer_queue_limit_bytes: 16,
            ..EngineConfig::default()
        },
        Telemetry::default(),
    );
    let (data, info) = sample(0, 10);
    muxer.write_sample_data(TrackKind::Video, &data, &info).unwrap();
    let err = muxer
        .write_sample_data(TrackKind::Video, &data, &info)
        .unwrap_err();
    assert_eq!(TranscodeError::classify(&err), ErrorKind::Resource);
}

#[test]
fn test_finish_stops_once() -> anyhow::Result<()> {
    let recorder = SharedRecorder::default();
    let mut muxer = muxer(&recorder, &[TrackKind::Video]);
    let err = muxer.finish().unwrap_err();
    assert_eq!(TranscodeError::classify(&err), ErrorKind::Format);

    muxer.set_orientation_hint(90)?;
    muxer.set_output_format(TrackKind::Video, &FakeStrategy::video_output())?;
    muxer.finish()?;
    muxer.finish()?;
    muxer.release()?;
    muxer.release()?;

    let recorder = recorder.lock().unwrap();
    assert_eq!(recorder.writer_events[0], WriterEvent::Orientation(90));
    assert_eq!(recorder.count(&WriterEvent::Stop), 1);
    assert_eq!(recorder.count(&WriterEvent::Release), 1);
    Ok(())
}

#[test]
fn test_validator_blocks_start() {
    let recorder = SharedRecorder::default();
    let mut muxer = muxer(&recorder, &[TrackKind::Video]).with_validator(Box::new(
        |video: Option<&MediaFormat>, _audio: Option<&MediaFormat>| -> anyhow::Result<()> {
            match video {
                Some(format) if format.width % 16 != 0 => Err(TranscodeError::Format(format!(
                    "width {} is not macroblock aligned",
                    format.width
                ))
                .into()),
                _ => Ok(()),
            }
        },
    ));

    let err = muxer
        .set_output_format(TrackKind::Video, &FakeStrategy::video_output())
        .unwrap_err();
    assert_eq!(TranscodeError::classify(&err), ErrorKind::Format);
    assert!(!muxer.is_started());
    assert_eq!(recorder.lock().unwrap().count(&WriterEvent::Start), 0);
}
