use std::sync::Arc;

use super::*;
use crate::error::{ErrorKind, TranscodeError};
use crate::media::Demuxer;
use crate::testing::{FakeDecoder, FakeFactory, FakeTrack};

fn factory() -> FakeFactory {
    FakeFactory::new()
        .with_source("a.mp4", vec![FakeTrack::video(25, 30, 10)])
        .with_source("b.mp4", vec![FakeTrack::video(25, 30, 10)])
        .with_source("c.mp4", vec![FakeTrack::video(25, 30, 10)])
}

fn slot(factory: &FakeFactory, channel: &str, source: &str) -> DecoderSlot<()> {
    let mut demuxer = factory.demuxer(source);
    demuxer.select_track(0).unwrap();
    let format = demuxer.track_format(0).unwrap();
    DecoderSlot::new(
        channel,
        TrackKind::Video,
        Box::new(demuxer),
        Box::new(FakeDecoder::new(TrackKind::Video, Arc::clone(&factory.recorder))),
        0,
        format,
        Telemetry::default(),
    )
}

fn next_buffer(slot: &mut DecoderSlot<()>) -> anyhow::Result<Option<(usize, BufferInfo)>> {
    loop {
        match slot.next_output()? {
            OutputStatus::Buffer { index, info } => return Ok(Some((index, info))),
            OutputStatus::TryAgainLater => return Ok(None),
            OutputStatus::FormatChanged | OutputStatus::BuffersChanged => continue,
        }
    }
}

// ------------------------------------------------------------------------
// DecoderSlot
// ------------------------------------------------------------------------

#[test]
fn test_idle_slot_does_nothing() -> anyhow::Result<()> {
    let factory = factory();
    let mut slot = slot(&factory, "A", "a.mp4");
    assert!(!slot.is_started());
    assert_eq!(slot.feed()?, FeedOutcome::Idle);
    assert_eq!(slot.next_output()?, OutputStatus::TryAgainLater);
    Ok(())
}

#[test]
fn test_feed_decode_and_hold() -> anyhow::Result<()> {
    let factory = factory();
    let mut slot = slot(&factory, "A", "a.mp4");
    slot.start(None)?;

    assert_eq!(slot.feed()?, FeedOutcome::Fed(0));
    assert_eq!(slot.next_output()?, OutputStatus::FormatChanged);
    let (index, info) = next_buffer(&mut slot)?.unwrap();
    assert_eq!(info.presentation_time_us, 0);
    assert!(info.flags.is_key_frame());

    slot.hold(index, info);
    assert!(slot.is_holding());
    assert_eq!(slot.next_output()?, OutputStatus::Buffer { index, info });
    assert!(!slot.is_holding());

    assert_eq!(slot.output_buffer(index)?.len(), 16);
    slot.release_output(index, true)?;
    assert_eq!(slot.next_output()?, OutputStatus::TryAgainLater);
    Ok(())
}

#[test]
fn test_decoder_reaches_end_of_stream() -> anyhow::Result<()> {
    let factory = factory();
    let mut slot = slot(&factory, "A", "a.mp4");
    slot.start(None)?;

    let mut decoded = Vec::new();
    let mut eos = false;
    for _ in 0..200 {
        if slot.feed()? == FeedOutcome::EndOfStream {
            assert!(slot.extractor_eos);
        }
        if let Some((index, info)) = next_buffer(&mut slot)? {
            slot.release_output(index, false)?;
            if info.is_end_of_stream() {
                eos = true;
                break;
            }
            decoded.push(info.presentation_time_us);
        }
    }

    assert!(eos);
    assert_eq!(decoded.len(), 30);
    assert!(decoded.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(slot.feed()?, FeedOutcome::Idle);
    Ok(())
}

#[test]
fn test_apply_seek_only_when_behind() -> anyhow::Result<()> {
    let factory = factory();
    let mut slot = slot(&factory, "A", "a.mp4");
    slot.start(None)?;

    assert!(slot.apply_seek(400_000)?);
    assert!(!slot.apply_seek(400_000)?);
    assert_eq!(slot.feed()?, FeedOutcome::Fed(400_000));

    let seeks = factory.recorder.lock().unwrap().seeks.clone();
    assert_eq!(seeks, vec![("a.mp4".to_string(), 400_000, SeekMode::PreviousKeyframe)]);
    Ok(())
}

#[test]
fn test_start_resumes_from_previous_keyframe() -> anyhow::Result<()> {
    let factory = factory();
    let mut slot = slot(&factory, "A", "a.mp4");
    slot.start(Some(1_000_000))?;
    // frame 25 is not a keyframe, frame 20 is
    assert_eq!(slot.feed()?, FeedOutcome::Fed(800_000));
    Ok(())
}

#[test]
fn test_release_returns_demuxer_and_closes_decoder() -> anyhow::Result<()> {
    let factory = factory();
    let mut slot = slot(&factory, "A", "a.mp4");
    slot.start(None)?;
    slot.feed()?;
    let (index, info) = next_buffer(&mut slot)?.unwrap();
    slot.hold(index, info);

    let (demuxer, result) = slot.release();
    result?;
    assert_eq!(demuxer.track_count(), 1);

    let recorder = factory.recorder.lock().unwrap();
    assert_eq!(recorder.open_decoders.get(&TrackKind::Video), Some(&0));
    assert_eq!(recorder.releases, vec!["decoder:video".to_string()]);
    Ok(())
}

// ------------------------------------------------------------------------
// SlotPool
// ------------------------------------------------------------------------

#[test]
fn test_pool_evicts_inactive_slot() -> anyhow::Result<()> {
    let factory = factory();
    let mut pool: SlotPool<()> = SlotPool::default();
    assert_eq!(pool.capacity(), MAX_DECODER_SLOTS);
    pool.insert(slot(&factory, "A", "a.mp4"))?;
    assert_eq!(pool.make_room(&["A".to_string()])?.map(|s| s.channel().to_string()), None);
    pool.insert(slot(&factory, "B", "b.mp4"))?;

    let err = pool.insert(slot(&factory, "C", "c.mp4")).unwrap_err();
    assert_eq!(TranscodeError::classify(&err), ErrorKind::Resource);

    let evicted = pool.make_room(&["B".to_string(), "C".to_string()])?.unwrap();
    assert_eq!(evicted.channel(), "A");
    assert!(!pool.contains("A"));
    pool.insert(slot(&factory, "C", "c.mp4"))?;
    assert_eq!(pool.len(), 2);
    Ok(())
}

#[test]
fn test_pool_full_of_active_slots() -> anyhow::Result<()> {
    let factory = factory();
    let mut pool: SlotPool<()> = SlotPool::default();
    pool.insert(slot(&factory, "A", "a.mp4"))?;
    pool.insert(slot(&factory, "B", "b.mp4"))?;

    let active = ["A".to_string(), "B".to_string(), "C".to_string()];
    let Err(err) = pool.make_room(&active) else {
        panic!("a pool of active slots has nothing to evict");
    };
    assert_eq!(TranscodeError::classify(&err), ErrorKind::Resource);
    assert_eq!(pool.drain().count(), 2);
    assert!(pool.is_empty());
    Ok(())
}
