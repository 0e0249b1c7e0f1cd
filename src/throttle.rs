//! Cross-channel decode pacing.
//!
//! Every active decoder slot reports the timestamp of the last sample it
//! decoded. The slowest position across all participants is the sync time;
//! a slot may only consume samples up to sync time plus its kind's lead.
//! The slot at the low-water mark can always proceed, so the pacing can
//! never stall every participant at once.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::config::EngineConfig;
use crate::media::TrackKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub kind: TrackKind,
    pub channel: String,
}

impl ChannelKey {
    pub fn new(kind: TrackKind, channel: &str) -> Self {
        Self {
            kind,
            channel: channel.to_string(),
        }
    }
}

impl Display for ChannelKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.channel)
    }
}

#[derive(Debug, Clone)]
pub struct TranscodeThrottle {
    positions: BTreeMap<ChannelKey, i64>,
    sync_time_us: i64,
    video_lead_us: i64,
    audio_lead_us: i64,
}

impl Default for TranscodeThrottle {
    fn default() -> Self {
        Self::new(EngineConfig::global())
    }
}

impl TranscodeThrottle {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            positions: BTreeMap::new(),
            sync_time_us: i64::MAX,
            video_lead_us: config.video_lead_time_us.max(0),
            audio_lead_us: config.audio_lead_time_us.max(0),
        }
    }

    /// Registers `key` at `start_us`, the first input time it will decode.
    pub fn participate(&mut self, key: ChannelKey, start_us: i64) {
        self.positions.insert(key, start_us);
    }

    pub fn remove(&mut self, key: &ChannelKey) {
        self.positions.remove(key);
    }

    pub fn is_participating(&self, key: &ChannelKey) -> bool {
        self.positions.contains_key(key)
    }

    /// Records that `key` has reached `pts_us`, whether the sample was
    /// consumed or held back.
    pub fn report(&mut self, key: &ChannelKey, pts_us: i64) {
        if let Some(position) = self.positions.get_mut(key) {
            *position = pts_us;
        }
    }

    /// Low-water mark of the participants of `kind`, `None` if there are none.
    pub fn progress_us(&self, kind: TrackKind) -> Option<i64> {
        self.positions
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .map(|(_, position)| *position)
            .min()
    }

    /// Snapshots the sync time used by the coming coordinator step.
    pub fn begin_step(&mut self) {
        self.sync_time_us = self.positions.values().copied().min().unwrap_or(i64::MAX);
    }

    pub fn sync_time_us(&self) -> i64 {
        self.sync_time_us
    }

    pub fn lead_time_us(&self, kind: TrackKind) -> i64 {
        match kind {
            TrackKind::Video => self.video_lead_us,
            TrackKind::Audio => self.audio_lead_us,
        }
    }

    /// Whether `key` may consume a sample stamped `pts_us` in this step.
    pub fn can_proceed(&self, key: &ChannelKey, pts_us: i64) -> bool {
        if !self.is_participating(key) {
            return true;
        }
        pts_us <= self.sync_time_us.saturating_add(self.lead_time_us(key.kind))
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.sync_time_us = i64::MAX;
    }
}

#[cfg(test)]
#[path = "throttle_test.rs"]
mod throttle_test;
