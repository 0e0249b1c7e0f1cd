use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use timeline_transcoder::media::{BufferInfo, OutputStatus};

/// Output side of the buffer-indexed codec protocol: produced buffers wait
/// in order, dequeued ones stay addressable until released.
#[derive(Default)]
pub struct OutputQueue {
    ready: VecDeque<(Bytes, BufferInfo)>,
    dequeued: HashMap<usize, (Bytes, BufferInfo)>,
    next_index: usize,
}

impl OutputQueue {
    pub fn push(&mut self, data: Bytes, info: BufferInfo) {
        self.ready.push_back((data, info));
    }

    pub fn push_end_of_stream(&mut self, pts_us: i64) {
        self.ready
            .push_back((Bytes::new(), BufferInfo::end_of_stream(pts_us)));
    }

    /// Buffers produced but not yet released.
    pub fn in_flight(&self) -> usize {
        self.ready.len() + self.dequeued.len()
    }

    pub fn dequeue(&mut self) -> OutputStatus {
        let Some((data, info)) = self.ready.pop_front() else {
            return OutputStatus::TryAgainLater;
        };
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        self.dequeued.insert(index, (data, info));
        OutputStatus::Buffer { index, info }
    }

    pub fn get(&self, index: usize) -> anyhow::Result<Bytes> {
        self.dequeued
            .get(&index)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| anyhow::anyhow!("output buffer {} is not dequeued", index))
    }

    pub fn release(&mut self, index: usize) -> anyhow::Result<()> {
        self.dequeued
            .remove(&index)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("output buffer {} released twice", index))
    }

    pub fn clear(&mut self) {
        self.ready.clear();
        self.dequeued.clear();
    }
}
