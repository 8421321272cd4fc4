//! The merging side of the pipeline.
//!
//! A single consumer applies a per-interval barrier across workers:
//! an interval's plugin outputs merge only once every worker has ended
//! that interval. Pending intervals are kept oldest-first; because every
//! worker ends intervals in ascending order, only the head of the list
//! can ever complete.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::msg::{ControlMessage, PublishedResult};
use tracemill_plugin::{ArtifactSet, FinishedInterval, MergeSet};

/// What the caller should do after feeding a message to the merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Continue,
    /// Every worker has sent STOP; the capture should halt.
    StopCapture,
}

struct PendingInterval {
    interval_id: u32,
    timestamp: u32,
    threads_ended: u32,
    rotate_after: bool,
    worker_artifacts: Vec<ArtifactSet>,
}

pub struct Merger {
    worker_count: usize,
    stops_seen: u32,
    next_rotate_interval: u32,
    pending: VecDeque<PendingInterval>,
    merge_set: MergeSet,
}

impl Merger {
    pub fn new(worker_count: usize, merge_set: MergeSet) -> Self {
        Self {
            worker_count,
            stops_seen: 0,
            next_rotate_interval: 0,
            pending: VecDeque::new(),
            merge_set,
        }
    }

    /// Number of intervals still waiting on the barrier.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn handle(&mut self, result: PublishedResult) -> MergeOutcome {
        match result.message {
            ControlMessage::Stop => {
                self.stops_seen += 1;
                debug!(
                    "worker {} stopped ({}/{})",
                    result.worker_id, self.stops_seen, self.worker_count
                );
                if self.stops_seen == self.worker_count as u32 {
                    return MergeOutcome::StopCapture;
                }
            }
            ControlMessage::FileRotate { interval, .. } => {
                self.handle_rotate(interval);
            }
            ControlMessage::IntervalEnd {
                interval,
                timestamp,
                artifacts,
            } => {
                self.handle_interval_end(interval, timestamp, artifacts);
            }
        }
        MergeOutcome::Continue
    }

    fn handle_rotate(&mut self, interval: u32) {
        if self.pending.is_empty() && self.next_rotate_interval <= interval {
            self.merge_set.rotate_output();
            self.next_rotate_interval = interval + 1;
            return;
        }

        let Some(record) = self
            .pending
            .iter_mut()
            .find(|p| p.interval_id == interval)
        else {
            // Trailing rotation markers at end-of-input routinely name
            // an interval whose barrier already completed (or that this
            // worker never merged); anything earlier in the stream is a
            // protocol anomaly worth hearing about.
            if self.next_rotate_interval <= interval {
                warn!("rotation requested for interval {interval} with no pending record");
            }
            return;
        };
        record.rotate_after = true;
    }

    fn handle_interval_end(&mut self, interval: u32, timestamp: u32, artifacts: ArtifactSet) {
        if self.worker_count == 1 {
            // Sole worker: the barrier is trivially complete, skip the
            // pending-list bookkeeping entirely.
            self.merge_set.merge(FinishedInterval {
                interval_id: interval,
                timestamp,
                worker_artifacts: vec![artifacts],
            });
            return;
        }

        let Some(position) = self
            .pending
            .iter()
            .position(|p| p.interval_id == interval)
        else {
            let mut worker_artifacts = Vec::with_capacity(self.worker_count);
            worker_artifacts.push(artifacts);
            self.pending.push_back(PendingInterval {
                interval_id: interval,
                timestamp,
                threads_ended: 1,
                rotate_after: false,
                worker_artifacts,
            });
            return;
        };

        let record = &mut self.pending[position];
        record.worker_artifacts.push(artifacts);
        record.threads_ended += 1;

        if record.threads_ended == self.worker_count as u32 {
            // Workers end intervals in ascending order, so a completing
            // record behind the head means an interval was lost.
            assert_eq!(
                position, 0,
                "completed interval {interval} is not at the head of the pending list"
            );
            if let Some(record) = self.pending.pop_front() {
                let rotate_after = record.rotate_after;
                self.merge_set.merge(FinishedInterval {
                    interval_id: record.interval_id,
                    timestamp: record.timestamp,
                    worker_artifacts: record.worker_artifacts,
                });
                if rotate_after {
                    self.merge_set.rotate_output();
                    self.next_rotate_interval = interval + 1;
                }
            }
        }
    }

    /// End of source: merge whatever is still pending, in order, then
    /// stop the merging plugins.
    pub fn finish(mut self) {
        if !self.pending.is_empty() {
            info!(
                "merging {} intervals still pending at shutdown",
                self.pending.len()
            );
        }
        while let Some(record) = self.pending.pop_front() {
            self.merge_set.merge(FinishedInterval {
                interval_id: record.interval_id,
                timestamp: record.timestamp,
                worker_artifacts: record.worker_artifacts,
            });
        }
        if let Err(e) = self.merge_set.stop() {
            tracing::error!("error while stopping merging plugins: {e}");
        }
    }
}
