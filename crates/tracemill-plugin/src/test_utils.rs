//! Recording plugin implementations for exercising the worker and merger
//! state machines in tests.

use std::sync::{Arc, Mutex};

use crate::error::PluginError;
use crate::packet::{Packet, PacketTags};
use crate::set::{AnalysisPlugin, Artifact, ArtifactSet, MergingPlugin};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEvent {
    IntervalStart {
        worker: usize,
        number: u32,
        start_time: u32,
    },
    Packet {
        worker: usize,
        ts: u32,
        tagged: bool,
    },
    IntervalEnd {
        worker: usize,
        number: u32,
        end_time: u32,
    },
    WorkerStop {
        worker: usize,
    },
    Merge {
        interval: u32,
        timestamp: u32,
        workers: usize,
    },
    Rotate,
    MergeStop,
}

/// Shared event log written by [`RecordingPlugin`] and [`RecordingMerger`].
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<PluginEvent>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: PluginEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<PluginEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn merges(&self) -> Vec<PluginEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, PluginEvent::Merge { .. }))
            .collect()
    }

    pub fn rotations(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, PluginEvent::Rotate))
            .count()
    }
}

/// Artifact produced by [`RecordingPlugin`]: which worker closed the
/// interval and how many packets it saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountArtifact {
    pub worker: usize,
    pub interval: u32,
    pub packets: u64,
}

/// Worker-side plugin that logs every lifecycle call. Optionally fails
/// `interval_end` for one interval number, to exercise the suppressed
/// publication path.
pub struct RecordingPlugin {
    worker_id: usize,
    recorder: Recorder,
    packets: u64,
    fail_interval_end: Option<u32>,
}

impl RecordingPlugin {
    pub fn new(worker_id: usize, recorder: Recorder) -> Self {
        Self {
            worker_id,
            recorder,
            packets: 0,
            fail_interval_end: None,
        }
    }

    pub fn failing_interval(worker_id: usize, recorder: Recorder, interval: u32) -> Self {
        Self {
            worker_id,
            recorder,
            packets: 0,
            fail_interval_end: Some(interval),
        }
    }
}

impl AnalysisPlugin for RecordingPlugin {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn interval_start(&mut self, number: u32, start_time: u32) {
        self.recorder.record(PluginEvent::IntervalStart {
            worker: self.worker_id,
            number,
            start_time,
        });
    }

    fn process_packet(&mut self, packet: &Packet, tags: Option<&PacketTags>) {
        self.packets += 1;
        self.recorder.record(PluginEvent::Packet {
            worker: self.worker_id,
            ts: packet.ts_sec,
            tagged: tags.is_some(),
        });
    }

    fn interval_end(&mut self, number: u32, end_time: u32) -> Result<Artifact, PluginError> {
        if self.fail_interval_end == Some(number) {
            return Err(PluginError::NoPlugins);
        }
        self.recorder.record(PluginEvent::IntervalEnd {
            worker: self.worker_id,
            number,
            end_time,
        });
        let artifact = CountArtifact {
            worker: self.worker_id,
            interval: number,
            packets: std::mem::take(&mut self.packets),
        };
        Ok(Box::new(artifact))
    }

    fn stop(&mut self) -> Result<(), PluginError> {
        self.recorder.record(PluginEvent::WorkerStop {
            worker: self.worker_id,
        });
        Ok(())
    }
}

/// Merger-side counterpart of [`RecordingPlugin`].
pub struct RecordingMerger {
    recorder: Recorder,
}

impl RecordingMerger {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl MergingPlugin for RecordingMerger {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn merge(
        &mut self,
        interval_id: u32,
        timestamp: u32,
        artifacts: ArtifactSet,
    ) -> Result<(), PluginError> {
        self.recorder.record(PluginEvent::Merge {
            interval: interval_id,
            timestamp,
            workers: artifacts.len(),
        });
        Ok(())
    }

    fn rotate_output(&mut self) -> Result<(), PluginError> {
        self.recorder.record(PluginEvent::Rotate);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PluginError> {
        self.recorder.record(PluginEvent::MergeStop);
        Ok(())
    }
}
