//! Per-thread packet processing and the interval state machine.
//!
//! Each worker owns one plugin instance set and drives it through the
//! interval lifecycle: start-of-interval, packets, end-of-interval. At
//! every interval close the worker publishes its plugin artifacts to the
//! merger; the merger's barrier reassembles them across workers.

use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::filters::CustomFilters;
use crate::interval::{Interval, interval_floor};
use crate::msg::{ControlMessage, PublishedResult, publication_key};
use crate::tagging::PacketTagger;
use tracemill_plugin::{Packet, PluginSet};

pub struct WorkerState {
    worker_id: usize,
    config: Arc<Config>,
    results: Option<Sender<PublishedResult>>,
    plugins: Option<PluginSet>,
    current_interval: Interval,
    next_report: u32,
    last_ts: u32,
    pkts_outstanding: u64,
    pkts_since_tick: u64,
    stopped: bool,
    tagger: Option<PacketTagger>,
    filters: CustomFilters,
}

impl WorkerState {
    /// Allocate worker-local state: plugin instances, the filter tree,
    /// and the tagger. A plugin start failure is logged and the worker
    /// runs without plugin output.
    pub fn start(worker_id: usize, config: Arc<Config>, results: Sender<PublishedResult>) -> Self {
        let plugins = match PluginSet::start(&config.active_plugins, worker_id) {
            Ok(set) => Some(set),
            Err(e) => {
                error!("worker {worker_id}: error while starting plugins: {e}");
                None
            }
        };

        let filters = CustomFilters::new(config.tree_filter_name.as_deref());
        let tagger = if config.tagging_enabled {
            Some(PacketTagger::new(
                &config.pfx2as,
                &config.maxmind,
                &config.netacq,
            ))
        } else {
            None
        };

        Self {
            worker_id,
            config,
            results: Some(results),
            plugins,
            current_interval: Interval::default(),
            next_report: 0,
            last_ts: 0,
            pkts_outstanding: 0,
            pkts_since_tick: 0,
            stopped: false,
            tagger,
            filters,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Attach the result channel of the next source to a preserved state.
    pub fn rebind(&mut self, results: Sender<PublishedResult>) {
        self.results = Some(results);
    }

    pub fn on_packet(&mut self, packet: &Packet) {
        if self.stopped {
            return;
        }

        let ts = packet.ts();

        if let Some(start) = self.config.bound_start_epoch {
            if ts < start {
                return;
            }
        }

        if let Some(end) = self.config.bound_end_epoch {
            if ts >= end {
                self.close_interval(end);
                self.publish_rotate(end);
                self.publish_stop(end);
                self.stopped = true;
                self.pkts_outstanding = 0;
                return;
            }
        }

        if self.current_interval.start_time == 0 {
            // first admitted packet pins interval 0 to a boundary
            let start = interval_floor(ts, self.config.interval_seconds);
            self.current_interval.start_time = start;
            if let Some(plugins) = &mut self.plugins {
                plugins.push_interval_start(self.current_interval.number, start);
            }
            self.next_report = start + self.config.interval_seconds;
        }

        if ts < self.current_interval.start_time {
            warn!(
                "worker {}: received a packet from before the current interval, skipping it",
                self.worker_id
            );
            return;
        }

        // a quiet stretch can leave several whole intervals behind us
        while self.next_report != 0 && ts >= self.next_report {
            let close_time = self.next_report;
            self.close_interval(close_time);
            if self.rotation_due() {
                self.publish_rotate(close_time);
            }
            self.advance_interval();
        }

        if self.config.remove_spoofed && self.filters.spoofed(packet) {
            return;
        }
        if self.config.remove_erratic && self.filters.erratic(packet) {
            return;
        }
        if self.config.remove_unrouted && self.filters.unrouted(packet) {
            return;
        }

        self.pkts_outstanding += 1;
        self.pkts_since_tick += 1;
        self.last_ts = ts;

        match &self.tagger {
            Some(tagger) => match tagger.tag(packet) {
                Ok(tags) => {
                    if let Some(plugins) = &mut self.plugins {
                        plugins.push_packet(packet, Some(&tags));
                    }
                }
                Err(e) => {
                    error!(
                        "worker {}: error while attempting to tag a packet: {e}",
                        self.worker_id
                    );
                    if let Some(plugins) = &mut self.plugins {
                        plugins.push_packet(packet, None);
                    }
                }
            },
            None => {
                if let Some(plugins) = &mut self.plugins {
                    plugins.push_packet(packet, None);
                }
            }
        }
    }

    /// Real-time tick from the capture. A worker that saw no packets
    /// since the previous tick is idle and would stall the merger's
    /// barrier; force its interval to end so merging keeps moving.
    pub fn on_tick(&mut self) {
        if self.pkts_since_tick == 0 {
            let close_time = self.config.bound_end_epoch.unwrap_or(0);
            self.close_interval(close_time);
            if self.rotation_due() {
                self.publish_rotate(self.next_report);
            }
            self.advance_interval();
            info!(
                "worker {}: forced an interval to end within an idle processing thread",
                self.worker_id
            );
        }
        self.pkts_since_tick = 0;
    }

    /// Final-source teardown: flush the partial interval, stop plugins,
    /// and emit the trailing rotation marker.
    pub fn finish(mut self) {
        if self.pkts_outstanding > 0 {
            self.close_interval(self.last_ts);
        }

        if let Some(plugins) = &mut self.plugins {
            if let Err(e) = plugins.stop() {
                error!(
                    "worker {}: error while stopping plugins: {e}",
                    self.worker_id
                );
            }
        }

        if !self.stopped {
            self.publish_rotate(self.next_report);
        }

        info!("worker {}: shut down packet processing", self.worker_id);
    }

    /// Between sources: drop the source-specific channel and hand the
    /// state back to the supervisor; plugin instances and the interval
    /// machine carry over to the next source unchanged.
    pub fn suspend(&mut self) {
        self.results = None;
    }

    fn rotation_due(&self) -> bool {
        self.config.rotation_enabled()
            && (self.current_interval.number + 1) % self.config.rotate_every_n_intervals == 0
    }

    fn advance_interval(&mut self) {
        self.current_interval.number += 1;
        self.current_interval.start_time = self.next_report;
        if let Some(plugins) = &mut self.plugins {
            plugins.push_interval_start(self.current_interval.number, self.next_report);
        }
        self.next_report += self.config.interval_seconds;
        self.pkts_outstanding = 0;
    }

    /// Push end-of-interval to the plugins and publish the artifacts.
    /// When the push fails, no INTERVAL_END goes out for this closure.
    fn close_interval(&mut self, end_time: u32) {
        let artifacts = match &mut self.plugins {
            Some(plugins) => {
                match plugins.push_interval_end(self.current_interval.number, end_time) {
                    Ok(artifacts) => artifacts,
                    Err(e) => {
                        error!(
                            "worker {}: error while pushing end of interval to plugins: {e}",
                            self.worker_id
                        );
                        return;
                    }
                }
            }
            None => {
                error!(
                    "worker {}: no plugin instances to close interval {}",
                    self.worker_id, self.current_interval.number
                );
                return;
            }
        };

        self.publish(
            publication_key(end_time),
            ControlMessage::IntervalEnd {
                interval: self.current_interval.number,
                timestamp: self.current_interval.start_time,
                artifacts,
            },
        );
    }

    fn publish_rotate(&self, rotate_time: u32) {
        self.publish(
            publication_key(rotate_time),
            ControlMessage::FileRotate {
                interval: self.current_interval.number,
                timestamp: rotate_time.wrapping_sub(1),
            },
        );
    }

    fn publish_stop(&self, ts: u32) {
        self.publish(publication_key(ts), ControlMessage::Stop);
    }

    fn publish(&self, key: u64, message: ControlMessage) {
        let Some(results) = &self.results else {
            warn!("worker {}: no result channel attached", self.worker_id);
            return;
        };
        let result = PublishedResult {
            key,
            worker_id: self.worker_id,
            message,
        };
        if results.send(result).is_err() {
            warn!("worker {}: result channel closed", self.worker_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn with_plugin_set(
        worker_id: usize,
        config: Arc<Config>,
        results: Sender<PublishedResult>,
        plugins: Option<PluginSet>,
    ) -> Self {
        Self {
            worker_id,
            config,
            results: Some(results),
            plugins,
            current_interval: Interval::default(),
            next_report: 0,
            last_ts: 0,
            pkts_outstanding: 0,
            pkts_since_tick: 0,
            stopped: false,
            tagger: None,
            filters: CustomFilters::new(None),
        }
    }
}
