//! The capture runtime: fan-out from one packet source to the worker
//! pool, fan-in from the workers to the merger.
//!
//! Threads per source: one pump reading the source and dispatching by
//! flow hash, one ticker broadcasting real-time ticks, `worker_count`
//! workers, and one merger consuming the result channel. Teardown is
//! driven by channel disconnection: when the pump and ticker drop their
//! event senders the workers drain and finish, and when the last worker
//! drops its result sender the merger drains, stops its plugins, and
//! signals the supervisor.

use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Relaxed, Release};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::filters::{BpfFilter, FilterError};
use crate::hasher::FlowHasher;
use crate::merge::{MergeOutcome, Merger};
use crate::msg::PublishedResult;
use crate::shutdown::ShutdownToken;
use crate::source::PacketSource;
use crate::worker::WorkerState;
use tracemill_plugin::{MergeSet, Packet};

// Per-worker event queue depth; the pump blocks when a worker falls
// this far behind.
const EVENT_QUEUE_DEPTH: usize = 1024;

// How often the ticker wakes to notice shutdown.
const TICKER_SLICE: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("invalid filter expression: {0}")]
    Filter(#[from] FilterError),

    #[error("failed to spawn thread: {0}")]
    Spawn(io::Error),
}

enum WorkerEvent {
    Packet(Packet),
    Tick,
}

#[derive(Default)]
struct ControlInner {
    stop: AtomicBool,
    pump_done: AtomicBool,
    finished: AtomicBool,
}

/// Shared handle for stopping the pump and observing its fate.
#[derive(Clone, Default)]
pub struct CaptureControl(Arc<ControlInner>);

impl CaptureControl {
    pub fn request_stop(&self) {
        self.0.stop.store(true, Release);
    }

    fn stop_requested(&self) -> bool {
        self.0.stop.load(Relaxed)
    }

    fn mark_pump_done(&self) {
        self.0.pump_done.store(true, Release);
    }

    fn pump_done(&self) -> bool {
        self.0.pump_done.load(Relaxed)
    }

    fn mark_finished(&self) {
        self.0.finished.store(true, Release);
    }

    /// True when the source ran dry on its own rather than being stopped.
    pub fn has_finished(&self) -> bool {
        self.0.finished.load(Relaxed)
    }
}

/// End-of-source accounting, logged by the supervisor.
#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureStats {
    pub accepted: u64,
    pub filtered: u64,
    pub dropped: Option<u64>,
    pub missing: Option<u64>,
}

pub struct RunningCapture {
    control: CaptureControl,
    pump: JoinHandle<CaptureStats>,
    ticker: JoinHandle<()>,
    workers: Vec<JoinHandle<Option<WorkerState>>>,
    merger: JoinHandle<()>,
}

impl RunningCapture {
    pub fn request_stop(&self) {
        self.control.request_stop();
    }

    pub fn has_finished(&self) -> bool {
        self.control.has_finished()
    }

    /// Block until every thread is gone. Returns the preserved worker
    /// states (all `None` after a final source) and the source stats.
    pub fn join(self) -> (Vec<Option<WorkerState>>, CaptureStats) {
        let stats = self.pump.join().unwrap();
        self.ticker.join().unwrap();
        let states = self
            .workers
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        self.merger.join().unwrap();
        (states, stats)
    }
}

/// Wire up and start the full topology for one source. Preserved worker
/// states are taken from `saved` slots and rebound; empty slots start
/// fresh workers.
pub fn start(
    source: Box<dyn PacketSource>,
    config: Arc<Config>,
    shutdown: Arc<ShutdownToken>,
    saved: &mut [Option<WorkerState>],
    last_source: bool,
) -> Result<RunningCapture, CaptureError> {
    let worker_count = config.worker_count;
    debug_assert_eq!(saved.len(), worker_count);
    let bpf = config
        .bpf_expression
        .as_deref()
        .map(BpfFilter::parse)
        .transpose()?;

    let control = CaptureControl::default();
    let (results_tx, results_rx) = unbounded::<PublishedResult>();

    let mut event_txs: Vec<Sender<WorkerEvent>> = Vec::with_capacity(worker_count);
    let mut workers = Vec::with_capacity(worker_count);

    for (worker_id, slot) in saved.iter_mut().enumerate().take(worker_count) {
        let (event_tx, event_rx) = bounded(EVENT_QUEUE_DEPTH);
        event_txs.push(event_tx);

        let preserved = slot.take();
        let results = results_tx.clone();
        let config = Arc::clone(&config);

        let handle = std::thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || worker_task(worker_id, preserved, config, results, event_rx, last_source))
            .map_err(CaptureError::Spawn)?;
        workers.push(handle);
    }
    // workers hold the only result senders; the channel disconnects
    // when the last worker finishes
    drop(results_tx);

    let merger = {
        let control = control.clone();
        let shutdown = Arc::clone(&shutdown);
        let config = Arc::clone(&config);
        std::thread::Builder::new()
            .name("merger".to_string())
            .spawn(move || merger_task(config, worker_count, results_rx, control, shutdown))
            .map_err(CaptureError::Spawn)?
    };

    let ticker = {
        let control = control.clone();
        let event_txs = event_txs.clone();
        let tick_interval = Duration::from_secs(u64::from(config.interval_seconds));
        std::thread::Builder::new()
            .name("ticker".to_string())
            .spawn(move || ticker_task(tick_interval, event_txs, control))
            .map_err(CaptureError::Spawn)?
    };

    let pump = {
        let control = control.clone();
        let hasher = FlowHasher::new(worker_count);
        std::thread::Builder::new()
            .name("pump".to_string())
            .spawn(move || pump_task(source, bpf, hasher, event_txs, control))
            .map_err(CaptureError::Spawn)?
    };

    info!("started capture with {worker_count} workers");

    Ok(RunningCapture {
        control,
        pump,
        ticker,
        workers,
        merger,
    })
}

fn worker_task(
    worker_id: usize,
    preserved: Option<WorkerState>,
    config: Arc<Config>,
    results: Sender<PublishedResult>,
    events: Receiver<WorkerEvent>,
    last_source: bool,
) -> Option<WorkerState> {
    let mut state = match preserved {
        Some(mut state) => {
            state.rebind(results);
            state
        }
        None => WorkerState::start(worker_id, config, results),
    };

    for event in events.iter() {
        match event {
            WorkerEvent::Packet(packet) => state.on_packet(&packet),
            WorkerEvent::Tick => state.on_tick(),
        }
    }

    if last_source {
        state.finish();
        None
    } else {
        state.suspend();
        Some(state)
    }
}

fn merger_task(
    config: Arc<Config>,
    worker_count: usize,
    results: Receiver<PublishedResult>,
    control: CaptureControl,
    shutdown: Arc<ShutdownToken>,
) {
    let merge_set = match MergeSet::start(&config.active_plugins, worker_count) {
        Ok(set) => set,
        Err(e) => {
            error!("error while starting merging plugins: {e}");
            MergeSet::from_plugins(Vec::new(), worker_count)
        }
    };

    let mut merger = Merger::new(worker_count, merge_set);
    for result in results.iter() {
        if merger.handle(result) == MergeOutcome::StopCapture {
            debug!("all workers stopped, halting the capture");
            control.request_stop();
        }
    }

    merger.finish();
    shutdown.signal_source_halted();
}

fn ticker_task(
    tick_interval: Duration,
    event_txs: Vec<Sender<WorkerEvent>>,
    control: CaptureControl,
) {
    'running: loop {
        let mut waited = Duration::ZERO;
        while waited < tick_interval {
            if control.pump_done() {
                break 'running;
            }
            let slice = TICKER_SLICE.min(tick_interval - waited);
            std::thread::sleep(slice);
            waited += slice;
        }
        for event_tx in &event_txs {
            // best effort: a full queue means the worker is not idle
            let _ = event_tx.try_send(WorkerEvent::Tick);
        }
    }
}

fn pump_task(
    mut source: Box<dyn PacketSource>,
    bpf: Option<BpfFilter>,
    hasher: FlowHasher,
    event_txs: Vec<Sender<WorkerEvent>>,
    control: CaptureControl,
) -> CaptureStats {
    let mut stats = CaptureStats::default();

    while !control.stop_requested() {
        match source.next_packet() {
            Ok(Some(packet)) => {
                if let Some(bpf) = &bpf {
                    if !bpf.matches(&packet) {
                        stats.filtered += 1;
                        continue;
                    }
                }
                let worker = hasher.assign(&packet);
                stats.accepted += 1;
                if event_txs[worker].send(WorkerEvent::Packet(packet)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                control.mark_finished();
                break;
            }
            Err(e) => {
                error!("error while reading from packet source: {e}");
                break;
            }
        }
    }

    let source_stats = source.stats();
    stats.dropped = source_stats.dropped;
    stats.missing = source_stats.missing;
    control.mark_pump_done();
    stats
}
