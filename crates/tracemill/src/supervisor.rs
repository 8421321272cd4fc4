//! The outer run loop: one capture topology per input source, run
//! sequentially, with worker-local state carried across sources.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

use crate::capture;
use crate::config::Config;
use crate::shutdown::ShutdownToken;
use crate::source::open_source;
use crate::worker::WorkerState;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("unable to adjust the signal mask: {0}")]
    SignalMask(io::Error),
}

/// Blocks all signals for the current thread; restores the previous
/// mask on drop. Threads spawned while the guard is alive inherit the
/// blocked mask, keeping signal delivery on the supervisor thread.
struct SignalMask {
    previous: libc::sigset_t,
}

impl SignalMask {
    fn block_all() -> io::Result<Self> {
        unsafe {
            let mut all: libc::sigset_t = std::mem::zeroed();
            libc::sigfillset(&mut all);
            let mut previous: libc::sigset_t = std::mem::zeroed();
            let rc = libc::pthread_sigmask(libc::SIG_SETMASK, &all, &mut previous);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(Self { previous })
        }
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut());
        }
    }
}

/// Run every configured source to completion, or until a halt is
/// requested. A source that fails to start is logged and skipped; it
/// never aborts the run.
pub fn run(config: Config, shutdown: &Arc<ShutdownToken>) -> Result<(), SupervisorError> {
    let config = Arc::new(config);
    let total = config.input_sources.len();
    let mut saved: Vec<Option<WorkerState>> = (0..config.worker_count).map(|_| None).collect();

    for (index, uri) in config.input_sources.iter().enumerate() {
        if shutdown.halt_requested() {
            break;
        }
        let last_source = index + 1 == total;
        shutdown.reset_source();

        let mask = SignalMask::block_all().map_err(SupervisorError::SignalMask)?;

        let source = match open_source(uri) {
            Ok(source) => source,
            Err(e) => {
                error!("failed to start packet source {uri}: {e}");
                continue;
            }
        };

        let running = match capture::start(
            source,
            Arc::clone(&config),
            Arc::clone(shutdown),
            &mut saved,
            last_source,
        ) {
            Ok(running) => running,
            Err(e) => {
                error!("failed to start capture for {uri}: {e}");
                continue;
            }
        };
        info!("successfully started input {uri}");

        drop(mask);

        while !shutdown.source_halted() {
            std::thread::sleep(Duration::from_secs(1));
        }

        if !running.has_finished() {
            running.request_stop();
        }

        let (states, stats) = running.join();

        match stats.dropped {
            Some(count) => info!("dropped packet count: {count}"),
            None => info!("dropped packet count: unknown"),
        }
        match stats.missing {
            Some(count) => info!("missing packet count: {count}"),
            None => info!("missing packet count: unknown"),
        }
        info!(
            "finished with input {uri}: {} packets dispatched, {} filtered",
            stats.accepted, stats.filtered
        );

        if !last_source {
            saved = states;
        }
    }

    info!("all threads have joined, exiting");
    Ok(())
}
