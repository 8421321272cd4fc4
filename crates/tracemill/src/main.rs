//!
//! # Operating Model
//!
//! - **Per-source topology**: for each configured input, one pump thread
//!   reads packets and dispatches them to `worker_count` worker threads
//!   by bidirectional flow hash, so both directions of a flow are
//!   analyzed by the same worker.
//!
//! - **Interval alignment**: every worker runs its own interval state
//!   machine against wall-clock-aligned boundaries derived from packet
//!   timestamps; idle workers are nudged forward by real-time ticks.
//!
//! - **Single merger**: one thread consumes the workers' interval
//!   results, barriers them per interval, and drives the merging plugin
//!   instances and output rotation.
//!
//! - **Sequential sources**: the supervisor runs sources one after
//!   another, carrying worker-local plugin state across the boundary so
//!   a multi-file capture behaves like one long run.
//!

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use tracemill::args::Args;
use tracemill::config::Config;
use tracemill::shutdown::ShutdownToken;
use tracemill::{logging, supervisor};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // covers --help as well: usage always exits with status 1
            let _ = err.print();
            return 1;
        }
    };

    if let Err(e) = logging::init(args.log_mode) {
        eprintln!("tracemill: unable to initialize logging: {e}");
        return 1;
    }

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };

    ignore_sigpipe();

    let shutdown = Arc::new(ShutdownToken::new());
    let handler_token = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal, halting after the current source");
        handler_token.request_halt();
    }) {
        error!("unable to install the signal handler: {e}");
        return 1;
    }

    match supervisor::run(config, &shutdown) {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            1
        }
    }
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
