//! Stream connection runtime.
//!
//! Workers own a mio poll each and accept on every configured listening
//! port (SO_REUSEPORT lets the kernel spread connections between them).
//! Accepted sockets go through the session state machine in `connection`:
//! - `addr`: address tables and virtual server selection
//! - `phase`: connection limiting and access control hooks
//! - `transport`: plain and TLS streams
//! - `reactor`: re-arming, timers and posted events
//! - `session` / `buffer`: per-session state and the receive buffer

pub mod addr;
pub mod buffer;
pub mod connection;
pub mod event_loop;
pub mod handler;
pub mod phase;
pub mod reactor;
pub mod server;
pub mod session;
pub mod stats;
pub mod tls;
pub mod transport;

#[cfg(test)]
mod testing;

use crate::runtime::addr::ListeningPort;
use crate::runtime::event_loop::{Worker, WorkerSettings};
use crate::runtime::handler::LogHandler;
use crate::runtime::stats::ConnStats;
use std::io;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

/// Run `workers` event loops over `ports` until they all exit.
pub fn run(ports: Vec<Arc<ListeningPort>>, workers: usize, settings: WorkerSettings) -> io::Result<()> {
    let num_workers = if workers == 0 { num_cpus() } else { workers };
    let stats = Arc::new(ConnStats::new());

    info!(
        workers = num_workers,
        ports = ports.len(),
        max_connections = settings.max_connections,
        "Starting runtime"
    );

    let ports = Arc::new(ports);
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let ports = Arc::clone(&ports);
        let settings = settings.clone();
        let stats = Arc::clone(&stats);

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                let result = Worker::new(worker_id, &ports, &settings, stats, LogHandler)
                    .and_then(|mut worker| worker.run());
                if let Err(e) = result {
                    error!(worker = worker_id, error = %e, "Worker failed");
                }
            })?;

        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    let snapshot = stats.snapshot();
    info!(
        accepted = snapshot.accepted,
        handled = snapshot.handled,
        active = snapshot.active,
        reading = snapshot.reading,
        "Runtime stopped"
    );

    Ok(())
}

fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
