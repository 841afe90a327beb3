use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Runs a task on a fixed interval until shut down.
///
/// - The first run happens immediately
/// - A failing run is logged and the schedule continues
/// - Shutdown interrupts the wait between runs, never a run in progress
#[derive(Debug)]
pub struct PeriodicWorker;

impl PeriodicWorker {
    pub fn spawn<H, E>(name: impl Into<String>, interval: Duration, mut task: H) -> io::Result<WorkerHandle>
    where
        H: FnMut() -> Result<(), E> + Send + 'static,
        E: core::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread_name = name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&thread_name, interval, shutdown_rx, &mut task))?;

        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop<H, E>(name: &str, interval: Duration, shutdown_rx: mpsc::Receiver<()>, task: &mut H)
where
    H: FnMut() -> Result<(), E>,
    E: core::fmt::Display,
{
    info!(worker = name, interval_ms = interval.as_millis() as u64, "periodic worker started");

    loop {
        match task() {
            Ok(()) => debug!(worker = name, "periodic run finished"),
            Err(err) => warn!(worker = name, error = %err, "periodic run failed"),
        }

        match shutdown_rx.recv_timeout(interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
        }
    }

    info!(worker = name, "periodic worker stopped");
}
