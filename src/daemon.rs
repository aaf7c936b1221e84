//! Periodic daemon execution.
//!
//! Each daemon runs on its own thread: one run, then a wait of its interval,
//! until the shared shutdown flag is raised. A run always completes its
//! sweep; the flag is only checked between runs and while waiting.

use crate::services::{DetectionScanner, ReconciliationProcessor, ResolutionEngine};
use crate::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Granularity of the shutdown check while waiting for the next run.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A periodic job.
pub trait Daemon: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Performs one run and returns its summary.
    ///
    /// # Errors
    ///
    /// Returns an error if the run could not proceed at all.
    fn run_once(&self) -> Result<String>;
}

impl Daemon for DetectionScanner {
    fn name(&self) -> &'static str {
        "detection"
    }

    fn run_once(&self) -> Result<String> {
        self.run().map(|report| report.summary())
    }
}

impl Daemon for ReconciliationProcessor {
    fn name(&self) -> &'static str {
        "reconciliation"
    }

    fn run_once(&self) -> Result<String> {
        self.run().map(|report| report.summary())
    }
}

impl Daemon for ResolutionEngine {
    fn name(&self) -> &'static str {
        "resolution"
    }

    fn run_once(&self) -> Result<String> {
        self.run().map(|report| report.summary())
    }
}

/// Runs daemons on dedicated threads until shutdown.
pub struct DaemonRunner {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for DaemonRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonRunner {
    /// Creates a runner with its own shutdown flag.
    #[must_use]
    pub fn new() -> Self {
        Self::with_shutdown(Arc::new(AtomicBool::new(false)))
    }

    /// Creates a runner observing an existing shutdown flag.
    #[must_use]
    pub const fn with_shutdown(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Flag that stops every daemon once set.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Requests shutdown.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Starts `daemon`, running it every `interval`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(&mut self, daemon: Arc<dyn Daemon>, interval: Duration) -> Result<()> {
        let shutdown = Arc::clone(&self.shutdown);
        let name = daemon.name();
        let handle = std::thread::Builder::new()
            .name(format!("daemon-{name}"))
            .spawn(move || run_loop(daemon.as_ref(), interval, &shutdown))
            .map_err(|e| crate::Error::operation("spawn_daemon", e))?;
        info!(daemon = name, interval_secs = interval.as_secs(), "Daemon started");
        self.handles.push(handle);
        Ok(())
    }

    /// Waits for every daemon thread to finish.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("Daemon thread panicked");
            }
        }
    }
}

fn run_loop(daemon: &dyn Daemon, interval: Duration, shutdown: &AtomicBool) {
    let name = daemon.name();
    while !shutdown.load(Ordering::SeqCst) {
        let start = Instant::now();
        match daemon.run_once() {
            Ok(summary) => info!(daemon = name, "{summary}"),
            Err(e) => {
                metrics::counter!("dedup_daemon_failures_total", "daemon" => name).increment(1);
                warn!(daemon = name, error = %e, "Daemon run failed");
            },
        }
        metrics::counter!("dedup_daemon_runs_total", "daemon" => name).increment(1);

        let next = start + interval;
        while !shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= next {
                break;
            }
            std::thread::sleep(POLL_INTERVAL.min(next - now));
        }
    }
    info!(daemon = name, "Daemon stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        runs: AtomicUsize,
        fail: bool,
    }

    impl Daemon for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn run_once(&self) -> Result<String> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(crate::Error::operation("run", "boom"));
            }
            Ok(format!("run {n}"))
        }
    }

    fn wait_for(daemon: &Counting, runs: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while daemon.runs.load(Ordering::SeqCst) < runs && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_runs_until_stopped() {
        let daemon = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let mut runner = DaemonRunner::new();
        runner
            .spawn(daemon.clone(), Duration::from_millis(1))
            .expect("spawn");

        wait_for(&daemon, 3);
        runner.stop();
        runner.join();
        assert!(daemon.runs.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_failed_run_does_not_stop_daemon() {
        let daemon = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        let mut runner = DaemonRunner::new();
        runner
            .spawn(daemon.clone(), Duration::from_millis(1))
            .expect("spawn");

        wait_for(&daemon, 2);
        runner.stop();
        runner.join();
        assert!(daemon.runs.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_long_interval_still_stops_promptly() {
        let daemon = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let mut runner = DaemonRunner::new();
        runner
            .spawn(daemon.clone(), Duration::from_secs(3600))
            .expect("spawn");

        wait_for(&daemon, 1);
        let start = Instant::now();
        runner.stop();
        runner.join();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(daemon.runs.load(Ordering::SeqCst), 1);
    }
}
