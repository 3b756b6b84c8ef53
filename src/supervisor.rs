//! Master-mode worker supervision
//!
//! The master re-executes its own binary once per worker slot. A worker
//! that exits for any reason other than a requested shutdown is started
//! again after a short delay.

use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Flag passed to supervised children
pub const WORKER_FLAG: &str = "--worker";

const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

pub struct Supervisor {
    program: PathBuf,
    args: Vec<OsString>,
    workers: usize,
    restart_delay: Duration,
    grace_period: Duration,
    shutdown_tx: watch::Sender<bool>,
    pids: Mutex<Vec<Option<u32>>>,
    restarts: AtomicU64,
}

impl Supervisor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, workers: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            program: program.into(),
            args,
            workers,
            restart_delay: DEFAULT_RESTART_DELAY,
            grace_period: DEFAULT_GRACE_PERIOD,
            shutdown_tx,
            pids: Mutex::new(vec![None; workers]),
            restarts: AtomicU64::new(0),
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Supervise copies of the running binary in worker mode
    pub fn for_current_exe(
        config_path: impl Into<OsString>,
        workers: usize,
    ) -> anyhow::Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| anyhow::anyhow!("Failed to locate current executable: {}", e))?;
        Ok(Self::new(program, vec![WORKER_FLAG.into(), config_path.into()], workers))
    }

    /// Ask every worker to stop; `run` returns once they have
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Process ids of the running workers
    pub fn worker_pids(&self) -> Vec<u32> {
        self.pids.lock().iter().flatten().copied().collect()
    }

    /// Number of times a worker had to be restarted
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Start all workers and keep them running until `shutdown`
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        info!(
            workers = self.workers,
            program = %self.program.display(),
            "Supervisor starting workers"
        );

        let slots: Vec<_> = (0..self.workers)
            .map(|slot| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.supervise_slot(slot).await })
            })
            .collect();

        for handle in slots {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker slot task failed");
            }
        }

        info!("All workers stopped");
        Ok(())
    }

    async fn supervise_slot(&self, slot: usize) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while !*shutdown_rx.borrow() {
            let mut child = match self.spawn_worker() {
                Ok(child) => child,
                Err(e) => {
                    error!(slot, error = %e, "Failed to spawn worker");
                    if self.wait_or_shutdown(&mut shutdown_rx, self.restart_delay).await {
                        break;
                    }
                    continue;
                }
            };

            let pid = child.id();
            self.pids.lock()[slot] = pid;
            info!(slot, pid = pid.unwrap_or(0), "Worker started");

            tokio::select! {
                status = child.wait() => {
                    self.pids.lock()[slot] = None;
                    match status {
                        Ok(status) => warn!(slot, ?status, "Worker exited, restarting"),
                        Err(e) => warn!(slot, error = %e, "Failed to wait for worker, restarting"),
                    }
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                    if self.wait_or_shutdown(&mut shutdown_rx, self.restart_delay).await {
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    self.stop_worker(slot, &mut child).await;
                    self.pids.lock()[slot] = None;
                    break;
                }
            }
        }
    }

    /// Sleep for `delay`; returns true if shutdown was requested meanwhile
    async fn wait_or_shutdown(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
        delay: Duration,
    ) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => *shutdown_rx.borrow(),
            _ = shutdown_rx.changed() => true,
        }
    }

    fn spawn_worker(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd.spawn()
    }

    async fn stop_worker(&self, slot: usize, child: &mut Child) {
        if let Some(pid) = child.id() {
            info!(slot, pid, "Sending SIGTERM to worker");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => info!(slot, ?status, "Worker exited"),
            Ok(Err(e)) => warn!(slot, error = %e, "Error waiting for worker to exit"),
            Err(_) => {
                warn!(
                    slot,
                    grace_period_secs = self.grace_period.as_secs(),
                    "Grace period exceeded, killing worker"
                );
                let _ = child.kill().await;
            }
        }
    }
}
