//! Launcher: owns the queues and the worker processes.
//!
//! Flow:
//! 1. Create both queues (the only process that does)
//! 2. Spawn the configured number of worker processes
//! 3. Wait for a shutdown request, logging workers that exit on their own
//! 4. SIGTERM every live worker, wait for them with a timeout
//! 5. Unlink the queues
//!
//! Workers that die are not restarted; requests they held are lost.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::task::JoinSet;

use crate::config::{Config, ENV_WORKER_INDEX};
use crate::queue::QueueSet;
use crate::shm::ShmError;

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("queue setup failed: {0}")]
    Queue(#[from] ShmError),

    #[error("failed to spawn worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),

    #[error("all {count} workers exited")]
    AllWorkersExited { count: usize },
}

/// Extension point for how worker processes are started.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, index: usize, config: &Config) -> io::Result<Child>;
}

/// Runs a program (by default this executable) with the worker subcommand,
/// passing the effective configuration through the environment.
#[derive(Debug, Clone)]
pub struct ExecSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ExecSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, vec!["worker".into()]))
    }
}

impl WorkerSpawner for ExecSpawner {
    fn spawn(&self, index: usize, config: &Config) -> io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(config.to_env())
            .env(ENV_WORKER_INDEX, index.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}

pub struct Supervisor {
    config: Config,
    spawner: Arc<dyn WorkerSpawner>,
    stop_timeout: Duration,
}

struct WorkerExit {
    index: usize,
    pid: Option<u32>,
    status: io::Result<ExitStatus>,
}

impl Supervisor {
    pub fn new(config: Config, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            config,
            spawner,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// How long to wait for workers after SIGTERM before killing them.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Create the queues, run the workers until `shutdown` resolves, then tear
    /// everything down. The queues are unlinked on every path after creation.
    pub async fn run<F>(self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        let queues = QueueSet::create(&self.config.queue)?;
        let names = queues.names().clone();

        let result = self.supervise(shutdown).await;

        drop(queues);
        let destroyed = QueueSet::destroy(&names);
        result?;
        destroyed?;
        tracing::info!("Supervisor stopped");
        Ok(())
    }

    async fn supervise<F>(&self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        let count = self.config.queue.workers;
        let mut workers = JoinSet::new();
        let mut pids = Vec::with_capacity(count);

        for index in 0..count {
            let mut child = match self.spawner.spawn(index, &self.config) {
                Ok(child) => child,
                Err(source) => {
                    tracing::error!(index, error = %source, "Failed to spawn worker");
                    terminate(&pids);
                    workers.shutdown().await;
                    return Err(SupervisorError::Spawn { index, source });
                }
            };
            let pid = child.id();
            tracing::info!(index, pid = ?pid, "Worker spawned");
            pids.push((index, pid));
            workers.spawn(async move {
                let status = child.wait().await;
                WorkerExit { index, pid, status }
            });
        }
        tracing::info!(num_workers = count, namespace = %self.config.queue.namespace, "Serving");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                exit = workers.join_next() => match exit {
                    Some(Ok(exit)) => {
                        log_unexpected_exit(&exit);
                        pids.retain(|(index, _)| *index != exit.index);
                    }
                    Some(Err(e)) => tracing::error!(error = %e, "Worker wait task failed"),
                    None => {
                        tracing::error!(count, "All workers exited");
                        return Err(SupervisorError::AllWorkersExited { count });
                    }
                },
            }
        }

        tracing::info!(live = pids.len(), "Stopping workers");
        terminate(&pids);
        let drained = tokio::time::timeout(self.stop_timeout, async {
            while let Some(exit) = workers.join_next().await {
                if let Ok(exit) = exit {
                    tracing::debug!(index = exit.index, pid = ?exit.pid, status = ?exit.status, "Worker stopped");
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(timeout = ?self.stop_timeout, "Workers did not stop in time, killing");
            workers.shutdown().await;
        }
        Ok(())
    }
}

fn log_unexpected_exit(exit: &WorkerExit) {
    match &exit.status {
        Ok(status) => {
            tracing::error!(index = exit.index, pid = ?exit.pid, %status, "Worker exited unexpectedly")
        }
        Err(e) => {
            tracing::error!(index = exit.index, pid = ?exit.pid, error = %e, "Failed to wait for worker")
        }
    }
}

fn terminate(pids: &[(usize, Option<u32>)]) {
    for &(index, pid) in pids {
        let Some(pid) = pid else { continue };
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => tracing::warn!(index, pid, error = %e, "Failed to signal worker"),
        }
    }
}

/// Resolves on the first SIGTERM or SIGINT. Handlers are installed before
/// this returns, so signals arriving before the future is polled are kept.
pub fn shutdown_signal() -> Result<impl Future<Output = ()>, SupervisorError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).map_err(SupervisorError::Signal)?;
    let mut interrupt = signal(SignalKind::interrupt()).map_err(SupervisorError::Signal)?;
    Ok(async move {
        tokio::select! {
            _ = terminate.recv() => tracing::info!("Received SIGTERM, shutting down..."),
            _ = interrupt.recv() => tracing::info!("Received SIGINT, shutting down..."),
        }
    })
}
