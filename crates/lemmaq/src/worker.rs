//! Worker loop: feeds queued requests through one analyzer subprocess.
//!
//! Flow:
//! 1. Attach to the queue pair, start the analyzer
//! 2. Claim any pending request, forward it, read the answer up to the sentinel
//! 3. Decode the answer and publish it under the request id
//! 4. Sleep on the shutdown latch with a growing timeout while idle
//!
//! Requests are handled strictly one at a time. A request claimed by a worker
//! that then dies is lost; its caller times out or waits forever.

use std::process::ExitStatus;
use std::time::{Duration, Instant};

use crate::analyzer::{Analyzer, AnalyzerError, Termination};
use crate::backoff::Backoff;
use crate::config::{QueueConfig, WorkerConfig};
use crate::decoder;
use crate::queue::QueueSet;
use crate::shm::ShmError;
use crate::shutdown::ShutdownLatch;

const ATTACH_ATTEMPTS: u32 = 50;
const ATTACH_RETRY_DELAY: Duration = Duration::from_millis(100);
const PUBLISH_BACKOFF_INITIAL: Duration = Duration::from_micros(50);
/// How long to wait for the analyzer to finish exiting after its stdout closed.
const EXIT_GRACE: Duration = Duration::from_millis(200);
/// Consecutive unterminated replies from a live analyzer before giving up on it.
const MAX_UNTERMINATED_REPLIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Draining,
    Terminated,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to attach to queues: {0}")]
    Attach(#[from] ShmError),

    #[error("failed to start analyzer: {0}")]
    Spawn(#[from] AnalyzerError),

    #[error("analyzer exited unexpectedly: {status}")]
    AnalyzerExited { status: ExitStatus },

    #[error("analyzer is running but returned {replies} unterminated replies in a row")]
    AnalyzerUnresponsive { replies: u32 },
}

/// Attach to the queues described by `queue` and serve requests until
/// `shutdown` is triggered.
pub fn run_worker(
    queue: &QueueConfig,
    config: &WorkerConfig,
    shutdown: &ShutdownLatch,
) -> Result<(), WorkerError> {
    tracing::info!(namespace = %queue.namespace, pid = std::process::id(), "Worker starting");
    let queues = QueueSet::attach_retrying(queue, ATTACH_ATTEMPTS, ATTACH_RETRY_DELAY)?;
    Worker::start(&queues, config, shutdown)?.run()
}

pub struct Worker<'a> {
    queues: &'a QueueSet,
    config: &'a WorkerConfig,
    shutdown: &'a ShutdownLatch,
    analyzer: Analyzer,
    state: WorkerState,
    handled: u64,
    unterminated: u32,
}

impl<'a> Worker<'a> {
    pub fn start(
        queues: &'a QueueSet,
        config: &'a WorkerConfig,
        shutdown: &'a ShutdownLatch,
    ) -> Result<Self, WorkerError> {
        let analyzer = Analyzer::spawn(&config.analyzer)?;
        Ok(Self {
            queues,
            config,
            shutdown,
            analyzer,
            state: WorkerState::Starting,
            handled: 0,
            unterminated: 0,
        })
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::debug!(from = ?self.state, to = ?next, "Worker state change");
        self.state = next;
    }

    pub fn run(mut self) -> Result<(), WorkerError> {
        self.transition(WorkerState::Running);
        tracing::info!(analyzer_pid = self.analyzer.pid(), "Worker ready");

        let idle_max = self.config.idle_wait_max.as_millis().max(1) as u64;
        let mut idle_ms = 0;

        while !self.shutdown.is_triggered() {
            match self.queues.dequeue_any_request() {
                Some((id, text)) => {
                    idle_ms = 0;
                    if let Err(e) = self.handle(id, &text) {
                        self.transition(WorkerState::Terminated);
                        return Err(e);
                    }
                }
                None => {
                    idle_ms = next_idle_wait(idle_ms, idle_max);
                    self.shutdown.wait_timeout(Duration::from_millis(idle_ms));
                }
            }
        }

        self.drain();
        Ok(())
    }

    fn handle(&mut self, id: u64, text: &str) -> Result<(), WorkerError> {
        let started = Instant::now();
        let reply = self.analyzer.exchange(text);

        let exited = match &reply.termination {
            Termination::Sentinel => None,
            Termination::EndOfStream => {
                tracing::warn!(id, lines = reply.lines.len(), "Analyzer output ended early");
                self.analyzer.exit_status_within(EXIT_GRACE)
            }
            Termination::Failed(e) => {
                tracing::warn!(id, error = %e, "Analyzer exchange failed");
                self.analyzer.exit_status_within(EXIT_GRACE)
            }
        };

        if reply.is_complete() {
            self.unterminated = 0;
        } else {
            self.unterminated += 1;
        }

        let normalized = decoder::decode_lines(&reply.lines);
        self.publish(id, &normalized);
        self.handled += 1;
        tracing::debug!(
            id,
            bytes = normalized.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Request handled"
        );

        match exited {
            Some(status) => {
                tracing::error!(id, %status, "Analyzer exited");
                Err(WorkerError::AnalyzerExited { status })
            }
            None if self.unterminated >= MAX_UNTERMINATED_REPLIES => {
                tracing::error!(
                    id,
                    replies = self.unterminated,
                    "Analyzer stopped answering"
                );
                Err(WorkerError::AnalyzerUnresponsive {
                    replies: self.unterminated,
                })
            }
            None => Ok(()),
        }
    }

    /// Retry until the response is stored or shutdown is requested.
    fn publish(&self, id: u64, text: &str) -> bool {
        let mut backoff = Backoff::new(PUBLISH_BACKOFF_INITIAL, self.config.publish_backoff_max);
        loop {
            if self.queues.enqueue_response(id, text) {
                return true;
            }
            if self.shutdown.is_triggered() {
                tracing::warn!(id, "Dropping response, shutdown requested while queue was full");
                return false;
            }
            backoff.sleep();
        }
    }

    fn drain(mut self) {
        self.transition(WorkerState::Draining);
        let handled = self.handled;
        let Worker { analyzer, .. } = self;
        drop(analyzer);
        tracing::info!(handled, state = ?WorkerState::Terminated, "Worker stopped");
    }
}

/// Next idle wait in milliseconds: `(t + 1) * 2`, capped.
fn next_idle_wait(current: u64, max: u64) -> u64 {
    current.saturating_add(1).saturating_mul(2).min(max)
}
