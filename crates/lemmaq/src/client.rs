//! Caller side of the queue pair.
//!
//! A call submits the text as a request, then polls the response queue for
//! its id with exponential backoff. Both steps share one optional deadline;
//! the async variants additionally observe a [`CancellationToken`].

use std::sync::Arc;
use std::time::{Duration, Instant};

pub use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::{ClientConfig, Config};
use crate::queue::QueueSet;
use crate::shm::ShmError;

#[derive(Debug, thiserror::Error)]
pub enum AwaitError {
    #[error("request queue stayed full for {waited:?}")]
    SubmitTimedOut { waited: Duration },

    #[error("no response for request {id} after {waited:?}")]
    TimedOut { id: u64, waited: Duration },

    /// `id` is 0 when cancelled before the request was enqueued.
    #[error("wait for request {id} cancelled")]
    Cancelled { id: u64 },
}

#[derive(Debug, Clone)]
pub struct Client {
    queues: Arc<QueueSet>,
    config: ClientConfig,
}

/// Shared timing state of one call.
struct Wait {
    started: Instant,
    deadline: Option<Instant>,
    backoff: Backoff,
}

impl Wait {
    fn new(config: &ClientConfig, timeout: Option<Duration>) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: timeout.map(|t| started + t),
            backoff: Backoff::new(config.backoff_initial, config.backoff_max),
        }
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn waited(&self) -> Duration {
        self.started.elapsed()
    }

    /// Next sleep, never past the deadline.
    fn next_delay(&mut self) -> Duration {
        let delay = self.backoff.next_delay();
        match self.deadline {
            Some(deadline) => delay.min(deadline.saturating_duration_since(Instant::now())),
            None => delay,
        }
    }

    fn start_over(&mut self) {
        self.backoff.reset();
    }
}

impl Client {
    pub fn new(queues: Arc<QueueSet>, config: ClientConfig) -> Self {
        Self { queues, config }
    }

    /// Attach to the queues of a running deployment.
    pub fn connect(config: &Config) -> Result<Self, ShmError> {
        let queues = QueueSet::attach(&config.queue)?;
        Ok(Self::new(Arc::new(queues), config.client.clone()))
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Normalize `text`, blocking up to the configured timeout.
    ///
    /// Empty input returns empty output without touching the queues.
    pub fn normalize(&self, text: &str) -> Result<String, AwaitError> {
        if text.is_empty() {
            return Ok(String::new());
        }
        let mut wait = Wait::new(&self.config, self.config.timeout);
        let id = self.submit_with(text, &mut wait)?;
        wait.start_over();
        self.await_with(id, &mut wait)
    }

    /// Enqueue `text`, retrying while the request queue is full or busy.
    pub fn submit(&self, text: &str) -> Result<u64, AwaitError> {
        let mut wait = Wait::new(&self.config, self.config.timeout);
        self.submit_with(text, &mut wait)
    }

    /// Wait for the response to `id` up to the configured timeout.
    pub fn await_response(&self, id: u64) -> Result<String, AwaitError> {
        self.await_response_timeout(id, self.config.timeout)
    }

    pub fn await_response_timeout(
        &self,
        id: u64,
        timeout: Option<Duration>,
    ) -> Result<String, AwaitError> {
        let mut wait = Wait::new(&self.config, timeout);
        self.await_with(id, &mut wait)
    }

    fn submit_with(&self, text: &str, wait: &mut Wait) -> Result<u64, AwaitError> {
        loop {
            let id = self.queues.enqueue_request(text);
            if id != 0 {
                tracing::trace!(id, "Submitted request");
                return Ok(id);
            }
            if wait.expired() {
                return Err(AwaitError::SubmitTimedOut {
                    waited: wait.waited(),
                });
            }
            std::thread::sleep(wait.next_delay());
        }
    }

    fn await_with(&self, id: u64, wait: &mut Wait) -> Result<String, AwaitError> {
        loop {
            if let Some(text) = self.queues.dequeue_response(id) {
                return Ok(text);
            }
            if wait.expired() {
                return Err(timed_out(id, wait));
            }
            std::thread::sleep(wait.next_delay());
        }
    }

    pub async fn normalize_async(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AwaitError> {
        if text.is_empty() {
            return Ok(String::new());
        }
        let mut wait = Wait::new(&self.config, self.config.timeout);
        let id = self.submit_async_with(text, &mut wait, cancel).await?;
        wait.start_over();
        self.await_async_with(id, &mut wait, cancel).await
    }

    pub async fn submit_async(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, AwaitError> {
        let mut wait = Wait::new(&self.config, self.config.timeout);
        self.submit_async_with(text, &mut wait, cancel).await
    }

    pub async fn await_response_async(
        &self,
        id: u64,
        cancel: &CancellationToken,
    ) -> Result<String, AwaitError> {
        let mut wait = Wait::new(&self.config, self.config.timeout);
        self.await_async_with(id, &mut wait, cancel).await
    }

    async fn submit_async_with(
        &self,
        text: &str,
        wait: &mut Wait,
        cancel: &CancellationToken,
    ) -> Result<u64, AwaitError> {
        loop {
            let id = self.queues.enqueue_request(text);
            if id != 0 {
                return Ok(id);
            }
            if wait.expired() {
                return Err(AwaitError::SubmitTimedOut {
                    waited: wait.waited(),
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(AwaitError::Cancelled { id: 0 }),
                _ = tokio::time::sleep(wait.next_delay()) => {}
            }
        }
    }

    async fn await_async_with(
        &self,
        id: u64,
        wait: &mut Wait,
        cancel: &CancellationToken,
    ) -> Result<String, AwaitError> {
        loop {
            if let Some(text) = self.queues.dequeue_response(id) {
                return Ok(text);
            }
            if wait.expired() {
                return Err(timed_out(id, wait));
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(id, "Abandoning request");
                    return Err(AwaitError::Cancelled { id });
                }
                _ = tokio::time::sleep(wait.next_delay()) => {}
            }
        }
    }
}

fn timed_out(id: u64, wait: &Wait) -> AwaitError {
    let waited = wait.waited();
    tracing::warn!(id, waited_ms = waited.as_millis() as u64, "Timed out waiting for response");
    AwaitError::TimedOut { id, waited }
}
