//! Request/response queue pair in shared memory.
//!
//! Each queue is a [`SlotTable`] guarded by its own [`NamedSemaphore`]. Every
//! operation takes the semaphore without blocking, scans the table once and
//! releases; contention is reported exactly like a full table so that all
//! retry policy lives with the caller.
//!
//! Requests are anonymous work items claimed first-come by any worker.
//! Responses are keyed by the request id so that many callers can share one
//! table and each pick up only their own answer.

use std::borrow::Cow;
use std::time::Duration;

use crate::config::{QueueConfig, QueueNames};
use crate::protocol::{self, DOC_LEN_MAX, SENTINEL, SLOT_TEXT_CAPACITY};
use crate::shm::{NamedSemaphore, SemaphoreGuard, ShmError, SlotTable, TableView};

/// Characters a request may be cut after when it exceeds [`DOC_LEN_MAX`].
const DELIMITERS: &[u8] = b" .,!@#$%^&*()_-+={[}];:'\"~`<>?/\n\t";

/// One slot table and the semaphore that guards it.
#[derive(Debug)]
pub struct Queue {
    table: SlotTable,
    mutex: NamedSemaphore,
}

struct Locked<'a> {
    view: TableView<'a>,
    _guard: SemaphoreGuard<'a>,
}

impl Queue {
    /// Create both resources. The semaphore becomes available only after the
    /// table is fully initialized.
    pub fn create(sem_name: &str, shm_name: &str, slots: usize) -> Result<Self, ShmError> {
        let mutex = NamedSemaphore::create(sem_name)?;
        let table = match SlotTable::create(shm_name, slots, SLOT_TEXT_CAPACITY) {
            Ok(table) => table,
            Err(e) => {
                let _ = NamedSemaphore::unlink(sem_name);
                return Err(e);
            }
        };
        mutex.release();
        Ok(Self { table, mutex })
    }

    pub fn attach(sem_name: &str, shm_name: &str) -> Result<Self, ShmError> {
        let mutex = NamedSemaphore::open(sem_name)?;
        let table = SlotTable::attach(shm_name)?;
        if table.text_capacity() != SLOT_TEXT_CAPACITY {
            return Err(ShmError::Layout {
                name: shm_name.to_string(),
                reason: format!(
                    "slot text capacity {} differs from this build's {}",
                    table.text_capacity(),
                    SLOT_TEXT_CAPACITY
                ),
            });
        }
        Ok(Self { table, mutex })
    }

    pub fn slot_count(&self) -> usize {
        self.table.slot_count()
    }

    fn try_lock(&self) -> Option<Locked<'_>> {
        let guard = self.mutex.try_acquire()?;
        // SAFETY: the binary semaphore is held until `Locked` is dropped, so no
        // other view of this table exists in any process.
        let view = unsafe { self.table.view() };
        Some(Locked {
            view,
            _guard: guard,
        })
    }

    /// Number of occupied slots, or `None` if the table is busy.
    pub fn occupancy(&self) -> Option<usize> {
        self.try_lock().map(|locked| locked.view.occupied())
    }

    #[cfg(test)]
    pub(crate) fn hold(&self) -> SemaphoreGuard<'_> {
        self.mutex
            .try_acquire()
            .expect("queue semaphore should be free in tests")
    }
}

/// Handle to both queues of one namespace.
#[derive(Debug)]
pub struct QueueSet {
    names: QueueNames,
    requests: Queue,
    responses: Queue,
    response_ttl: Option<Duration>,
}

impl QueueSet {
    /// Create and zero both queues. Done once by the launcher.
    ///
    /// Fails with [`ShmError::InUse`] when a complete queue pair already
    /// exists under the namespace, since it may belong to a running launcher.
    /// Partial leftovers of a crashed launcher are replaced. On failure no
    /// resource created here stays linked.
    pub fn create(config: &QueueConfig) -> Result<Self, ShmError> {
        let names = config.names();
        let slots = config.slots();

        if Self::attach(config).is_ok() {
            return Err(ShmError::InUse {
                namespace: config.namespace.clone(),
            });
        }

        let requests = Queue::create(&names.request_sem, &names.request_shm, slots)?;
        let responses = match Queue::create(&names.response_sem, &names.response_shm, slots) {
            Ok(responses) => responses,
            Err(e) => {
                drop(requests);
                let _ = NamedSemaphore::unlink(&names.request_sem);
                let _ = SlotTable::destroy(&names.request_shm);
                return Err(e);
            }
        };
        tracing::info!(
            namespace = %config.namespace,
            slots,
            slot_bytes = SLOT_TEXT_CAPACITY,
            "Queues created"
        );
        Ok(Self {
            names,
            requests,
            responses,
            response_ttl: config.response_ttl,
        })
    }

    /// Attach to queues created by another process.
    pub fn attach(config: &QueueConfig) -> Result<Self, ShmError> {
        let names = config.names();
        let requests = Queue::attach(&names.request_sem, &names.request_shm)?;
        let responses = Queue::attach(&names.response_sem, &names.response_shm)?;
        tracing::debug!(namespace = %config.namespace, "Attached to queues");
        Ok(Self {
            names,
            requests,
            responses,
            response_ttl: config.response_ttl,
        })
    }

    /// [`attach`](Self::attach), retrying transient failures that occur while
    /// the launcher is still creating the queues.
    pub fn attach_retrying(
        config: &QueueConfig,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self, ShmError> {
        let mut attempt = 1;
        loop {
            match Self::attach(config) {
                Ok(queues) => return Ok(queues),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::debug!(attempt, error = %e, "Queues not ready, retrying attach");
                    attempt += 1;
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Unlink all four resources. Done once by the launcher at shutdown;
    /// mappings held by other processes stay valid until they drop them.
    pub fn destroy(names: &QueueNames) -> Result<(), ShmError> {
        let results = [
            NamedSemaphore::unlink(&names.request_sem),
            SlotTable::destroy(&names.request_shm),
            NamedSemaphore::unlink(&names.response_sem),
            SlotTable::destroy(&names.response_shm),
        ];
        tracing::info!(request_shm = %names.request_shm, "Queues destroyed");
        results.into_iter().collect()
    }

    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    pub fn requests(&self) -> &Queue {
        &self.requests
    }

    pub fn responses(&self) -> &Queue {
        &self.responses
    }

    /// Store `text` in the first free request slot.
    ///
    /// Returns the new request id, or 0 when the table is full or busy.
    pub fn enqueue_request(&self, text: &str) -> u64 {
        let Some(mut locked) = self.requests.try_lock() else {
            return 0;
        };
        if locked.view.is_full() {
            return 0;
        }
        let Some(index) = locked.view.position(|id| id == 0) else {
            return 0;
        };

        let id = locked.view.next_id();
        let sanitized = mask_sentinel(text);
        let framed = protocol::frame_request(truncate_request(&sanitized, DOC_LEN_MAX));
        locked
            .view
            .store(index, id, framed.as_bytes(), now_millis());

        tracing::trace!(id, slot = index, bytes = framed.len(), "Request enqueued");
        id
    }

    /// Claim the first pending request, freeing its slot.
    pub fn dequeue_any_request(&self) -> Option<(u64, String)> {
        let mut locked = self.requests.try_lock()?;
        if locked.view.occupied() == 0 {
            return None;
        }
        let index = locked.view.position(|id| id != 0)?;

        let id = locked.view.id(index);
        let text = String::from_utf8_lossy(locked.view.text(index)).into_owned();
        locked.view.clear(index);

        tracing::trace!(id, slot = index, "Request claimed");
        Some((id, text))
    }

    /// Publish the result for request `id`.
    ///
    /// Returns `false` when the table is busy, or full with nothing old enough
    /// to evict.
    pub fn enqueue_response(&self, id: u64, text: &str) -> bool {
        let Some(mut locked) = self.responses.try_lock() else {
            return false;
        };
        let now = now_millis();

        let index = match locked.view.position(|slot_id| slot_id == 0) {
            Some(index) => index,
            None => match self.stale_response(&locked.view, now) {
                Some(index) => {
                    tracing::warn!(
                        evicted_id = locked.view.id(index),
                        age_ms = now.saturating_sub(locked.view.stamp(index)),
                        "Evicting unclaimed response"
                    );
                    locked.view.clear(index);
                    index
                }
                None => return false,
            },
        };

        let text = truncate_at_boundary(text, SLOT_TEXT_CAPACITY);
        locked.view.store(index, id, text.as_bytes(), now);
        tracing::trace!(id, slot = index, bytes = text.len(), "Response published");
        true
    }

    /// Take the response for `id` if it has been published.
    pub fn dequeue_response(&self, id: u64) -> Option<String> {
        if id == 0 {
            return None;
        }
        let mut locked = self.responses.try_lock()?;
        let index = locked.view.position(|slot_id| slot_id == id)?;

        let text = String::from_utf8_lossy(locked.view.text(index)).into_owned();
        locked.view.clear(index);

        tracing::trace!(id, slot = index, "Response collected");
        Some(text)
    }

    /// Oldest response older than the ttl, if eviction is enabled.
    fn stale_response(&self, view: &TableView<'_>, now: u64) -> Option<usize> {
        let ttl = self.response_ttl?.as_millis() as u64;
        (0..view.slot_count())
            .filter(|&i| now.saturating_sub(view.stamp(i)) > ttl)
            .min_by_key(|&i| view.stamp(i))
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Replace verbatim occurrences of the sentinel so the analyzer cannot end a
/// response stream early.
fn mask_sentinel(text: &str) -> Cow<'_, str> {
    if text.contains(SENTINEL) {
        Cow::Owned(text.replace(SENTINEL, " "))
    } else {
        Cow::Borrowed(text)
    }
}

/// Cut `text` to at most `limit` bytes, preferring to end right after the last
/// delimiter before the limit so no word is split.
pub fn truncate_request(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let cut = text.as_bytes()[..limit]
        .iter()
        .rposition(|b| DELIMITERS.contains(b))
        .map(|pos| pos + 1)
        .unwrap_or(limit);
    truncate_at_boundary(text, cut)
}

/// Hard cut at `limit` bytes, backing off to a UTF-8 character boundary.
pub fn truncate_at_boundary(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn test_config(workers: usize) -> QueueConfig {
        QueueConfig::default()
            .with_namespace(format!("/lemmaq-q-{}", uuid::Uuid::new_v4().simple()))
            .with_workers(workers)
    }

    struct Fixture {
        config: QueueConfig,
        queues: QueueSet,
    }

    impl Fixture {
        fn new(workers: usize) -> Self {
            Self::with_config(test_config(workers))
        }

        fn with_config(config: QueueConfig) -> Self {
            let queues = QueueSet::create(&config).unwrap();
            Self { config, queues }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = QueueSet::destroy(self.queues.names());
        }
    }

    #[test]
    fn request_roundtrip_appends_sentinel() {
        let fx = Fixture::new(1);
        let id = fx.queues.enqueue_request("Cats run quickly.");
        assert_ne!(id, 0);

        let (claimed, text) = fx.queues.dequeue_any_request().unwrap();
        assert_eq!(claimed, id);
        assert_eq!(text, "Cats run quickly. EndOfArticleMarker\n");
        assert_eq!(fx.queues.requests().occupancy(), Some(0));
        assert!(fx.queues.dequeue_any_request().is_none());
    }

    #[test]
    fn full_request_table_rejects_without_change() {
        let fx = Fixture::new(1);
        let ids: Vec<u64> = (0..2).map(|i| fx.queues.enqueue_request(&format!("doc {i}"))).collect();
        assert!(ids.iter().all(|&id| id != 0));
        assert_eq!(fx.queues.requests().occupancy(), Some(2));

        assert_eq!(fx.queues.enqueue_request("one too many"), 0);
        assert_eq!(fx.queues.requests().occupancy(), Some(2));
    }

    #[test]
    fn contended_mutex_rejects_without_change() {
        let fx = Fixture::new(2);
        fx.queues.enqueue_request("pending");

        {
            let _held = fx.queues.requests().hold();
            assert_eq!(fx.queues.enqueue_request("blocked"), 0);
            assert!(fx.queues.dequeue_any_request().is_none());
        }
        {
            let _held = fx.queues.responses().hold();
            assert!(!fx.queues.enqueue_response(7, "blocked"));
            assert!(fx.queues.dequeue_response(7).is_none());
        }

        assert_eq!(fx.queues.requests().occupancy(), Some(1));
        assert_eq!(fx.queues.responses().occupancy(), Some(0));
    }

    #[test]
    fn ids_are_unique_and_nonzero() {
        let fx = Fixture::new(8);
        let mut seen = HashSet::new();
        for round in 0..50 {
            let id = fx.queues.enqueue_request(&format!("round {round}"));
            assert_ne!(id, 0);
            assert!(seen.insert(id), "id {id} handed out twice");
            fx.queues.dequeue_any_request().unwrap();
        }
    }

    #[test]
    fn responses_are_matched_by_id() {
        let fx = Fixture::new(2);
        assert!(fx.queues.enqueue_response(11, "first"));
        assert!(fx.queues.enqueue_response(22, "second"));

        assert_eq!(fx.queues.dequeue_response(33), None);
        assert_eq!(fx.queues.dequeue_response(22).as_deref(), Some("second"));
        assert_eq!(fx.queues.dequeue_response(22), None);
        assert_eq!(fx.queues.dequeue_response(11).as_deref(), Some("first"));
        assert_eq!(fx.queues.dequeue_response(0), None);
    }

    #[test]
    fn full_response_table_without_ttl_rejects() {
        let fx = Fixture::with_config(test_config(1).with_response_ttl(None));
        assert!(fx.queues.enqueue_response(1, "a"));
        assert!(fx.queues.enqueue_response(2, "b"));
        assert!(!fx.queues.enqueue_response(3, "c"));
        assert_eq!(fx.queues.responses().occupancy(), Some(2));
    }

    #[test]
    fn stale_response_is_evicted_when_full() {
        let fx = Fixture::with_config(
            test_config(1).with_response_ttl(Some(Duration::from_millis(20))),
        );
        assert!(fx.queues.enqueue_response(1, "abandoned"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(fx.queues.enqueue_response(2, "fresh"));

        assert!(fx.queues.enqueue_response(3, "newest"));
        assert_eq!(fx.queues.dequeue_response(1), None);
        assert_eq!(fx.queues.dequeue_response(2).as_deref(), Some("fresh"));
        assert_eq!(fx.queues.dequeue_response(3).as_deref(), Some("newest"));
    }

    #[test]
    fn long_response_is_hard_cut() {
        let fx = Fixture::new(1);
        let long = "ж".repeat(SLOT_TEXT_CAPACITY);
        assert!(fx.queues.enqueue_response(5, &long));
        let stored = fx.queues.dequeue_response(5).unwrap();
        assert!(stored.len() <= SLOT_TEXT_CAPACITY);
        assert!(stored.len() >= SLOT_TEXT_CAPACITY - 1);
        assert!(stored.chars().all(|c| c == 'ж'));
    }

    #[test]
    fn sentinel_in_input_is_masked() {
        let fx = Fixture::new(1);
        fx.queues
            .enqueue_request("before EndOfArticleMarker after");
        let (_, text) = fx.queues.dequeue_any_request().unwrap();
        assert_eq!(text, "before   after EndOfArticleMarker\n");
        assert_eq!(text.matches(SENTINEL).count(), 1);
    }

    #[test]
    fn truncation_cuts_after_last_delimiter() {
        assert_eq!(truncate_request("hello world", 8), "hello ");
        assert_eq!(truncate_request("one,two,three", 10), "one,two,");
        assert_eq!(truncate_request("short", 10), "short");
        assert_eq!(truncate_request("exactly8", 8), "exactly8");
    }

    #[test]
    fn truncation_ignores_delimiter_at_boundary() {
        // The space at index 5 is the boundary itself, not before it.
        assert_eq!(truncate_request("ab cd efgh", 5), "ab ");
    }

    #[test]
    fn truncation_hard_cuts_without_delimiter() {
        assert_eq!(truncate_request("abcdefghij", 4), "abcd");
    }

    #[test]
    fn truncation_never_splits_characters() {
        // Each Cyrillic letter is two bytes; a cut at 5 falls mid-letter.
        assert_eq!(truncate_request("абвгд", 5), "аб");
        assert_eq!(truncate_at_boundary("жжж", 3), "ж");
    }

    #[test]
    fn long_request_is_stored_within_limit() {
        let fx = Fixture::new(1);
        let word = "lemma ";
        let text = word.repeat(DOC_LEN_MAX / word.len() + 10);
        assert_ne!(fx.queues.enqueue_request(&text), 0);

        let (_, stored) = fx.queues.dequeue_any_request().unwrap();
        let body = stored
            .strip_suffix(" EndOfArticleMarker\n")
            .expect("framing suffix");
        assert!(body.len() <= DOC_LEN_MAX);
        assert!(body.ends_with(' '));
        assert!(body.trim_end().split(' ').all(|w| w == "lemma"));
    }

    #[test]
    fn attached_handle_sees_creator_writes() {
        let config = test_config(1);
        let fx = Fixture::with_config(config.clone());
        let other = QueueSet::attach(&config).unwrap();

        let id = fx.queues.enqueue_request("shared");
        let (claimed, _) = other.dequeue_any_request().unwrap();
        assert_eq!(claimed, id);

        assert!(other.enqueue_response(id, "done"));
        assert_eq!(fx.queues.dequeue_response(id).as_deref(), Some("done"));
    }

    #[test]
    fn attach_after_destroy_fails() {
        let config = test_config(1);
        let queues = QueueSet::create(&config).unwrap();
        QueueSet::destroy(queues.names()).unwrap();

        let err = QueueSet::attach(&config).unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }

    #[test]
    fn failed_create_leaves_nothing_linked() {
        // Only the response semaphore name ("sem." + "<ns>-out-sem") exceeds NAME_MAX.
        let mut namespace = format!("/q{}", uuid::Uuid::new_v4().simple());
        namespace.push_str(&"x".repeat(245 - namespace.len()));
        let config = QueueConfig::default()
            .with_namespace(namespace)
            .with_workers(1);
        let names = config.names();

        let err = QueueSet::create(&config).unwrap_err();
        assert!(
            matches!(err, ShmError::Semaphore { ref name, .. } if *name == names.response_sem),
            "unexpected error: {err}"
        );

        assert!(NamedSemaphore::open(&names.request_sem).is_err());
        assert!(SlotTable::attach(&names.request_shm).is_err());
    }

    #[test]
    fn create_refuses_live_queues() {
        let fx = Fixture::new(1);
        let id = fx.queues.enqueue_request("in flight");

        let err = QueueSet::create(&fx.config).unwrap_err();
        assert!(matches!(err, ShmError::InUse { .. }), "unexpected error: {err}");
        assert!(!err.is_transient());

        let other = QueueSet::attach(&fx.config).unwrap();
        assert_eq!(other.dequeue_any_request().map(|(id, _)| id), Some(id));
    }

    #[test]
    fn create_replaces_partial_leftovers() {
        let config = test_config(1);
        drop(NamedSemaphore::create(&config.names().request_sem).unwrap());

        let fx = Fixture::with_config(config);
        assert_ne!(fx.queues.enqueue_request("fresh"), 0);
    }

    #[test]
    fn attach_retrying_waits_for_late_creation() {
        let config = test_config(1);
        let attacher = {
            let config = config.clone();
            std::thread::spawn(move || {
                QueueSet::attach_retrying(&config, 500, Duration::from_millis(10))
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        let fx = Fixture::with_config(config);
        let attached = attacher.join().unwrap().unwrap();

        let id = fx.queues.enqueue_request("late");
        assert_eq!(attached.dequeue_any_request().map(|(id, _)| id), Some(id));
    }

    #[test]
    fn attach_retrying_gives_up_after_its_attempts() {
        let config = test_config(1);
        let started = Instant::now();

        let err = QueueSet::attach_retrying(&config, 3, Duration::from_millis(10)).unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn concurrent_consumers_never_share_a_request() {
        let fx = Fixture::new(16);
        let queues = Arc::new(QueueSet::attach(&fx.config).unwrap());

        let mut expected = HashSet::new();
        for i in 0..32 {
            let id = fx.queues.enqueue_request(&format!("doc {i}"));
            assert_ne!(id, 0);
            expected.insert(id);
        }

        let remaining = Arc::new(AtomicUsize::new(expected.len()));
        let deadline = Instant::now() + Duration::from_secs(10);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queues = Arc::clone(&queues);
                let remaining = Arc::clone(&remaining);
                std::thread::spawn(move || {
                    let mut claimed = Vec::new();
                    while remaining.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
                        match queues.dequeue_any_request() {
                            Some((id, _)) => {
                                claimed.push(id);
                                remaining.fetch_sub(1, Ordering::AcqRel);
                            }
                            None => std::thread::yield_now(),
                        }
                    }
                    claimed
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "request {id} claimed twice");
            }
        }
        assert_eq!(seen, expected);
    }
}
