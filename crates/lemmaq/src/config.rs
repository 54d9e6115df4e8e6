//! Runtime configuration.
//!
//! Every setting has a default, an environment override (`LEMMAQ_*`) and a
//! builder method. The launcher forwards its effective configuration to the
//! worker processes it spawns through the same environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "/lemmaq";
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_ANALYZER: &str = "mystem";
pub const DEFAULT_ANALYZER_ARGS: &[&str] = &["-cd", "--format", "json"];

pub const ENV_NAMESPACE: &str = "LEMMAQ_NAMESPACE";
pub const ENV_WORKERS: &str = "LEMMAQ_WORKERS";
pub const ENV_ANALYZER: &str = "LEMMAQ_ANALYZER";
pub const ENV_ANALYZER_ARGS: &str = "LEMMAQ_ANALYZER_ARGS";
pub const ENV_IDLE_WAIT_MAX_MS: &str = "LEMMAQ_IDLE_WAIT_MAX_MS";
pub const ENV_RESPONSE_TTL_SECS: &str = "LEMMAQ_RESPONSE_TTL_SECS";
/// Millisecond form of the response ttl; wins over the seconds form.
pub const ENV_RESPONSE_TTL_MS: &str = "LEMMAQ_RESPONSE_TTL_MS";
pub const ENV_TIMEOUT_SECS: &str = "LEMMAQ_TIMEOUT_SECS";
/// Set by the launcher on each worker it spawns.
pub const ENV_WORKER_INDEX: &str = "LEMMAQ_WORKER_INDEX";

/// Names of the four shared resources backing one queue pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub request_sem: String,
    pub request_shm: String,
    pub response_sem: String,
    pub response_shm: String,
}

impl QueueNames {
    pub fn for_namespace(namespace: &str) -> Self {
        let ns = if namespace.starts_with('/') {
            namespace.to_string()
        } else {
            format!("/{namespace}")
        };
        Self {
            request_sem: format!("{ns}-in-sem"),
            request_shm: format!("{ns}-in-shm"),
            response_sem: format!("{ns}-out-sem"),
            response_shm: format!("{ns}-out-shm"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub namespace: String,
    /// Worker count; slot tables hold twice as many entries.
    pub workers: usize,
    /// Age after which an unclaimed response may be evicted to make room.
    /// `None` disables eviction.
    pub response_ttl: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            workers: DEFAULT_WORKERS,
            response_ttl: Some(Duration::from_secs(60)),
        }
    }
}

impl QueueConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_response_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.response_ttl = ttl;
        self
    }

    pub fn names(&self) -> QueueNames {
        QueueNames::for_namespace(&self.namespace)
    }

    pub fn slots(&self) -> usize {
        self.workers.max(1) * 2
    }
}

/// Command line of the external analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for AnalyzerCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_ANALYZER),
            args: DEFAULT_ANALYZER_ARGS.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl AnalyzerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub analyzer: AnalyzerCommand,
    /// Ceiling of the idle wait between empty polls of the request queue.
    pub idle_wait_max: Duration,
    /// Ceiling of the backoff while the response queue is full.
    pub publish_backoff_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            analyzer: AnalyzerCommand::default(),
            idle_wait_max: Duration::from_millis(1000),
            publish_backoff_max: Duration::from_millis(5),
        }
    }
}

impl WorkerConfig {
    pub fn with_analyzer(mut self, analyzer: AnalyzerCommand) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_idle_wait_max(mut self, max: Duration) -> Self {
        self.idle_wait_max = max;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Upper bound for one `normalize` call. `None` waits forever.
    pub timeout: Option<Duration>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            backoff_initial: Duration::from_micros(50),
            backoff_max: Duration::from_millis(5),
        }
    }
}

impl ClientConfig {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max.max(initial);
        self
    }
}

/// Complete configuration of one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub client: ClientConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Invalid values are logged and
    /// replaced by defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();

        if let Some(ns) = lookup(ENV_NAMESPACE).filter(|ns| !ns.trim().is_empty()) {
            config.queue.namespace = ns.trim().to_string();
        }
        match parse_var::<usize>(&lookup, ENV_WORKERS) {
            Some(0) => {
                tracing::warn!(key = ENV_WORKERS, "Worker count must be positive, using default");
            }
            Some(n) => config.queue.workers = n,
            None => {}
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_RESPONSE_TTL_SECS) {
            config.queue.response_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_RESPONSE_TTL_MS) {
            config.queue.response_ttl = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(program) = lookup(ENV_ANALYZER).filter(|p| !p.trim().is_empty()) {
            config.worker.analyzer.program = PathBuf::from(program.trim());
        }
        if let Some(args) = lookup(ENV_ANALYZER_ARGS) {
            config.worker.analyzer.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_IDLE_WAIT_MAX_MS) {
            config.worker.idle_wait_max = Duration::from_millis(ms.max(1));
        }

        if let Some(secs) = parse_var::<f64>(&lookup, ENV_TIMEOUT_SECS) {
            config.client.timeout = (secs > 0.0).then(|| Duration::from_secs_f64(secs));
        }

        config
    }

    /// Variables that reproduce the queue and worker settings in a child process.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (ENV_NAMESPACE, self.queue.namespace.clone()),
            (ENV_WORKERS, self.queue.workers.to_string()),
            (
                ENV_RESPONSE_TTL_MS,
                self.queue
                    .response_ttl
                    .map(|ttl| ttl.as_millis().max(1))
                    .unwrap_or(0)
                    .to_string(),
            ),
            (
                ENV_ANALYZER,
                self.worker.analyzer.program.display().to_string(),
            ),
            (ENV_ANALYZER_ARGS, self.worker.analyzer.args.join(" ")),
            (
                ENV_IDLE_WAIT_MAX_MS,
                self.worker.idle_wait_max.as_millis().to_string(),
            ),
        ];
        if let Some(timeout) = self.client.timeout {
            vars.push((ENV_TIMEOUT_SECS, timeout.as_secs_f64().to_string()));
        }
        vars
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config, Config::default());
        assert_eq!(config.queue.slots(), 8);
        assert_eq!(config.worker.analyzer.program, PathBuf::from("mystem"));
        assert_eq!(config.worker.analyzer.args, vec!["-cd", "--format", "json"]);
        assert_eq!(config.client.timeout, None);
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_NAMESPACE, "/test-ns"),
            (ENV_WORKERS, "3"),
            (ENV_ANALYZER, "/opt/mystem/mystem"),
            (ENV_ANALYZER_ARGS, "-c  --format json"),
            (ENV_IDLE_WAIT_MAX_MS, "250"),
            (ENV_RESPONSE_TTL_SECS, "0"),
            (ENV_TIMEOUT_SECS, "1.5"),
        ]));

        assert_eq!(config.queue.namespace, "/test-ns");
        assert_eq!(config.queue.slots(), 6);
        assert_eq!(config.queue.response_ttl, None);
        assert_eq!(
            config.worker.analyzer.program,
            PathBuf::from("/opt/mystem/mystem")
        );
        assert_eq!(config.worker.analyzer.args, vec!["-c", "--format", "json"]);
        assert_eq!(config.worker.idle_wait_max, Duration::from_millis(250));
        assert_eq!(config.client.timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_WORKERS, "zero"),
            (ENV_IDLE_WAIT_MAX_MS, "-5"),
            (ENV_TIMEOUT_SECS, "soon"),
        ]));
        assert_eq!(config, Config::default());

        let config = Config::from_lookup(lookup_from(&[(ENV_WORKERS, "0")]));
        assert_eq!(config.queue.workers, DEFAULT_WORKERS);
    }

    #[test]
    fn env_roundtrip_preserves_worker_settings() {
        let original = Config {
            queue: QueueConfig::default()
                .with_namespace("/roundtrip")
                .with_workers(2)
                .with_response_ttl(Some(Duration::from_secs(30))),
            worker: WorkerConfig::default()
                .with_analyzer(AnalyzerCommand::new("/bin/stub").with_args(["analyzer-stub"]))
                .with_idle_wait_max(Duration::from_millis(100)),
            client: ClientConfig::default(),
        };

        let vars = original.to_env();
        let restored = Config::from_lookup(|key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        });
        assert_eq!(restored, original);
    }

    #[test]
    fn sub_second_ttl_reaches_workers_intact() {
        for ttl in [Duration::from_millis(500), Duration::from_millis(1500)] {
            let original = Config {
                queue: QueueConfig::default().with_response_ttl(Some(ttl)),
                ..Config::default()
            };
            let vars = original.to_env();
            let restored = Config::from_lookup(|key| {
                if key == ENV_RESPONSE_TTL_SECS {
                    // Inherited by the worker from the launcher's own environment.
                    return Some("30".to_string());
                }
                vars.iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.clone())
            });
            assert_eq!(restored.queue.response_ttl, Some(ttl));
        }

        let disabled = Config {
            queue: QueueConfig::default().with_response_ttl(None),
            ..Config::default()
        };
        let vars = disabled.to_env();
        let restored = Config::from_lookup(|key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        });
        assert_eq!(restored.queue.response_ttl, None);
    }

    #[test]
    fn namespace_gets_leading_slash() {
        let names = QueueNames::for_namespace("lemmaq-test");
        assert_eq!(names.request_sem, "/lemmaq-test-in-sem");
        assert_eq!(names.request_shm, "/lemmaq-test-in-shm");
        assert_eq!(names.response_sem, "/lemmaq-test-out-sem");
        assert_eq!(names.response_shm, "/lemmaq-test-out-shm");
    }
}
