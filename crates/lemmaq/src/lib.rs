//! lemmaq: shared-memory request queue feeding a pool of morphological
//! analyzer workers.

#[cfg(not(unix))]
compile_error!("lemmaq relies on POSIX shared memory and named semaphores");

mod backoff;
mod version;

pub mod analyzer;
pub mod client;
pub mod config;
pub mod decoder;
pub mod logging;
pub mod protocol;
pub mod queue;
pub mod shm;
pub mod shutdown;
pub mod stub_analyzer;
pub mod supervisor;
pub mod worker;

pub use backoff::Backoff;
pub use client::{AwaitError, CancellationToken, Client};
pub use config::{AnalyzerCommand, ClientConfig, Config, QueueConfig, QueueNames, WorkerConfig};
pub use decoder::{StreamDecoder, decode_lines};
pub use queue::{Queue, QueueSet};
pub use shm::ShmError;
pub use shutdown::ShutdownLatch;
pub use supervisor::{ExecSpawner, Supervisor, SupervisorError, WorkerSpawner, shutdown_signal};
pub use version::{LEMMAQ_VERSION, VersionInfo};
pub use worker::{WorkerError, WorkerState, run_worker};
