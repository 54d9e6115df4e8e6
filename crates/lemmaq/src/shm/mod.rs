//! Named POSIX shared resources.
//!
//! - **semaphore**: process-shared binary semaphore used as a try-only mutex
//! - **table**: fixed-geometry slot table in a named shared memory segment

pub mod semaphore;
pub mod table;

use std::io;

pub use semaphore::{NamedSemaphore, SemaphoreGuard};
pub use table::{SlotTable, TableView};

/// Failure to create, attach or remove a named shared resource.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("semaphore {name}: {op} failed: {source}")]
    Semaphore {
        name: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("shared memory {name}: {op} failed: {source}")]
    SharedMemory {
        name: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("shared memory {name}: incompatible layout: {reason}")]
    Layout { name: String, reason: String },

    #[error("invalid resource name {name:?}")]
    InvalidName { name: String },

    #[error(
        "queues for namespace {namespace} already exist; \
         run `lemmaq cleanup` if no launcher is using them"
    )]
    InUse { namespace: String },
}

impl ShmError {
    /// True for failures expected while the launcher is still creating the
    /// queues: a missing resource or a segment whose header is not written yet.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Semaphore { source, .. } | Self::SharedMemory { source, .. } => {
                source.kind() == io::ErrorKind::NotFound
            }
            Self::Layout { .. } => true,
            Self::InvalidName { .. } | Self::InUse { .. } => false,
        }
    }

    pub(crate) fn semaphore(name: &str, op: &'static str, source: io::Error) -> Self {
        Self::Semaphore {
            name: name.to_string(),
            op,
            source,
        }
    }

    pub(crate) fn shared_memory(name: &str, op: &'static str, source: io::Error) -> Self {
        Self::SharedMemory {
            name: name.to_string(),
            op,
            source,
        }
    }
}
