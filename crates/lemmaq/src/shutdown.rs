//! Shutdown latch for the synchronous worker loop.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use nix::sys::signal::{SigSet, Signal};

/// One-way flag that idle waits can block on.
#[derive(Debug, Clone, Default)]
pub struct ShutdownLatch {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        *lock_flag(lock) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *lock_flag(&self.inner.0)
    }

    /// Wait up to `timeout` for the latch. Returns whether it is triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock_flag(lock);
        match cvar.wait_timeout_while(guard, timeout, |triggered| !*triggered) {
            Ok((guard, _)) => *guard,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }
}

fn lock_flag(lock: &Mutex<bool>) -> MutexGuard<'_, bool> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Route SIGTERM and SIGINT to `latch`.
///
/// Blocks both signals in the calling thread (and every thread it spawns
/// afterwards) and waits for them on a dedicated thread. Call before spawning
/// other threads.
pub fn install_signal_handler(latch: ShutdownLatch) -> io::Result<()> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGTERM);
    signals.add(Signal::SIGINT);
    signals.thread_block().map_err(io::Error::from)?;

    std::thread::Builder::new()
        .name("lemmaq-signals".into())
        .spawn(move || match signals.wait() {
            Ok(signal) => {
                tracing::info!(?signal, "Received signal, shutting down");
                latch.trigger();
            }
            Err(e) => {
                tracing::error!(error = %e, "sigwait failed");
            }
        })?;
    Ok(())
}
