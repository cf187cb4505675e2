use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{MessengerError, Result};
use crate::proc;

/// A lock file older than this is fair game for takeover even if its PID
/// still probes alive (the holder may be stuck, or the PID recycled).
const STALE_AFTER: Duration = Duration::from_secs(10);
const RETRY_SLEEP: Duration = Duration::from_millis(100);
const MAX_RETRIES: usize = 50;

/// The machine-scope swarm lock: an exclusively-created file stamped with
/// the holder's PID. Serializes claims/completions mutations and crew id
/// allocation across every process on this workstation.
///
/// Not reentrant. A holder must not call back into `acquire`.
pub struct SwarmLock {
    path: PathBuf,
}

/// Held lock; unlinks the lock file on drop.
#[derive(Debug)]
pub struct SwarmLockGuard {
    path: PathBuf,
}

impl Drop for SwarmLockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl SwarmLock {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Acquire the lock, retrying through live contention and recovering
    /// stale files left by crashed holders.
    pub fn acquire(&self) -> Result<SwarmLockGuard> {
        static NEVER: AtomicBool = AtomicBool::new(false);
        self.acquire_cancellable(&NEVER)
    }

    /// As `acquire`, but gives up immediately with `cancelled` once the flag
    /// is set.
    pub fn acquire_cancellable(&self, cancel: &AtomicBool) -> Result<SwarmLockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        for attempt in 0..MAX_RETRIES {
            if cancel.load(Ordering::Relaxed) {
                return Err(MessengerError::Cancelled);
            }

            match self.try_create() {
                Ok(()) => return Ok(SwarmLockGuard {
                    path: self.path.clone(),
                }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if self.holder_is_stale() {
                        // Best effort: a racing process may have cleaned it
                        // up (or re-created it) between our check and unlink.
                        let _ = fs::remove_file(&self.path);
                        debug!(lock = %self.path.display(), attempt, "removed stale swarm lock");
                        continue;
                    }
                    std::thread::sleep(RETRY_SLEEP);
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(lock = %self.path.display(), "swarm lock acquisition timed out");
        Err(MessengerError::LockTimeout(format!(
            "{} retries over ~{}s",
            MAX_RETRIES,
            MAX_RETRIES * RETRY_SLEEP.as_millis() as usize / 1000
        )))
    }

    /// Run `f` while holding the lock; the lock file is removed even when
    /// `f` errors.
    pub fn with<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let guard = self.acquire()?;
        let result = f();
        drop(guard);
        result
    }

    fn try_create(&self) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        file.write_all(std::process::id().to_string().as_bytes())?;
        Ok(())
    }

    fn holder_is_stale(&self) -> bool {
        let holder_pid = fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());

        let alive = holder_pid.map(proc::pid_alive).unwrap_or(false);
        if !alive {
            return true;
        }

        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .map(|age| age >= STALE_AFTER)
            .unwrap_or(false)
    }
}
