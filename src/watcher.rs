use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const DEBOUNCE: Duration = Duration::from_millis(50);
const MAX_RETRIES: u32 = 5;
const BACKOFF_CAP_MS: u64 = 30_000;

/// Watches one inbox directory and invokes a callback when its contents
/// change.
///
/// The transport is a polling thread over a stat fingerprint (name, size,
/// mtime of every entry): cheap, loss-tolerant, and portable. Bursts of
/// changes are coalesced by a 50 ms debounce. Errors reading the directory
/// trigger exponential backoff; after five consecutive failures the watcher
/// goes dormant until restarted.
pub struct InboxWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl InboxWatcher {
    pub fn start(dir: PathBuf, on_change: impl Fn() + Send + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            watch_loop(&dir, &stop_thread, &on_change);
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InboxWatcher {
    fn drop(&mut self) {
        self.halt();
    }
}

fn watch_loop(dir: &Path, stop: &AtomicBool, on_change: &(impl Fn() + Send)) {
    let mut last_fingerprint = fingerprint(dir).unwrap_or_default();
    let mut retries: u32 = 0;

    // An initial pass picks up messages that arrived before the watch.
    if !last_fingerprint.is_empty() {
        on_change();
        last_fingerprint = fingerprint(dir).unwrap_or_default();
    }

    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep(POLL_INTERVAL);

        match fingerprint(dir) {
            Ok(current) => {
                retries = 0;
                if current != last_fingerprint {
                    // Debounce: let a burst of writes settle, then fire once.
                    thread::sleep(DEBOUNCE);
                    on_change();
                    last_fingerprint = fingerprint(dir).unwrap_or_default();
                }
            }
            Err(err) => {
                retries += 1;
                if retries > MAX_RETRIES {
                    warn!(dir = %dir.display(), "inbox watch dormant after {MAX_RETRIES} failures");
                    return;
                }
                let backoff = backoff_ms(retries);
                debug!(dir = %dir.display(), %err, retries, backoff, "inbox watch error; backing off");
                let deadline = std::time::Instant::now() + Duration::from_millis(backoff);
                while std::time::Instant::now() < deadline {
                    if stop.load(Ordering::SeqCst) {
                        return;
                    }
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

/// `min(1000 * 2^(retries-1), 30000)` milliseconds.
fn backoff_ms(retries: u32) -> u64 {
    (1000u64 << (retries.saturating_sub(1)).min(16)).min(BACKOFF_CAP_MS)
}

/// Stat-based directory fingerprint: name, size, and nanosecond mtime of
/// every entry. Detects additions, deletions, and in-place edits without
/// reading file contents.
fn fingerprint(dir: &Path) -> std::io::Result<String> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        entries.push((
            entry.file_name().to_string_lossy().into_owned(),
            meta.len(),
            mtime,
        ));
    }
    entries.sort();
    Ok(entries
        .iter()
        .map(|(name, size, mtime)| format!("{name}:{size}:{mtime}"))
        .collect::<Vec<_>>()
        .join(","))
}

/// Re-entrancy guard for the drain procedure.
///
/// `enter` returns false when a drain is already running, in which case a
/// pending flag is set; the running drain observes it via `leave` and runs
/// one more pass.
#[derive(Default)]
pub struct DrainGuard {
    busy: AtomicBool,
    pending: AtomicBool,
}

impl DrainGuard {
    pub fn enter(&self) -> bool {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            true
        } else {
            self.pending.store(true, Ordering::SeqCst);
            false
        }
    }

    /// Returns true when another pass should run immediately.
    pub fn leave(&self) -> bool {
        let rerun = self.pending.swap(false, Ordering::SeqCst);
        if !rerun {
            self.busy.store(false, Ordering::SeqCst);
        }
        rerun
    }
}

/// Run `drain` under the guard, repeating while reentry was requested.
pub fn drain_guarded(guard: &DrainGuard, mut drain: impl FnMut()) {
    if !guard.enter() {
        return;
    }
    loop {
        drain();
        if !guard.leave() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    #[test]
    fn backoff_schedule_caps_at_thirty_seconds() {
        assert_eq!(backoff_ms(1), 1000);
        assert_eq!(backoff_ms(2), 2000);
        assert_eq!(backoff_ms(3), 4000);
        assert_eq!(backoff_ms(5), 16000);
        assert_eq!(backoff_ms(6), 30000);
        assert_eq!(backoff_ms(40), 30000);
    }

    #[test]
    fn fingerprint_changes_with_contents() {
        let dir = tempdir().unwrap();
        let a = fingerprint(dir.path()).unwrap();
        fs::write(dir.path().join("m1.json"), "{}").unwrap();
        let b = fingerprint(dir.path()).unwrap();
        assert_ne!(a, b);
        fs::remove_file(dir.path().join("m1.json")).unwrap();
        let c = fingerprint(dir.path()).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn watcher_fires_on_new_file() {
        let dir = tempdir().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        let watcher = InboxWatcher::start(dir.path().to_path_buf(), move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(300));
        fs::write(dir.path().join("m1.json"), "{}").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while fired.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        watcher.stop();
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn watcher_survives_directory_recreation() {
        let dir = tempdir().unwrap();
        let inbox = dir.path().join("inbox");
        fs::create_dir_all(&inbox).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        let watcher = InboxWatcher::start(inbox.clone(), move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(300));
        fs::remove_dir_all(&inbox).unwrap();
        thread::sleep(Duration::from_millis(300));
        fs::create_dir_all(&inbox).unwrap();
        fs::write(inbox.join("m1.json"), "{}").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while fired.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        watcher.stop();
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn drain_guard_serializes_and_requests_rerun() {
        let guard = DrainGuard::default();
        assert!(guard.enter());
        // A second entrant is refused and marks pending.
        assert!(!guard.enter());
        // Leaving with pending set requests another pass.
        assert!(guard.leave());
        assert!(!guard.leave());
        // Fully released now.
        assert!(guard.enter());
        assert!(!guard.leave());
    }

    #[test]
    fn drain_guarded_runs_pending_pass() {
        let guard = DrainGuard::default();
        let runs = Mutex::new(0);
        // Simulate a concurrent fire by setting pending mid-drain.
        let mut first = true;
        drain_guarded(&guard, || {
            *runs.lock().unwrap() += 1;
            if first {
                first = false;
                assert!(!guard.enter());
            }
        });
        assert_eq!(*runs.lock().unwrap(), 2);
    }
}
