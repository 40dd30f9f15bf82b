// SnapGuard lock.rs
// Purpose: Cross-process advisory locks guarding the registry and the live project tree

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::errors::{SnapError, SnapResult};

pub const REGISTRY_LOCK_FILE: &str = ".registry.lock";
pub const ROLLBACK_LOCK_FILE: &str = ".rollback.lock";

const RETRY_INTERVAL: Duration = Duration::from_millis(25);
const TARGET_KEY: &str = "target=";

/// Held advisory lock. Dropping the guard releases it.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Holder notes describe a live holder only.
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
        debug!("released lock {}", self.path.display());
    }
}

fn open_lock_file(path: &Path) -> SnapResult<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SnapError::io("creating lock directory", e))?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| SnapError::io(format!("opening lock {}", path.display()), e))
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind()
}

/// Try once to take an exclusive lock; contention yields `AlreadyInProgress`.
pub fn try_exclusive(path: &Path) -> SnapResult<LockGuard> {
    try_exclusive_for(path, None)
}

/// Like [`try_exclusive`], also recording the snapshot the holder works on
/// so that other processes can read it with [`held_target`].
pub fn try_exclusive_for(path: &Path, target: Option<&str>) -> SnapResult<LockGuard> {
    let mut file = open_lock_file(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            let mut note = format!(
                "pid={} acquired={}\n",
                std::process::id(),
                chrono::Utc::now().to_rfc3339()
            );
            if let Some(target) = target {
                note.push_str(&format!("{TARGET_KEY}{target}\n"));
            }
            file.set_len(0)
                .and_then(|()| file.write_all(note.as_bytes()))
                .and_then(|()| file.sync_data())
                .map_err(|e| SnapError::io(format!("recording holder in {}", path.display()), e))?;
            debug!("acquired lock {}", path.display());
            Ok(LockGuard {
                file,
                path: path.to_path_buf(),
            })
        }
        Err(e) if is_contended(&e) => Err(SnapError::AlreadyInProgress {
            lock_path: path.display().to_string(),
        }),
        Err(e) => Err(SnapError::io(format!("locking {}", path.display()), e)),
    }
}

fn recorded_target(note: &str) -> Option<String> {
    note.lines()
        .find_map(|line| line.strip_prefix(TARGET_KEY))
        .map(str::trim)
        .filter(|target| !target.is_empty())
        .map(str::to_string)
}

/// Snapshot recorded by the live holder of `path`, if it is held.
///
/// A note left behind by a crashed holder is ignored: the lock is taken
/// shared for a moment to tell the two apart.
pub fn held_target(path: &Path) -> SnapResult<Option<String>> {
    let note = match std::fs::read_to_string(path) {
        Ok(note) => note,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SnapError::io(format!("reading lock {}", path.display()), e)),
    };
    let Some(target) = recorded_target(&note) else {
        return Ok(None);
    };
    let file = open_lock_file(path)?;
    match FileExt::try_lock_shared(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            debug!("ignoring stale holder note for {target} in {}", path.display());
            Ok(None)
        }
        Err(e) if is_contended(&e) => Ok(Some(target)),
        Err(e) => Err(SnapError::io(format!("locking {}", path.display()), e)),
    }
}

/// Take an exclusive lock, waiting at most `timeout` for other holders.
pub fn exclusive_with_timeout(path: &Path, timeout: Duration) -> SnapResult<LockGuard> {
    let file = open_lock_file(path)?;
    let deadline = Instant::now() + timeout;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                return Ok(LockGuard {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if is_contended(&e) => {
                if Instant::now() >= deadline {
                    return Err(SnapError::io(
                        format!("waiting for lock {}", path.display()),
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "lock wait timed out"),
                    ));
                }
                thread::sleep(RETRY_INTERVAL);
            }
            Err(e) => return Err(SnapError::io(format!("locking {}", path.display()), e)),
        }
    }
}
