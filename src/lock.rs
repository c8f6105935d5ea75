//! Cross-process instrument lock.
//!
//! Some instruments are physically shared: the dual-output power supply sits
//! behind a dumb switch reachable from two host PCs over one Ethernet link,
//! and only one host may send SCPI commands at a time. Bench-level allocation
//! cannot help here because the two hosts run independent broker instances,
//! so the serialization point is an advisory lock visible through the
//! filesystem.
//!
//! The lock artifact is a file keyed by the instrument's address, containing
//! the holder's process id. A lock is *held* while the artifact exists and
//! its recorded process is alive. Acquisition atomically creates the artifact
//! (`create_new`), retrying with backoff and jitter until the caller's
//! timeout; an artifact whose recorded process is provably dead is reclaimed
//! before retrying.
//!
//! Staleness detection fails safe: liveness is probed with `kill(pid, 0)`,
//! and `EPERM` (process exists, signal not permitted) counts as alive. Only a
//! definitively dead pid, or an artifact with no parsable pid at all (the
//! holder crashed before the pid hit the disk), is ever removed. Removing a
//! live holder's artifact is the one forbidden transition.
//!
//! Acquisition is scoped: [`InstrumentLockGuard`] releases on drop, so every
//! exit path of the caller — success, error, timeout — returns the lock to
//! the other hosts polling for it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{BrokerError, Result};

/// Base interval between acquisition attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Upper bound of the random jitter added to each poll interval.
const POLL_JITTER_MS: u64 = 100;

/// Advisory, filesystem-visible mutual exclusion for one shared instrument.
///
/// # Example
///
/// ```rust,ignore
/// let lock = InstrumentLock::new(None, "192.168.10.3", Duration::from_secs(30))?;
/// let guard = lock.acquire().await?;
/// // ... exclusive SCPI traffic to the supply ...
/// drop(guard); // or guard.release()
/// ```
pub struct InstrumentLock {
    lock_path: PathBuf,
    instrument: String,
    timeout: Duration,
}

impl InstrumentLock {
    /// Create a lock handle for the instrument at `instrument_addr`.
    ///
    /// `lock_dir` defaults to `~/.bench_broker/locks`; the directory is
    /// created if missing. No lock is taken yet.
    pub fn new(
        lock_dir: Option<PathBuf>,
        instrument_addr: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let dir = lock_dir.unwrap_or_else(default_lock_dir);
        fs::create_dir_all(&dir)?;
        let lock_path = dir.join(format!("{}.lock", sanitize_addr(instrument_addr)));
        Ok(Self {
            lock_path,
            instrument: instrument_addr.to_string(),
            timeout,
        })
    }

    /// Path of the lock artifact.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Attempt to take the lock, retrying until the configured timeout.
    ///
    /// # Errors
    ///
    /// [`BrokerError::LockAcquisitionTimeout`] if the lock is still held
    /// (or held by an undeterminable owner) when the timeout elapses.
    pub async fn acquire(&self) -> Result<InstrumentLockGuard> {
        let start = Instant::now();
        loop {
            match self.try_create_artifact() {
                Ok(true) => {
                    debug!(instrument = %self.instrument, path = %self.lock_path.display(), "instrument lock acquired");
                    return Ok(InstrumentLockGuard {
                        lock_path: self.lock_path.clone(),
                        instrument: self.instrument.clone(),
                        released: false,
                    });
                }
                Ok(false) => {
                    // Held. Reclaim and retry immediately if provably stale.
                    if self.reclaim_if_stale() {
                        continue;
                    }
                }
                Err(err) => {
                    warn!(instrument = %self.instrument, error = %err, "error creating lock artifact");
                }
            }

            if start.elapsed() >= self.timeout {
                warn!(
                    instrument = %self.instrument,
                    waited = ?self.timeout,
                    "timeout acquiring instrument lock"
                );
                return Err(BrokerError::LockAcquisitionTimeout {
                    instrument: self.instrument.clone(),
                    waited: self.timeout,
                });
            }

            let jitter = rand::thread_rng().gen_range(0..=POLL_JITTER_MS);
            tokio::time::sleep(POLL_INTERVAL + Duration::from_millis(jitter)).await;
        }
    }

    /// Whether the artifact currently denotes a held lock.
    ///
    /// True when the file exists and its recorded process is alive or
    /// undeterminable.
    pub fn is_held(&self) -> bool {
        self.lock_path.exists() && !self.artifact_is_stale()
    }

    /// The pid recorded in the artifact, if present and parsable.
    pub fn holder(&self) -> Option<u32> {
        read_holder_pid(&self.lock_path)
    }

    /// Atomically create the artifact with our pid. Ok(false) means it
    /// already exists.
    fn try_create_artifact(&self) -> std::io::Result<bool> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(mut file) => {
                restrict_permissions(&self.lock_path);
                writeln!(file, "{}", std::process::id())?;
                file.sync_all()?;
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// True when the artifact records a provably dead holder (or no holder
    /// at all). Unreadable or undeterminable states count as held.
    fn artifact_is_stale(&self) -> bool {
        match fs::read_to_string(&self.lock_path) {
            Ok(content) => {
                let trimmed = content.trim();
                if trimmed.is_empty() {
                    // Holder crashed between create and write.
                    return true;
                }
                match trimmed.parse::<u32>() {
                    Ok(pid) => !is_pid_alive(pid),
                    Err(_) => true, // not a pid at all
                }
            }
            // The holder may have just released it; the next create attempt
            // settles the question. Treat as held for now.
            Err(_) => false,
        }
    }

    /// Remove the artifact if its holder is provably dead. Returns true when
    /// a reclaim happened and an immediate retry is worthwhile.
    fn reclaim_if_stale(&self) -> bool {
        if !self.artifact_is_stale() {
            return false;
        }
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {
                warn!(
                    instrument = %self.instrument,
                    path = %self.lock_path.display(),
                    "reclaimed stale instrument lock"
                );
                true
            }
            // Lost the race to another reclaimer; retry normally.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
            Err(err) => {
                warn!(instrument = %self.instrument, error = %err, "failed to reclaim stale lock");
                false
            }
        }
    }
}

/// RAII scope for a held instrument lock.
///
/// The artifact is removed exactly once, on explicit [`release`] or on drop,
/// whichever comes first. Releasing an already-released guard is a no-op.
///
/// [`release`]: InstrumentLockGuard::release
#[derive(Debug)]
pub struct InstrumentLockGuard {
    lock_path: PathBuf,
    instrument: String,
    released: bool,
}

impl InstrumentLockGuard {
    /// Release the lock now instead of at end of scope.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {
                debug!(instrument = %self.instrument, "instrument lock released");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(instrument = %self.instrument, error = %err, "error releasing instrument lock");
            }
        }
    }
}

impl Drop for InstrumentLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Default directory for lock artifacts: `~/.bench_broker/locks`, or a
/// path under the system temp directory when no home is available.
fn default_lock_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".bench_broker")
        .join("locks")
}

/// Make an instrument address safe as a file name.
fn sanitize_addr(addr: &str) -> String {
    addr.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn read_holder_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse().ok())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::Permissions::from_mode(0o600);
    if let Err(err) = fs::set_permissions(path, perms) {
        warn!(path = %path.display(), error = %err, "failed to set lock file permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

/// Probe whether `pid` is alive.
///
/// Uses `kill(pid, 0)`, which checks for process existence without sending a
/// signal. `EPERM` means the process exists but cannot be signalled; that
/// counts as alive so stale detection fails safe.
#[cfg(unix)]
fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: kill with signal 0 only checks for process existence; the pid
    // has been bounds-checked above.
    #[allow(unsafe_code)]
    let result = unsafe { libc::kill(pid_i32, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Non-Unix platforms cannot probe foreign processes cheaply; assume alive
/// so locks are never force-released on uncertainty.
#[cfg(not(unix))]
fn is_pid_alive(_pid: u32) -> bool {
    true
}
