//! Cross-process commit lock for the registry document.
//!
//! The lock is a sentinel file created with create-new semantics next to the
//! registry. It is only held for the compare-generation, rename step of a
//! commit. Every holder writes a random token into its sentinel and only ever
//! removes a sentinel that still carries that token.
//!
//! A sentinel left behind by a crashed writer is recovered when it is older
//! than the stale threshold, or when it was written on this host by a PID
//! that no longer exists. Sentinels from other hosts, or from a host whose
//! name cannot be determined, are judged by age alone.
//!
//! Recovery renames the abandoned sentinel to a unique name and checks that
//! the renamed file is the one that was judged abandoned. If another writer
//! recovered first and already holds a fresh sentinel, that sentinel is put
//! back untouched.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Host name recorded when the real one cannot be read.
pub const UNKNOWN_HOST: &str = "unknown";

/// Contents of the lock sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSentinel {
    pub pid: u32,
    pub hostname: String,
    pub created_at_ms: u64,
    /// Identifies the holder; empty in sentinels written by older versions
    #[serde(default)]
    pub token: String,
}

impl LockSentinel {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: local_hostname().unwrap_or(UNKNOWN_HOST).to_string(),
            created_at_ms: now_ms(),
            token: new_token(),
        }
    }

    /// Whether the holder process may still run.
    ///
    /// Only a holder on this host, with both host names known, can be
    /// proven dead.
    pub fn is_holder_alive(&self) -> bool {
        match local_hostname() {
            Some(local) if self.hostname != UNKNOWN_HOST && self.hostname == local => {
                is_pid_alive(self.pid)
            }
            _ => true,
        }
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        let age = now_ms().saturating_sub(self.created_at_ms);
        Duration::from_millis(age) > threshold
    }
}

/// Held commit lock. Dropping it removes the sentinel if it is still ours.
#[derive(Debug)]
pub struct CommitLock {
    path: PathBuf,
    token: String,
}

impl CommitLock {
    /// Tries once to take the lock.
    ///
    /// Returns `Ok(None)` when another writer holds it.
    pub fn try_acquire(path: &Path, stale_after: Duration) -> io::Result<Option<Self>> {
        if let Some(lock) = Self::create(path)? {
            return Ok(Some(lock));
        }

        let Some(judged) = abandoned_sentinel(path, stale_after) else {
            return Ok(None);
        };
        if !set_aside(path, &judged)? {
            return Ok(None);
        }
        Self::create(path)
    }

    /// Whether the sentinel on disk is still the one this lock wrote.
    pub fn is_held(&self) -> bool {
        read_sentinel(&self.path).is_some_and(|s| s.token == self.token)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn create(path: &Path) -> io::Result<Option<Self>> {
        let sentinel = LockSentinel::current();
        match create_sentinel(path, &sentinel) {
            Ok(()) => Ok(Some(Self {
                path: path.to_path_buf(),
                token: sentinel.token,
            })),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for CommitLock {
    fn drop(&mut self) {
        if !self.is_held() {
            warn!(path = %self.path.display(), "Registry lock was taken over, leaving it in place");
            return;
        }
        if let Err(e) = remove_if_exists(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release registry lock");
        }
    }
}

fn create_sentinel(path: &Path, sentinel: &LockSentinel) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let json =
        serde_json::to_vec(sentinel).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    file.write_all(&json)?;
    file.sync_all()
}

fn read_sentinel(path: &Path) -> Option<LockSentinel> {
    fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
}

/// The raw bytes of the sentinel at `path` if it may be taken over.
fn abandoned_sentinel(path: &Path, stale_after: Duration) -> Option<Vec<u8>> {
    let bytes = fs::read(path).ok()?;

    match serde_json::from_slice::<LockSentinel>(&bytes) {
        Ok(existing) if existing.is_stale(stale_after) => {
            warn!(
                pid = existing.pid,
                host = %existing.hostname,
                created_at_ms = existing.created_at_ms,
                "Recovering registry lock (exceeded stale threshold)"
            );
            Some(bytes)
        }
        Ok(existing) if !existing.is_holder_alive() => {
            warn!(pid = existing.pid, "Recovering registry lock (holder PID is dead)");
            Some(bytes)
        }
        Ok(_) => None,
        // Unreadable: either mid-write by its creator or garbage. Only
        // recover once the file itself is old.
        Err(_) => {
            let old = fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .is_some_and(|age| age > stale_after);
            if old {
                debug!(path = %path.display(), "Recovering unreadable registry lock");
            }
            old.then_some(bytes)
        }
    }
}

/// Moves the sentinel at `path` aside if it still has the `judged` content.
///
/// Returns false when the sentinel changed hands in the meantime; in that
/// case the current holder's sentinel is restored.
fn set_aside(path: &Path, judged: &[u8]) -> io::Result<bool> {
    let aside = aside_path(path);
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }

    let moved = fs::read(&aside).unwrap_or_default();
    if moved == judged {
        remove_if_exists(&aside)?;
        return Ok(true);
    }

    debug!(path = %path.display(), "Registry lock changed hands during recovery, restoring it");
    match fs::hard_link(&aside, path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            warn!(path = %path.display(), "Registry lock re-created while restoring a live sentinel");
        }
        Err(e) => return Err(e),
    }
    remove_if_exists(&aside)?;
    Ok(false)
}

fn aside_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}.recovering.{}", name, new_token()))
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn new_token() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Name of this host as the kernel reports it.
///
/// Environment variables are not consulted: batch schedulers often do not
/// export them, which would make every node look like the same host.
fn local_hostname() -> Option<&'static str> {
    static HOSTNAME: OnceLock<Option<String>> = OnceLock::new();
    HOSTNAME
        .get_or_init(|| {
            ["/proc/sys/kernel/hostname", "/etc/hostname"]
                .iter()
                .filter_map(|p| fs::read_to_string(p).ok())
                .map(|name| name.trim().to_string())
                .find(|name| !name.is_empty() && name != UNKNOWN_HOST)
        })
        .as_deref()
}

#[cfg(target_os = "linux")]
fn is_pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn is_pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STALE: Duration = Duration::from_secs(30);

    fn write_sentinel(path: &Path, sentinel: &LockSentinel) -> Vec<u8> {
        let bytes = serde_json::to_vec(sentinel).unwrap();
        fs::write(path, &bytes).unwrap();
        bytes
    }

    fn sentinel(pid: u32, hostname: &str, age_ms: u64) -> LockSentinel {
        LockSentinel {
            pid,
            hostname: hostname.to_string(),
            created_at_ms: now_ms() - age_ms,
            token: new_token(),
        }
    }

    fn lock_dir_entries(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json.lock");

        let lock = CommitLock::try_acquire(&path, STALE).unwrap();
        assert!(lock.is_some());
        assert!(path.exists());
        assert!(lock.as_ref().unwrap().is_held());

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_is_refused_while_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json.lock");

        let _held = CommitLock::try_acquire(&path, STALE).unwrap().unwrap();
        assert!(CommitLock::try_acquire(&path, STALE).unwrap().is_none());
    }

    #[test]
    fn test_stale_sentinel_is_recovered() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json.lock");
        write_sentinel(&path, &sentinel(std::process::id(), "node-a", 120_000));

        let lock = CommitLock::try_acquire(&path, Duration::from_secs(60)).unwrap();
        assert!(lock.is_some());
        // Only the new sentinel remains, the old one is not kept aside.
        assert_eq!(lock_dir_entries(dir.path()), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dead_holder_on_this_host_is_recovered() {
        let Some(host) = local_hostname() else {
            return;
        };
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json.lock");
        write_sentinel(&path, &sentinel(u32::MAX - 1, host, 0));

        assert!(CommitLock::try_acquire(&path, STALE).unwrap().is_some());
    }

    #[test]
    fn test_fresh_sentinel_from_unknown_host_is_respected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json.lock");
        write_sentinel(&path, &sentinel(4_000_000, UNKNOWN_HOST, 0));

        assert!(CommitLock::try_acquire(&path, STALE).unwrap().is_none());
        assert!(path.exists());
    }

    #[test]
    fn test_fresh_sentinel_from_other_host_is_respected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json.lock");
        write_sentinel(&path, &sentinel(4_000_000, "compute-node-17.cluster", 0));

        assert!(CommitLock::try_acquire(&path, STALE).unwrap().is_none());
    }

    #[test]
    fn test_fresh_unreadable_sentinel_is_respected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json.lock");
        fs::write(&path, b"").unwrap();

        assert!(CommitLock::try_acquire(&path, STALE).unwrap().is_none());
    }

    #[test]
    fn test_recovery_does_not_displace_a_new_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json.lock");

        // A writer judged this sentinel abandoned...
        let judged = serde_json::to_vec(&sentinel(1, "node-a", 120_000)).unwrap();
        // ...but another writer recovered it first and now holds the lock.
        let holder = CommitLock::try_acquire(&path, STALE).unwrap().unwrap();
        let held_bytes = fs::read(&path).unwrap();

        assert!(!set_aside(&path, &judged).unwrap());
        assert_eq!(fs::read(&path).unwrap(), held_bytes);
        assert!(holder.is_held());
        assert_eq!(lock_dir_entries(dir.path()), 1);
    }

    #[test]
    fn test_drop_leaves_a_taken_over_sentinel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json.lock");

        let lock = CommitLock::try_acquire(&path, STALE).unwrap().unwrap();
        let successor = write_sentinel(&path, &sentinel(std::process::id(), "node-b", 0));
        assert!(!lock.is_held());

        drop(lock);
        assert_eq!(fs::read(&path).unwrap(), successor);
    }

    #[test]
    fn test_tokens_are_distinct() {
        let dir = TempDir::new().unwrap();
        let a = CommitLock::try_acquire(&dir.path().join("a.lock"), STALE).unwrap().unwrap();
        let b = CommitLock::try_acquire(&dir.path().join("b.lock"), STALE).unwrap().unwrap();
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn test_sentinel_without_token_still_parses() {
        let json = br#"{"pid": 12, "hostname": "node-a", "created_at_ms": 0}"#;
        let parsed: LockSentinel = serde_json::from_slice(json).unwrap();
        assert!(parsed.token.is_empty());
        assert!(parsed.is_stale(STALE));
    }
}
