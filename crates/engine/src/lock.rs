//! Named shared/exclusive locks.
//!
//! Holders in one process are arbitrated by a per-resource
//! `tokio::sync::RwLock`; holders in different processes by `fs2` advisory
//! locks on `<data_dir>/locks/<resource>.lock`. A manager whose lock
//! directory cannot be prepared runs unlocked ([`LockCapability::Disabled`])
//! instead of failing.

use crate::error::LockError;
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// How a lock request waits.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub mode: LockMode,
    /// Give up with [`LockError::Timeout`] after this long.
    pub timeout: Option<Duration>,
    /// Fail with [`LockError::Unavailable`] instead of queuing.
    pub if_available: bool,
    /// Abort the wait with [`LockError::Aborted`] when cancelled.
    pub signal: Option<CancellationToken>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            mode: LockMode::Exclusive,
            timeout: None,
            if_available: false,
            signal: None,
        }
    }
}

impl LockOptions {
    pub fn shared() -> Self {
        Self {
            mode: LockMode::Shared,
            ..Self::default()
        }
    }

    pub fn exclusive() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn if_available(mut self) -> Self {
        self.if_available = true;
        self
    }

    pub fn with_signal(mut self, signal: Option<CancellationToken>) -> Self {
        self.signal = signal;
        self
    }
}

/// What the manager can actually guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockCapability {
    /// In-process and cross-process exclusion.
    CrossProcess,
    /// Only callers sharing this manager are excluded from each other.
    InProcess,
    /// Callbacks run without any locking.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub name: String,
    pub mode: LockMode,
}

/// Diagnostic view of the manager's locks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub held: Vec<LockInfo>,
    pub pending: Vec<LockInfo>,
}

#[derive(Debug, Default)]
struct Registry {
    held: BTreeMap<u64, LockInfo>,
    pending: BTreeMap<u64, LockInfo>,
}

/// Entry in the registry, removed on drop.
#[derive(Debug)]
struct Ticket {
    registry: Arc<Mutex<Registry>>,
    id: u64,
}

impl Ticket {
    fn promote(&self) {
        let mut registry = self.registry.lock();
        if let Some(info) = registry.pending.remove(&self.id) {
            registry.held.insert(self.id, info);
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        registry.pending.remove(&self.id);
        registry.held.remove(&self.id);
    }
}

#[derive(Debug)]
enum LocalGuard {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// A held lock. Released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: Option<File>,
    _local: Option<LocalGuard>,
    _ticket: Option<Ticket>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                tracing::warn!(error = %e, "failed to release lock file");
            }
        }
    }
}

/// Exclusive ownership of an on-disk component (`<dir>/<name>.lock`) for
/// as long as the value lives. Unlike [`LockManager`] locks this never
/// waits: a second owner is refused at once.
#[derive(Debug)]
pub struct OwnerLock {
    file: File,
    path: PathBuf,
}

impl OwnerLock {
    /// Take the lock, or `Ok(None)` if another handle holds it.
    pub fn try_acquire(dir: &Path, name: &str) -> std::io::Result<Option<Self>> {
        let path = dir.join(format!("{name}.lock"));
        let mut opts = OpenOptions::new();
        opts.create(true).read(true).write(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let file = opts.open(&path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "owner lock taken");
                Ok(Some(Self { file, path }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OwnerLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release owner lock");
        }
    }
}

/// Lock manager owned by one database instance.
#[derive(Debug)]
pub struct LockManager {
    capability: LockCapability,
    lock_dir: Option<PathBuf>,
    resources: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    registry: Arc<Mutex<Registry>>,
    next_ticket: AtomicU64,
}

impl LockManager {
    fn with_capability(capability: LockCapability, lock_dir: Option<PathBuf>) -> Self {
        Self {
            capability,
            lock_dir,
            resources: Mutex::new(HashMap::new()),
            registry: Arc::new(Mutex::new(Registry::default())),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn in_process() -> Self {
        Self::with_capability(LockCapability::InProcess, None)
    }

    pub fn disabled() -> Self {
        Self::with_capability(LockCapability::Disabled, None)
    }

    /// Cross-process locking under `<data_dir>/locks`. Degrades to
    /// [`LockCapability::Disabled`] if that directory cannot be created.
    pub fn cross_process(data_dir: &Path) -> Self {
        let dir = data_dir.join("locks");
        match fs::create_dir_all(&dir) {
            Ok(()) => Self::with_capability(LockCapability::CrossProcess, Some(dir)),
            Err(e) => {
                tracing::warn!(
                    dir = %dir.display(),
                    error = %e,
                    "lock directory unavailable, running without locks"
                );
                Self::disabled()
            }
        }
    }

    pub fn capability(&self) -> LockCapability {
        self.capability
    }

    pub fn lock_state(&self) -> LockSnapshot {
        let registry = self.registry.lock();
        LockSnapshot {
            held: registry.held.values().cloned().collect(),
            pending: registry.pending.values().cloned().collect(),
        }
    }

    /// Acquire `resource` according to `options`.
    pub async fn acquire(
        &self,
        resource: &str,
        options: LockOptions,
    ) -> Result<LockGuard, LockError> {
        if self.capability == LockCapability::Disabled {
            return Ok(LockGuard {
                file: None,
                _local: None,
                _ticket: None,
            });
        }
        if options.signal.as_ref().is_some_and(|s| s.is_cancelled()) {
            return Err(LockError::Aborted(resource.to_string()));
        }

        let ticket = self.register(resource, options.mode);
        let start = Instant::now();
        let deadline = options.timeout.map(|t| start + t);

        let local = self.acquire_local(resource, &options, deadline, start).await?;
        let file = match &self.lock_dir {
            Some(dir) => Some(acquire_file(dir, resource, &options, deadline, start).await?),
            None => None,
        };

        ticket.promote();
        tracing::trace!(resource, mode = ?options.mode, "lock acquired");
        Ok(LockGuard {
            file,
            _local: Some(local),
            _ticket: Some(ticket),
        })
    }

    fn register(&self, resource: &str, mode: LockMode) -> Ticket {
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.registry.lock().pending.insert(
            id,
            LockInfo {
                name: resource.to_string(),
                mode,
            },
        );
        Ticket {
            registry: Arc::clone(&self.registry),
            id,
        }
    }

    fn resource(&self, name: &str) -> Arc<RwLock<()>> {
        let mut resources = self.resources.lock();
        Arc::clone(resources.entry(name.to_string()).or_default())
    }

    async fn acquire_local(
        &self,
        resource: &str,
        options: &LockOptions,
        deadline: Option<Instant>,
        start: Instant,
    ) -> Result<LocalGuard, LockError> {
        let rw = self.resource(resource);
        if options.if_available {
            let guard = match options.mode {
                LockMode::Shared => rw.try_read_owned().map(LocalGuard::Read),
                LockMode::Exclusive => rw.try_write_owned().map(LocalGuard::Write),
            };
            return guard.map_err(|_| LockError::Unavailable(resource.to_string()));
        }

        let acquire = async {
            match options.mode {
                LockMode::Shared => LocalGuard::Read(rw.read_owned().await),
                LockMode::Exclusive => LocalGuard::Write(rw.write_owned().await),
            }
        };
        tokio::select! {
            guard = acquire => Ok(guard),
            _ = sleep_until(deadline) => Err(LockError::Timeout {
                resource: resource.to_string(),
                waited_ms: start.elapsed().as_millis() as u64,
            }),
            _ = cancelled(options.signal.as_ref()) => Err(LockError::Aborted(resource.to_string())),
        }
    }

    /// Run `f` while holding `resource`.
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource: &str,
        options: LockOptions,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(resource, options).await?;
        Ok(f().await)
    }

    pub async fn with_read_lock<T, F, Fut>(&self, resource: &str, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.with_lock(resource, LockOptions::shared(), f).await
    }

    pub async fn with_write_lock<T, F, Fut>(&self, resource: &str, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.with_lock(resource, LockOptions::exclusive(), f).await
    }

    /// Run `f` only if `resource` is free right now; `Ok(None)` otherwise.
    pub async fn try_lock<T, F, Fut>(
        &self,
        resource: &str,
        mode: LockMode,
        f: F,
    ) -> Result<Option<T>, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let options = LockOptions {
            mode,
            if_available: true,
            ..LockOptions::default()
        };
        match self.acquire(resource, options).await {
            Ok(_guard) => Ok(Some(f().await)),
            Err(LockError::Unavailable(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn cancelled(signal: Option<&CancellationToken>) {
    match signal {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// `<name>-<crc32>.lock`, keeping the name readable and collision-free.
fn lock_file_name(resource: &str) -> String {
    let sanitized: String = resource
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect();
    format!("{sanitized}-{:08x}.lock", crc32fast::hash(resource.as_bytes()))
}

async fn acquire_file(
    dir: &Path,
    resource: &str,
    options: &LockOptions,
    deadline: Option<Instant>,
    start: Instant,
) -> Result<File, LockError> {
    let path = dir.join(lock_file_name(resource));
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)?;

    loop {
        let attempt = match options.mode {
            LockMode::Shared => FileExt::try_lock_shared(&file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
        };
        match attempt {
            Ok(()) => return Ok(file),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
            Err(e) => return Err(LockError::Io(e)),
        }
        if options.if_available {
            return Err(LockError::Unavailable(resource.to_string()));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(LockError::Timeout {
                resource: resource.to_string(),
                waited_ms: start.elapsed().as_millis() as u64,
            });
        }
        if options.signal.as_ref().is_some_and(|s| s.is_cancelled()) {
            return Err(LockError::Aborted(resource.to_string()));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
