//! In-process isolation domains.
//!
//! A [`TestDomain`] is the boundary tests run inside when they are not sent
//! to a separate process: its own application base, configuration file,
//! private bin path and, optionally, a shadow copy cache that test binaries
//! are copied into before they run.
//!
//! # Unloading
//!
//! ```text
//! unload(domain)
//!   ├─ cancel stop token ───────────► runners finish or stop at their next check
//!   ├─ wait for idle (unload_timeout, 30s by default)
//!   │    └─ timed out: log error, cancel abort token ──► child processes killed
//!   └─ delete shadow copy cache (best effort)
//! ```
//!
//! A domain that does not go idle in time is abandoned rather than retried.
//!
//! # Cache Layout
//!
//! ```text
//! <shadow_copy_root>/<pid>_<ticks>/
//! ```

use std::any::Any;
use std::path::{MAIN_SEPARATOR, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DomainConfig;
use crate::driver::ExecutionContext;
use crate::package::{PackageError, PackageOptions, TestPackage};
use crate::service::{Service, ServiceContext, ServiceResult, ServiceStatus, StatusCell};

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

/// Errors raised while creating domains.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("Invalid cache path {path}: {source}")]
    InvalidCachePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Package(#[from] PackageError),
}

/// How an unload ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// All activity finished in time.
    Clean,
    /// The timeout elapsed; remaining work was killed and the domain left
    /// behind.
    Abandoned,
}

/// Everything needed to set up a domain for a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSetup {
    pub application_name: String,
    pub domain_name: String,
    /// Always ends with the platform directory separator.
    pub application_base: String,
    pub configuration_file: Option<PathBuf>,
    pub private_bin_path: Option<String>,
    pub shadow_copy_files: bool,
    pub cache_path: Option<PathBuf>,
}

impl DomainSetup {
    pub fn application_base_path(&self) -> &Path {
        Path::new(&self.application_base)
    }
}

/// A live isolation domain.
#[derive(Debug)]
pub struct TestDomain {
    setup: DomainSetup,
    workers: Option<usize>,
    stop: CancellationToken,
    abort: CancellationToken,
    active: AtomicUsize,
    idle: Notify,
}

/// Marks a domain busy for as long as it is held.
pub struct ActivityGuard {
    domain: Arc<TestDomain>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if self.domain.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.domain.idle.notify_waiters();
        }
    }
}

impl TestDomain {
    fn new(setup: DomainSetup, workers: Option<usize>) -> Self {
        Self {
            setup,
            workers,
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.setup.domain_name
    }

    pub fn setup(&self) -> &DomainSetup {
        &self.setup
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn is_unloading(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Registers work running inside the domain.
    pub fn enter(self: &Arc<Self>) -> ActivityGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        ActivityGuard {
            domain: Arc::clone(self),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Resolves once no work is running inside the domain.
    pub async fn idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Where drivers run the domain's tests.
    pub fn execution_context(&self) -> ExecutionContext {
        let mut context = ExecutionContext::with_tokens(
            self.setup.application_base.as_str(),
            self.stop.clone(),
            self.abort.clone(),
        );
        context.private_bin_path = self.setup.private_bin_path.clone();
        context.config_file = self.setup.configuration_file.clone();
        context.workers = self.workers;
        if self.setup.shadow_copy_files {
            context.shadow_copy_dir = self.setup.cache_path.clone();
        }
        context
    }
}

/// Creates and unloads test domains.
pub struct DomainManager {
    shadow_copy_root: PathBuf,
    unload_timeout: Duration,
    counter: AtomicUsize,
    status: StatusCell,
}

impl DomainManager {
    pub fn new(shadow_copy_root: impl Into<PathBuf>, unload_timeout: Duration) -> Self {
        Self {
            shadow_copy_root: shadow_copy_root.into(),
            unload_timeout,
            counter: AtomicUsize::new(0),
            status: StatusCell::new(),
        }
    }

    pub fn from_config(config: &DomainConfig) -> Self {
        let root = match &config.shadow_copy_path {
            Some(path) => PathBuf::from(expand_path(path)),
            None => std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
                .unwrap_or_else(std::env::temp_dir)
                .join("ShadowCopyCache"),
        };
        Self::new(root, config.unload_timeout())
    }

    pub fn shadow_copy_root(&self) -> &Path {
        &self.shadow_copy_root
    }

    pub fn unload_timeout(&self) -> Duration {
        self.unload_timeout
    }

    /// Works out the domain setup for a package without creating anything.
    ///
    /// # Errors
    ///
    /// Returns an error if a package setting has the wrong shape.
    pub fn create_domain_setup(&self, package: &TestPackage) -> DomainResult<DomainSetup> {
        let options = PackageOptions::from_package(package)?;
        let ticks = ticks();
        let absolute_files: Vec<PathBuf> = package
            .test_files()
            .into_iter()
            .map(|file| std::path::absolute(file).unwrap_or_else(|_| file.to_path_buf()))
            .collect();
        let files: Vec<&Path> = absolute_files.iter().map(PathBuf::as_path).collect();

        let base = match &options.base_path {
            Some(base) => base.clone(),
            None => match package.full_name() {
                Some(file) => file
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(".")),
                None => get_common_app_base(&files).unwrap_or_else(|| PathBuf::from(".")),
            },
        };
        let base = std::path::absolute(&base).unwrap_or(base);

        let configuration_file = match &options.configuration_file {
            Some(file) => Some(base.join(file)),
            None => package
                .full_name()
                .and_then(Path::file_name)
                .map(|name| base.join(format!("{}.config", name.to_string_lossy()))),
        };

        let private_bin_path = match &options.private_bin_path {
            Some(bin) => Some(bin.clone()),
            None if options.auto_bin_path.unwrap_or(true) => get_private_bin_path(&base, &files),
            None => None,
        };

        let shadow_copy_files = options.shadow_copy_files();
        let cache_path = shadow_copy_files.then(|| {
            options
                .cache_path
                .clone()
                .unwrap_or_else(|| self.shadow_copy_root.clone())
                .join(format!("{}_{}", std::process::id(), ticks))
        });

        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
        let package_name = match package.name() {
            "" => "anonymous",
            name => name,
        };

        Ok(DomainSetup {
            application_name: format!("Tests_{}", ticks),
            domain_name: format!("test-domain-{}-{}", package_name, sequence),
            application_base: with_trailing_separator(&base),
            configuration_file,
            private_bin_path,
            shadow_copy_files,
            cache_path,
        })
    }

    /// Creates a domain for a package, preparing a fresh shadow copy cache.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidCachePath`] if the cache directory
    /// cannot be created.
    pub fn create_domain(&self, package: &TestPackage) -> DomainResult<Arc<TestDomain>> {
        let setup = self.create_domain_setup(package)?;

        if let Some(cache) = &setup.cache_path {
            if cache.exists() {
                debug!("Removing stale cache directory {}", cache.display());
                delete_cache_dir(cache);
            }
            std::fs::create_dir_all(cache).map_err(|source| DomainError::InvalidCachePath {
                path: cache.clone(),
                source,
            })?;
        }

        info!(
            "Created domain {} with base {}",
            setup.domain_name, setup.application_base
        );
        let workers = PackageOptions::from_package(package)?.number_of_test_workers;
        Ok(Arc::new(TestDomain::new(setup, workers)))
    }

    /// Stops all work in a domain and tears it down.
    ///
    /// Waits up to the unload timeout for running work to finish. After
    /// that the abort token is cancelled, which kills any process started
    /// inside the domain, and the domain is abandoned. The shadow copy
    /// cache is deleted either way.
    pub async fn unload(&self, domain: &TestDomain) -> UnloadOutcome {
        debug!("Unloading domain {}", domain.name());
        domain.stop.cancel();

        let outcome = match tokio::time::timeout(self.unload_timeout, domain.idle()).await {
            Ok(()) => UnloadOutcome::Clean,
            Err(_) => {
                error!(
                    "Unable to unload domain {} within {:?}, abandoning it",
                    domain.name(),
                    self.unload_timeout
                );
                domain.abort.cancel();
                UnloadOutcome::Abandoned
            }
        };

        if let Some(cache) = domain.setup.cache_path.clone() {
            let removed = tokio::task::spawn_blocking(move || delete_cache_dir(&cache)).await;
            if let Err(e) = removed {
                warn!("Cache cleanup task failed: {}", e);
            }
        }

        outcome
    }

    /// Removes the whole shadow copy root.
    pub fn delete_shadow_copy_path(&self) {
        if self.shadow_copy_root.exists() {
            delete_cache_dir(&self.shadow_copy_root);
        }
    }
}

#[async_trait]
impl Service for DomainManager {
    fn name(&self) -> &'static str {
        "DomainManager"
    }

    fn status(&self) -> ServiceStatus {
        self.status.get()
    }

    async fn start_service(&self, _context: &ServiceContext) -> ServiceResult<()> {
        debug!("Shadow copy root is {}", self.shadow_copy_root.display());
        self.status.set(ServiceStatus::Started);
        Ok(())
    }

    async fn stop_service(&self) -> ServiceResult<()> {
        self.status.set(ServiceStatus::Stopped);
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Expands `~` and environment variables, leaving the path untouched when
/// a variable is undefined.
fn expand_path(path: &str) -> String {
    match shellexpand::full(path) {
        Ok(expanded) => expanded.into_owned(),
        Err(e) => {
            warn!("Cannot expand {}: {}", path, e);
            shellexpand::tilde(path).into_owned()
        }
    }
}

fn ticks() -> i64 {
    let now = chrono::Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros())
}

fn with_trailing_separator(path: &Path) -> String {
    let mut text = path.display().to_string();
    if !text.ends_with(MAIN_SEPARATOR) {
        text.push(MAIN_SEPARATOR);
    }
    text
}

/// The deepest directory containing every file in `paths`.
pub fn get_common_app_base(paths: &[&Path]) -> Option<PathBuf> {
    let mut dirs = paths.iter().filter_map(|p| p.parent());
    let mut common = dirs.next()?.to_path_buf();

    for dir in dirs {
        while !dir.starts_with(&common) {
            if !common.pop() {
                return None;
            }
        }
    }

    Some(common)
}

/// Directories of `paths` relative to `base`, deduplicated and joined
/// with the platform path list separator.
///
/// Files directly in `base` and files outside it contribute nothing.
/// Returns `None` when nothing remains.
pub fn get_private_bin_path(base: &Path, paths: &[&Path]) -> Option<String> {
    let mut dirs: Vec<PathBuf> = Vec::new();

    for path in paths {
        let Some(dir) = path.parent() else { continue };
        let Ok(relative) = dir.strip_prefix(base) else {
            continue;
        };
        if relative.as_os_str().is_empty() || relative == Path::new(".") {
            continue;
        }
        if !dirs.iter().any(|d| d == relative) {
            dirs.push(relative.to_path_buf());
        }
    }

    if dirs.is_empty() {
        return None;
    }

    std::env::join_paths(&dirs)
        .ok()
        .map(|joined| joined.to_string_lossy().into_owned())
}

/// Recursively deletes a cache directory.
///
/// Read-only files are made writable first. Failures are logged per entry
/// and never stop the rest of the cleanup.
pub fn delete_cache_dir(path: &Path) {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read cache directory {}: {}", path.display(), e);
            return;
        }
    };

    for entry in entries.flatten() {
        let entry_path = entry.path();
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => delete_cache_dir(&entry_path),
            _ => delete_cache_file(&entry_path),
        }
    }

    if let Err(e) = std::fs::remove_dir(path) {
        warn!("Cannot remove cache directory {}: {}", path.display(), e);
    }
}

fn delete_cache_file(path: &Path) {
    if let Ok(metadata) = std::fs::symlink_metadata(path) {
        let mut permissions = metadata.permissions();
        if permissions.readonly() {
            #[allow(clippy::permissions_set_readonly_false)]
            permissions.set_readonly(false);
            if let Err(e) = std::fs::set_permissions(path, permissions) {
                debug!("Cannot clear read-only flag on {}: {}", path.display(), e);
            }
        }
    }

    if let Err(e) = std::fs::remove_file(path) {
        warn!("Cannot delete cached file {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::package::keys;

    fn manager(root: &Path) -> DomainManager {
        DomainManager::new(root, Duration::from_millis(200))
    }

    #[test]
    fn test_shadow_copy_setup() {
        let dir = TempDir::new().unwrap();
        let mut package = TestPackage::new(dir.path().join("bin").join("a.tests"));
        package.set(keys::SHADOW_COPY_FILES, true);

        let setup = manager(&dir.path().join("cache")).create_domain_setup(&package).unwrap();
        assert!(setup.application_base.ends_with(MAIN_SEPARATOR));
        assert!(setup.application_base.contains("bin"));
        assert!(setup.shadow_copy_files);

        let cache = setup.cache_path.unwrap().display().to_string();
        assert!(cache.contains(&std::process::id().to_string()));
        assert_eq!(
            setup.configuration_file,
            Some(dir.path().join("bin").join("a.tests.config"))
        );
    }

    #[test]
    fn test_explicit_settings_win() {
        let dir = TempDir::new().unwrap();
        let mut package = TestPackage::new(dir.path().join("a.tests"));
        package.set(keys::BASE_PATH, dir.path().join("base").as_path());
        package.set(keys::CONFIGURATION_FILE, "custom.config");
        package.set(keys::PRIVATE_BIN_PATH, "lib");
        package.set(keys::SHADOW_COPY_FILES, false);

        let setup = manager(dir.path()).create_domain_setup(&package).unwrap();
        assert!(setup.application_base.contains("base"));
        assert_eq!(
            setup.configuration_file,
            Some(dir.path().join("base").join("custom.config"))
        );
        assert_eq!(setup.private_bin_path.as_deref(), Some("lib"));
        assert_eq!(setup.cache_path, None);
    }

    #[test]
    fn test_domain_names_are_unique() {
        let dir = TempDir::new().unwrap();
        let package = TestPackage::new(dir.path().join("a.tests"));
        let manager = manager(dir.path());

        let first = manager.create_domain_setup(&package).unwrap();
        let second = manager.create_domain_setup(&package).unwrap();
        assert_ne!(first.domain_name, second.domain_name);
        assert!(first.application_name.starts_with("Tests_"));
    }

    #[test]
    fn test_multi_file_package_uses_common_base() {
        let mut package = TestPackage::from_files([
            "/work/tests/unit/a.tests",
            "/work/tests/integration/b.tests",
        ]);
        package.set(keys::SHADOW_COPY_FILES, false);

        let setup = manager(Path::new("/tmp")).create_domain_setup(&package).unwrap();
        let expected = format!("{}{}", Path::new("/work/tests").display(), MAIN_SEPARATOR);
        assert_eq!(setup.application_base, expected);
        assert_eq!(setup.configuration_file, None);

        let bin = setup.private_bin_path.unwrap();
        let parts: Vec<PathBuf> = std::env::split_paths(&bin).collect();
        assert_eq!(parts, vec![PathBuf::from("unit"), PathBuf::from("integration")]);
    }

    #[test]
    fn test_relative_files_resolve_against_current_dir() {
        let mut package = TestPackage::from_files(["unit/a.tests", "integration/b.tests"]);
        package.set(keys::SHADOW_COPY_FILES, false);

        let setup = manager(Path::new("/tmp")).create_domain_setup(&package).unwrap();
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(setup.application_base, with_trailing_separator(&cwd));
        assert_ne!(setup.application_base, MAIN_SEPARATOR.to_string());

        let bin = setup.private_bin_path.unwrap();
        let parts: Vec<PathBuf> = std::env::split_paths(&bin).collect();
        assert_eq!(parts, vec![PathBuf::from("unit"), PathBuf::from("integration")]);
    }

    #[test]
    fn test_private_bin_path_deduplicates() {
        let base = Path::new("/work");
        let a = Path::new("/work/bin/a.tests");
        let b = Path::new("/work/bin/b.tests");
        assert_eq!(get_private_bin_path(base, &[a, b]), Some("bin".to_string()));

        let top = Path::new("/work/c.tests");
        let outside = Path::new("/elsewhere/d.tests");
        assert_eq!(get_private_bin_path(base, &[top, outside]), None);
    }

    #[test]
    fn test_common_app_base() {
        let a = Path::new("/a/b/c/x");
        let b = Path::new("/a/b/d/y");
        assert_eq!(get_common_app_base(&[a, b]), Some(PathBuf::from("/a/b")));
        assert_eq!(get_common_app_base(&[]), None);
    }

    #[test]
    fn test_create_domain_replaces_stale_cache() {
        let dir = TempDir::new().unwrap();
        let mut package = TestPackage::new(dir.path().join("a.tests"));
        package.set(keys::CACHE_PATH, dir.path().join("cache").as_path());

        let domain = manager(dir.path()).create_domain(&package).unwrap();
        let cache = domain.setup().cache_path.clone().unwrap();
        assert!(cache.is_dir());
        assert!(cache.starts_with(dir.path().join("cache")));
    }

    #[tokio::test]
    async fn test_unload_idle_domain_removes_cache() {
        let dir = TempDir::new().unwrap();
        let mut package = TestPackage::new(dir.path().join("a.tests"));
        package.set(keys::CACHE_PATH, dir.path().join("cache").as_path());
        let manager = manager(dir.path());

        let domain = manager.create_domain(&package).unwrap();
        let cache = domain.setup().cache_path.clone().unwrap();
        std::fs::write(cache.join("copy.bin"), b"x").unwrap();
        let mut readonly = std::fs::metadata(cache.join("copy.bin")).unwrap().permissions();
        readonly.set_readonly(true);
        std::fs::set_permissions(cache.join("copy.bin"), readonly).unwrap();

        assert_eq!(manager.unload(&domain).await, UnloadOutcome::Clean);
        assert!(domain.is_unloading());
        assert!(!domain.abort_token().is_cancelled());
        assert!(!cache.exists());
    }

    #[tokio::test]
    async fn test_unload_waits_for_activity() {
        let dir = TempDir::new().unwrap();
        let mut package = TestPackage::new(dir.path().join("a.tests"));
        package.set(keys::SHADOW_COPY_FILES, false);
        let manager = DomainManager::new(dir.path(), Duration::from_secs(5));
        let domain = manager.create_domain(&package).unwrap();

        let guard = domain.enter();
        let stop = domain.stop_token().clone();
        tokio::spawn(async move {
            stop.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert_eq!(manager.unload(&domain).await, UnloadOutcome::Clean);
        assert_eq!(domain.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unload_timeout_aborts() {
        let dir = TempDir::new().unwrap();
        let mut package = TestPackage::new(dir.path().join("a.tests"));
        package.set(keys::SHADOW_COPY_FILES, false);
        let manager = manager(dir.path());
        let domain = manager.create_domain(&package).unwrap();

        let _stuck = domain.enter();
        assert_eq!(manager.unload(&domain).await, UnloadOutcome::Abandoned);
        assert!(domain.abort_token().is_cancelled());
    }

    #[test]
    fn test_execution_context_follows_setup() {
        let dir = TempDir::new().unwrap();
        let mut package = TestPackage::new(dir.path().join("a.tests"));
        package.set(keys::CACHE_PATH, dir.path().join("cache").as_path());
        package.set(keys::NUMBER_OF_TEST_WORKERS, 3usize);

        let domain = manager(dir.path()).create_domain(&package).unwrap();
        let context = domain.execution_context();
        assert_eq!(context.shadow_copy_dir, domain.setup().cache_path);
        assert_eq!(context.workers, Some(3));

        domain.stop_token().cancel();
        assert!(context.stop_token().is_cancelled());
    }
}
