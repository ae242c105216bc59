//! Runtime framework selection for test packages.
//!
//! Given a package, the selector decides which runtime framework its tests
//! must run under:
//!
//! 1. An explicit `RuntimeFramework` setting fixes the version.
//! 2. Otherwise, if image inspection is enabled, the CLR version of every
//!    inspectable test binary is read and the highest one wins.
//! 3. Otherwise the hosting runtime's version is used.
//!
//! A candidate older than the host that is not installed, or has no agent
//! to run it, is promoted to the host's version. A candidate newer than the
//! host is never changed here; launching it fails later instead.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    BinaryImageInspector, ConfiguredHost, HostEnvironment, ImageInfo, PeImageInspector,
    RuntimeFramework, RuntimeResult, RuntimeType, Version,
};
use crate::agency::AgentLocator;
use crate::config::Config;
use crate::package::{TestPackage, keys};
use crate::service::{Service, ServiceContext, ServiceResult, ServiceStatus, StatusCell};

/// Accumulated facts from inspecting a package's binaries.
#[derive(Debug, Default, Clone, Copy)]
struct ImageScan {
    max_version: Option<Version>,
    requires_x86: bool,
}

impl ImageScan {
    fn add(&mut self, info: &ImageInfo) {
        self.requires_x86 |= info.requires_32bit;
        if let Some(version) = info.runtime_version {
            self.max_version = Some(match self.max_version {
                Some(current) => current.max(version),
                None => version,
            });
        }
    }
}

/// Service that resolves the target runtime framework of test packages.
pub struct RuntimeFrameworkService {
    host: Arc<dyn HostEnvironment>,
    inspector: Arc<dyn BinaryImageInspector>,
    locator: Option<Arc<AgentLocator>>,
    inspect_images: bool,
    status: StatusCell,
}

impl RuntimeFrameworkService {
    /// Creates a selector with image inspection enabled and no agent
    /// support check.
    pub fn new(host: Arc<dyn HostEnvironment>, inspector: Arc<dyn BinaryImageInspector>) -> Self {
        Self {
            host,
            inspector,
            locator: None,
            inspect_images: true,
            status: StatusCell::new(),
        }
    }

    /// Builds the selector described by the engine configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured runtime string is malformed.
    pub fn from_config(config: &Config) -> RuntimeResult<Self> {
        let host = ConfiguredHost::from_config(&config.runtime)?;
        Ok(Self::new(Arc::new(host), Arc::new(PeImageInspector))
            .with_agent_locator(Arc::new(AgentLocator::from_config(&config.agency)))
            .with_image_inspection(config.runtime.inspect_images))
    }

    /// Also treat versions without an installed agent as unavailable.
    pub fn with_agent_locator(mut self, locator: Arc<AgentLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn with_image_inspection(mut self, enabled: bool) -> Self {
        self.inspect_images = enabled;
        self
    }

    pub fn host(&self) -> &Arc<dyn HostEnvironment> {
        &self.host
    }

    pub fn current_framework(&self) -> &RuntimeFramework {
        self.host.current_framework()
    }

    /// Returns true if the named framework is installed.
    ///
    /// Malformed names are reported as unavailable.
    pub fn is_available(&self, name: &str) -> bool {
        match RuntimeFramework::parse(name) {
            Ok(framework) => self.host.is_available(&framework),
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Resolves the target framework without touching the package.
    ///
    /// Always agrees with [`select_runtime_framework`](Self::select_runtime_framework)
    /// for the same package.
    pub fn resolve_runtime_framework(&self, package: &TestPackage) -> RuntimeFramework {
        let requested = self.requested_framework(package);
        let scan = self.should_inspect(&requested).then(|| {
            let mut scan = ImageScan::default();
            self.scan_package(package, &mut scan);
            scan
        });

        self.finish(requested, scan)
    }

    /// Resolves the target framework and records the decision.
    ///
    /// Writes the framework string into the `RuntimeFramework` setting and
    /// sets `RunAsX86` when an inspected binary needs a 32-bit process.
    /// Inspected leaf packages get their `ImageRuntimeVersion` and
    /// `ImageRequiresX86` settings.
    pub fn select_runtime_framework(&self, package: &mut TestPackage) -> RuntimeFramework {
        let requested = self.requested_framework(package);
        let scan = self.should_inspect(&requested).then(|| {
            let mut scan = ImageScan::default();
            self.annotate_package(package, &mut scan);
            scan
        });

        if scan.is_some_and(|s| s.requires_x86) {
            package.set(keys::RUN_AS_X86, true);
        }

        let target = self.finish(requested, scan);
        info!(
            "Selected runtime framework {} for {}",
            target,
            package.display_name()
        );
        package.set(keys::RUNTIME_FRAMEWORK, target.to_string());
        target
    }

    fn should_inspect(&self, requested: &RuntimeFramework) -> bool {
        self.inspect_images && requested.allow_any_version()
    }

    fn requested_framework(&self, package: &TestPackage) -> RuntimeFramework {
        let requested = match package.get_string(keys::RUNTIME_FRAMEWORK) {
            Some(name) => RuntimeFramework::parse(&name).unwrap_or_else(|e| {
                warn!("Ignoring requested runtime: {}", e);
                RuntimeFramework::any()
            }),
            None => RuntimeFramework::any(),
        };

        if requested.runtime() == RuntimeType::Any {
            requested.with_runtime(self.current_framework().runtime())
        } else {
            requested
        }
    }

    fn finish(&self, requested: RuntimeFramework, scan: Option<ImageScan>) -> RuntimeFramework {
        if !requested.allow_any_version() {
            return requested;
        }

        let current = self.current_framework();
        let runtime = requested.runtime();
        let candidate = match scan.and_then(|s| s.max_version) {
            Some(version) => RuntimeFramework::new(runtime, version),
            None => RuntimeFramework::new(runtime, current.framework_version()),
        };

        let unusable = !self.host.is_available(&candidate) || !self.agent_supports(&candidate);
        if unusable && candidate.clr_version() < current.clr_version() {
            debug!(
                "Runtime {} is not usable here, promoting to {}",
                candidate,
                current.clr_version()
            );
            return RuntimeFramework::new(runtime, current.clr_version());
        }

        candidate
    }

    fn agent_supports(&self, candidate: &RuntimeFramework) -> bool {
        self.locator.as_ref().is_none_or(|locator| {
            locator.supports_version(
                &candidate.clr_version(),
                &self.current_framework().clr_version(),
            )
        })
    }

    fn inspect_leaf(&self, path: &Path) -> Option<ImageInfo> {
        if !is_inspectable(path) {
            return None;
        }

        let info = self.inspector.inspect(path);
        if info.is_managed_image {
            debug!(
                "Image {} targets {:?} (32-bit required: {})",
                path.display(),
                info.runtime_version,
                info.requires_32bit
            );
            Some(info)
        } else {
            debug!("Skipping {}: not a managed image", path.display());
            None
        }
    }

    fn scan_package(&self, package: &TestPackage, scan: &mut ImageScan) {
        if !package.sub_packages().is_empty() {
            for sub in package.sub_packages() {
                self.scan_package(sub, scan);
            }
        } else if let Some(info) = package.full_name().and_then(|p| self.inspect_leaf(p)) {
            scan.add(&info);
        }
    }

    fn annotate_package(&self, package: &mut TestPackage, scan: &mut ImageScan) {
        if !package.sub_packages().is_empty() {
            for sub in package.sub_packages_mut() {
                self.annotate_package(sub, scan);
            }
            return;
        }

        let Some(info) = package.full_name().and_then(|p| self.inspect_leaf(p)) else {
            return;
        };

        if let Some(version) = info.runtime_version {
            package.set(keys::IMAGE_RUNTIME_VERSION, version.to_string());
        }
        if info.requires_32bit {
            package.set(keys::IMAGE_REQUIRES_X86, true);
        }
        scan.add(&info);
    }
}

fn is_inspectable(path: &Path) -> bool {
    let managed_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("dll") || e.eq_ignore_ascii_case("exe"));

    managed_extension && path.is_file()
}

#[async_trait]
impl Service for RuntimeFrameworkService {
    fn name(&self) -> &'static str {
        "RuntimeFrameworkService"
    }

    fn status(&self) -> ServiceStatus {
        self.status.get()
    }

    async fn start_service(&self, _context: &ServiceContext) -> ServiceResult<()> {
        debug!(
            "Hosting runtime {}, installed: {}",
            self.current_framework(),
            self.host
                .available_frameworks()
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
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

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;

    /// Inspector answering from a fixed table.
    #[derive(Default)]
    pub(crate) struct TableInspector {
        images: HashMap<PathBuf, ImageInfo>,
        calls: AtomicUsize,
    }

    impl TableInspector {
        pub(crate) fn with(mut self, path: PathBuf, info: ImageInfo) -> Self {
            self.images.insert(path, info);
            self
        }
    }

    impl BinaryImageInspector for TableInspector {
        fn inspect(&self, path: &Path) -> ImageInfo {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.images
                .get(path)
                .copied()
                .unwrap_or_else(ImageInfo::negative)
        }
    }

    fn fw(s: &str) -> RuntimeFramework {
        RuntimeFramework::parse(s).unwrap()
    }

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    fn selector(current: &str, available: &[&str], inspector: TableInspector) -> RuntimeFrameworkService {
        let host = ConfiguredHost::new(fw(current), available.iter().map(|s| fw(s)).collect());
        RuntimeFrameworkService::new(Arc::new(host), Arc::new(inspector))
    }

    const V2: Version = Version::with_build(2, 0, 50727);
    const V4: Version = Version::with_build(4, 0, 30319);

    #[test]
    fn test_same_version_everywhere_is_selected() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.dll");
        let b = touch(&dir, "b.dll");
        let inspector = TableInspector::default()
            .with(a.clone(), ImageInfo::managed(V2, false))
            .with(b.clone(), ImageInfo::managed(V2, false));
        let selector = selector("net-4.0", &["net-2.0", "net-4.0"], inspector);

        let mut package = TestPackage::from_files([a, b]);
        let selected = selector.select_runtime_framework(&mut package);
        assert_eq!(selected.clr_version(), V2);
        assert_eq!(selected.runtime(), RuntimeType::Net);
        assert_eq!(package.get_string(keys::RUNTIME_FRAMEWORK).as_deref(), Some("net-2.0"));
    }

    #[test]
    fn test_mixed_versions_select_maximum() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.dll");
        let b = touch(&dir, "b.exe");
        let inspector = TableInspector::default()
            .with(a.clone(), ImageInfo::managed(V4, false))
            .with(b.clone(), ImageInfo::managed(V2, false));
        let selector = selector("net-4.0", &["net-2.0", "net-4.0"], inspector);

        let package = TestPackage::from_files([a, b]);
        assert_eq!(selector.resolve_runtime_framework(&package).clr_version(), V4);
    }

    #[test]
    fn test_explicit_setting_skips_inspection() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.dll");
        let inspector = Arc::new(TableInspector::default().with(a.clone(), ImageInfo::managed(V4, false)));
        let host = ConfiguredHost::new(fw("net-4.0"), vec![fw("net-2.0")]);
        let selector = RuntimeFrameworkService::new(Arc::new(host), inspector.clone());

        let mut package = TestPackage::new(a);
        package.set(keys::RUNTIME_FRAMEWORK, "net-2.0");
        assert_eq!(selector.select_runtime_framework(&mut package), fw("net-2.0"));
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_any_runtime_takes_host_family() {
        let selector = selector("mono-4.0", &[], TableInspector::default());
        let mut package = TestPackage::new("/nowhere/a.dll");
        package.set(keys::RUNTIME_FRAMEWORK, "v4.0");

        let selected = selector.select_runtime_framework(&mut package);
        assert_eq!(selected.runtime(), RuntimeType::Mono);
        assert_eq!(selected.to_string(), "mono-4.0");
    }

    #[test]
    fn test_no_images_fall_back_to_host_version() {
        let dir = TempDir::new().unwrap();
        let native = touch(&dir, "native.dll");
        let selector = selector("net-4.0", &[], TableInspector::default());

        let package = TestPackage::from_files([native, dir.path().join("missing.dll")]);
        assert_eq!(selector.resolve_runtime_framework(&package), fw("net-4.0"));
    }

    #[test]
    fn test_inspection_disabled_uses_host_version() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.dll");
        let inspector = TableInspector::default().with(a.clone(), ImageInfo::managed(V2, false));
        let selector =
            selector("net-4.0", &["net-2.0"], inspector).with_image_inspection(false);

        assert_eq!(selector.resolve_runtime_framework(&TestPackage::new(a)), fw("net-4.0"));
    }

    #[test]
    fn test_unavailable_older_version_is_promoted() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.dll");
        let inspector = TableInspector::default().with(a.clone(), ImageInfo::managed(V2, false));
        let selector = selector("net-4.0", &[], inspector);

        let selected = selector.resolve_runtime_framework(&TestPackage::new(a));
        assert_eq!(selected.clr_version(), V4);
    }

    #[test]
    fn test_unavailable_newer_version_is_kept() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.dll");
        let inspector = TableInspector::default().with(a.clone(), ImageInfo::managed(V4, false));
        let selector = selector("net-2.0", &[], inspector);

        let selected = selector.resolve_runtime_framework(&TestPackage::new(a));
        assert_eq!(selected.clr_version(), V4);
    }

    #[test]
    fn test_x86_requirement_is_recorded() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.dll");
        let b = touch(&dir, "b.dll");
        let inspector = TableInspector::default()
            .with(a.clone(), ImageInfo::managed(V4, true))
            .with(b.clone(), ImageInfo::managed(V4, false));
        let selector = selector("net-4.0", &[], inspector);

        let mut package = TestPackage::from_files([a, b]);
        selector.select_runtime_framework(&mut package);

        assert!(package.get_bool(keys::RUN_AS_X86, false));
        let first = &package.sub_packages()[0];
        assert!(first.get_bool(keys::IMAGE_REQUIRES_X86, false));
        assert_eq!(
            first.get_string(keys::IMAGE_RUNTIME_VERSION).as_deref(),
            Some("4.0.30319")
        );
        assert!(!package.sub_packages()[1].contains(keys::IMAGE_REQUIRES_X86));
    }

    #[test]
    fn test_resolve_agrees_with_select() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.dll");
        let inspector = TableInspector::default().with(a.clone(), ImageInfo::managed(V2, false));
        let selector = selector("net-4.0", &["net-2.0"], inspector);

        let mut package = TestPackage::new(a);
        let before = selector.resolve_runtime_framework(&package);
        assert!(!package.contains(keys::RUNTIME_FRAMEWORK));

        let selected = selector.select_runtime_framework(&mut package);
        assert_eq!(before, selected);
        assert_eq!(selector.resolve_runtime_framework(&package), selected);
        assert_eq!(selector.select_runtime_framework(&mut package), selected);
    }

    #[test]
    fn test_missing_agent_directory_promotes() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.dll");
        let inspector = TableInspector::default().with(
            a.clone(),
            ImageInfo::managed(Version::with_build(1, 1, 4322), false),
        );
        let locator = AgentLocator::new(dir.path(), "test-agent");
        let selector = selector("net-4.0", &["net-1.1", "net-4.0"], inspector)
            .with_agent_locator(Arc::new(locator));

        // net-1.1 is installed, but there is no net-1.1 agent directory.
        let selected = selector.resolve_runtime_framework(&TestPackage::new(a));
        assert_eq!(selected.clr_version(), V4);
    }

    #[test]
    fn test_is_available() {
        let selector = selector("net-4.0", &["net-2.0"], TableInspector::default());
        assert!(selector.is_available("net-2.0"));
        assert!(selector.is_available("v4.0"));
        assert!(!selector.is_available("mono-4.0"));
        assert!(!selector.is_available("garbage-"));
    }
}
