//! Test projects: TOML files naming the test files to load and the settings
//! to load them with.
//!
//! ```toml
//! active_config = "debug"
//! process_model = "Separate"
//!
//! [[config]]
//! name = "debug"
//! appbase = "target/debug"
//! files = ["deps/math_tests", "deps/io_tests"]
//!
//! [config.settings]
//! NumberOfTestWorkers = 2
//!
//! [[config]]
//! name = "release"
//! appbase = "target/release"
//! files = ["deps/math_tests", "deps/io_tests"]
//! ```
//!
//! # Settings
//!
//! | Field | Setting |
//! |-------|---------|
//! | `appbase` (project, then config) | `BasePath` |
//! | `configfile` | `ConfigurationFile` |
//! | `binpath` | `PrivateBinPath` |
//! | `auto_binpath = true` | `AutoBinPath` |
//! | `runtime_framework` | `RuntimeFramework` |
//! | `process_model` | `ProcessModel` |
//! | `domain_usage` | `DomainUsage` |
//!
//! Expanding a project never overwrites a setting the package already has,
//! so command line settings win over the project file.

use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{Service, ServiceContext, ServiceResult, ServiceStatus, StatusCell};
use crate::package::{SettingValue, TestPackage, keys};

/// File extension of test projects.
pub const PROJECT_EXTENSION: &str = "testproj";

/// Result type for project operations.
pub type ProjectResult<T> = Result<T, ProjectError>;

/// Errors raised while loading or expanding projects.
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("Failed to read project {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse project {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Project {project} has no configuration named {name}")]
    UnknownConfig { project: PathBuf, name: String },

    #[error("Package {0} does not name a project file")]
    NotAProject(String),
}

/// A loaded project file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestProject {
    #[serde(skip)]
    path: PathBuf,

    /// Base directory, relative to the project file.
    pub appbase: Option<PathBuf>,

    /// Configuration used when the package names none. Defaults to the
    /// first one.
    pub active_config: Option<String>,

    pub process_model: Option<String>,

    pub domain_usage: Option<String>,

    #[serde(default, rename = "config")]
    pub configs: Vec<ProjectConfig>,
}

/// One named set of test files with its settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub name: String,

    /// Base directory, relative to the project's base.
    pub appbase: Option<PathBuf>,

    pub configfile: Option<String>,

    pub binpath: Option<String>,

    #[serde(default)]
    pub auto_binpath: bool,

    pub runtime_framework: Option<String>,

    /// Test files, relative to the configuration's base directory.
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Any other package settings.
    #[serde(default)]
    pub settings: BTreeMap<String, SettingValue>,
}

impl TestProject {
    /// Parses project text. `path` is where the project lives and anchors
    /// its relative paths.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectError::Parse`] on malformed TOML.
    pub fn parse(path: impl Into<PathBuf>, text: &str) -> ProjectResult<Self> {
        let path = path.into();
        let mut project: TestProject = toml::from_str(text).map_err(|source| ProjectError::Parse {
            path: path.clone(),
            source,
        })?;
        project.path = path;
        Ok(project)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The project's base directory.
    pub fn base_path(&self) -> PathBuf {
        let dir = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        match &self.appbase {
            Some(appbase) => dir.join(appbase),
            None => dir,
        }
    }

    pub fn active_config_name(&self) -> Option<&str> {
        self.active_config
            .as_deref()
            .or_else(|| self.configs.first().map(|c| c.name.as_str()))
    }

    pub fn config(&self, name: &str) -> Option<&ProjectConfig> {
        self.configs.iter().find(|c| c.name == name)
    }

    fn config_base_path(&self, config: &ProjectConfig) -> PathBuf {
        match &config.appbase {
            Some(appbase) => self.base_path().join(appbase),
            None => self.base_path(),
        }
    }

    /// Settings a configuration contributes to its package.
    pub fn config_settings(&self, config: &ProjectConfig) -> BTreeMap<String, SettingValue> {
        let mut settings = config.settings.clone();
        settings.insert(
            keys::BASE_PATH.to_string(),
            self.config_base_path(config).as_path().into(),
        );

        let fields = [
            (keys::CONFIGURATION_FILE, config.configfile.as_deref()),
            (keys::PRIVATE_BIN_PATH, config.binpath.as_deref()),
            (keys::RUNTIME_FRAMEWORK, config.runtime_framework.as_deref()),
            (keys::PROCESS_MODEL, self.process_model.as_deref()),
            (keys::DOMAIN_USAGE, self.domain_usage.as_deref()),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                settings.insert(key.to_string(), value.into());
            }
        }
        if config.auto_binpath {
            settings.insert(keys::AUTO_BIN_PATH.to_string(), true.into());
        }
        settings
    }

    /// The configuration named `name`, or the active one.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectError::UnknownConfig`] when a name is given and no
    /// configuration carries it.
    pub fn resolve_config(&self, name: Option<&str>) -> ProjectResult<Option<&ProjectConfig>> {
        match name {
            Some(name) => self.config(name).map(Some).ok_or_else(|| ProjectError::UnknownConfig {
                project: self.path.clone(),
                name: name.to_string(),
            }),
            None => Ok(self.active_config_name().and_then(|name| self.config(name))),
        }
    }

    /// A package for the project with one sub-package per test file.
    pub fn test_package(&self, config_name: Option<&str>) -> ProjectResult<TestPackage> {
        let mut package = TestPackage::new(&self.path);
        if let Some(name) = config_name {
            package.set(keys::ACTIVE_CONFIG, name);
        }
        self.expand_into(&mut package)?;
        Ok(package)
    }

    fn expand_into(&self, package: &mut TestPackage) -> ProjectResult<()> {
        let requested = package.get_string(keys::ACTIVE_CONFIG);
        let Some(config) = self.resolve_config(requested.as_deref())? else {
            debug!("Project {} has no configurations", self.path.display());
            return Ok(());
        };

        for (key, value) in self.config_settings(config) {
            if !package.contains(&key) {
                package.set(key, value);
            }
        }

        let base = self.config_base_path(config);
        for file in &config.files {
            package.add_sub_package(TestPackage::new(base.join(file)));
        }
        info!(
            "Expanded project {} ({}) into {} files",
            self.path.display(),
            config.name,
            config.files.len()
        );
        Ok(())
    }
}

/// Loads project files and expands project packages.
#[derive(Default)]
pub struct ProjectService {
    status: StatusCell,
}

impl ProjectService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_project_file(&self, path: &Path) -> bool {
        path.extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(PROJECT_EXTENSION))
    }

    /// Reads and parses a project file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is not a valid project.
    pub fn load_project(&self, path: &Path) -> ProjectResult<TestProject> {
        let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let text = std::fs::read_to_string(&path).map_err(|source| ProjectError::Read {
            path: path.clone(),
            source,
        })?;
        TestProject::parse(path, &text)
    }

    /// Adds a sub-package for each file of the package's project, using
    /// the configuration named by `ActiveConfig` or the project's active
    /// one, and copies over project settings the package lacks.
    ///
    /// # Errors
    ///
    /// Fails if the package has no file, the project cannot be loaded, or
    /// the requested configuration does not exist.
    pub fn expand_project_package(&self, package: &mut TestPackage) -> ProjectResult<()> {
        let path = package
            .full_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| ProjectError::NotAProject(package.display_name()))?;
        let project = self.load_project(&path)?;
        project.expand_into(package)
    }

    /// Expands the package itself, or each of its top-level sub-packages,
    /// when it names an existing project file that was not yet expanded.
    pub fn expand_projects(&self, package: &mut TestPackage) -> ProjectResult<()> {
        if self.needs_expansion(package) {
            return self.expand_project_package(package);
        }
        for sub in package.sub_packages_mut() {
            if self.needs_expansion(sub) {
                self.expand_project_package(sub)?;
            }
        }
        Ok(())
    }

    fn needs_expansion(&self, package: &TestPackage) -> bool {
        package.sub_packages().is_empty()
            && package
                .full_name()
                .is_some_and(|path| self.is_project_file(path) && path.is_file())
    }
}

#[async_trait]
impl Service for ProjectService {
    fn name(&self) -> &'static str {
        "ProjectService"
    }

    fn status(&self) -> ServiceStatus {
        self.status.get()
    }

    async fn start_service(&self, _context: &ServiceContext) -> ServiceResult<()> {
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
mod tests {
    use tempfile::TempDir;

    use super::*;

    const PROJECT: &str = r#"
appbase = "build"
process_model = "Separate"

[[config]]
name = "debug"
appbase = "debug"
binpath = "deps"
files = ["deps/math_tests", "deps/io_tests"]

[config.settings]
NumberOfTestWorkers = 2

[[config]]
name = "release"
appbase = "release"
runtime_framework = "net-4.0"
files = ["deps/math_tests"]
"#;

    fn write_project(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_first_config_is_active_by_default() {
        let project = TestProject::parse("/work/suite.testproj", PROJECT).unwrap();
        assert_eq!(project.active_config_name(), Some("debug"));
        assert_eq!(project.base_path(), PathBuf::from("/work/build"));

        let package = project.test_package(None).unwrap();
        assert_eq!(
            package.test_files(),
            vec![
                Path::new("/work/build/debug/deps/math_tests"),
                Path::new("/work/build/debug/deps/io_tests"),
            ]
        );
        assert_eq!(package.get_string(keys::PROCESS_MODEL).as_deref(), Some("Separate"));
        assert_eq!(package.get_string(keys::PRIVATE_BIN_PATH).as_deref(), Some("deps"));
        assert_eq!(package.get_int(keys::NUMBER_OF_TEST_WORKERS, 0), 2);
        assert_eq!(
            package.get_string(keys::BASE_PATH).map(PathBuf::from),
            Some(PathBuf::from("/work/build/debug"))
        );

        // Sub-packages inherit the project settings.
        let first = &package.sub_packages()[0];
        assert_eq!(first.get_string(keys::PROCESS_MODEL).as_deref(), Some("Separate"));
    }

    #[test]
    fn test_named_config_is_used() {
        let project = TestProject::parse("/work/suite.testproj", PROJECT).unwrap();
        let package = project.test_package(Some("release")).unwrap();
        assert_eq!(package.test_files(), vec![Path::new("/work/build/release/deps/math_tests")]);
        assert_eq!(package.get_string(keys::RUNTIME_FRAMEWORK).as_deref(), Some("net-4.0"));
        assert!(!package.contains(keys::PRIVATE_BIN_PATH));

        let err = project.test_package(Some("profile")).unwrap_err();
        assert!(matches!(err, ProjectError::UnknownConfig { ref name, .. } if name == "profile"));
    }

    #[test]
    fn test_package_settings_win_over_project() {
        let dir = TempDir::new().unwrap();
        let path = write_project(dir.path(), "suite.testproj", PROJECT);
        let service = ProjectService::new();

        let mut package = TestPackage::new(&path);
        package.set(keys::PROCESS_MODEL, "Single");
        service.expand_projects(&mut package).unwrap();

        assert_eq!(package.sub_packages().len(), 2);
        assert_eq!(package.get_string(keys::PROCESS_MODEL).as_deref(), Some("Single"));
        assert_eq!(
            package.sub_packages()[1].get_string(keys::PROCESS_MODEL).as_deref(),
            Some("Single")
        );
    }

    #[test]
    fn test_expansion_happens_once() {
        let dir = TempDir::new().unwrap();
        let path = write_project(dir.path(), "suite.testproj", PROJECT);
        let service = ProjectService::new();

        let mut package = TestPackage::new(&path);
        service.expand_projects(&mut package).unwrap();
        service.expand_projects(&mut package).unwrap();
        assert_eq!(package.sub_packages().len(), 2);
    }

    #[test]
    fn test_project_among_plain_files() {
        let dir = TempDir::new().unwrap();
        let path = write_project(dir.path(), "suite.TESTPROJ", PROJECT);
        let service = ProjectService::new();
        assert!(service.is_project_file(&path));
        assert!(!service.is_project_file(Path::new("/work/math_tests")));

        let mut package = TestPackage::from_files([path, dir.path().join("other_tests")]);
        service.expand_projects(&mut package).unwrap();

        assert_eq!(package.sub_packages()[0].sub_packages().len(), 2);
        assert!(package.sub_packages()[1].sub_packages().is_empty());
        assert_eq!(package.test_files().len(), 3);
    }

    #[test]
    fn test_missing_or_malformed_projects() {
        let dir = TempDir::new().unwrap();
        let service = ProjectService::new();

        // A project file that does not exist is left for the driver to
        // report.
        let mut package = TestPackage::new(dir.path().join("absent.testproj"));
        service.expand_projects(&mut package).unwrap();
        assert!(package.sub_packages().is_empty());

        let err = service
            .load_project(&dir.path().join("absent.testproj"))
            .unwrap_err();
        assert!(matches!(err, ProjectError::Read { .. }));

        let bad = write_project(dir.path(), "bad.testproj", "[[config]]\nfiles = 3\n");
        let mut package = TestPackage::new(&bad);
        assert!(matches!(
            service.expand_projects(&mut package),
            Err(ProjectError::Parse { .. })
        ));
    }

    #[test]
    fn test_project_without_configs_adds_nothing() {
        let project = TestProject::parse("/work/empty.testproj", "process_model = \"Single\"\n").unwrap();
        let package = project.test_package(None).unwrap();
        assert!(package.sub_packages().is_empty());
        assert!(!package.contains(keys::PROCESS_MODEL));
    }
}
