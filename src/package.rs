//! Test packages and package settings.
//!
//! A [`TestPackage`] names the test files to load and carries a settings
//! bag of loosely typed values. The bag is the external contract: it is
//! what the CLI fills in, what crosses the wire to agents, and where each
//! selection stage records its decisions. Engine code reads it through the
//! strongly typed [`PackageOptions`] view.
//!
//! # Hierarchy
//!
//! ```text
//! TestPackage (anonymous, settings)
//! ├── TestPackage "a.tests" (inherited settings)
//! └── TestPackage "b.tests" (inherited settings)
//! ```
//!
//! Sub-packages receive a copy of their parent's settings when they are
//! added. Settings written to the parent afterwards stay on the parent.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::runtime::RuntimeFramework;

/// Setting keys understood by the engine.
pub mod keys {
    /// Isolation by process: `Default`, `Single`, `Separate`, `Multiple`.
    pub const PROCESS_MODEL: &str = "ProcessModel";
    /// Isolation by domain: `Default`, `None`, `Single`, `Multiple`.
    pub const DOMAIN_USAGE: &str = "DomainUsage";
    /// Requested or resolved runtime framework string.
    pub const RUNTIME_FRAMEWORK: &str = "RuntimeFramework";
    /// Run the tests in a 32-bit process.
    pub const RUN_AS_X86: &str = "RunAsX86";
    /// Copy test binaries into a cache before running them.
    pub const SHADOW_COPY_FILES: &str = "ShadowCopyFiles";
    /// Overrides the shadow copy cache root.
    pub const CACHE_PATH: &str = "CachePath";
    /// Application base directory for a domain.
    pub const BASE_PATH: &str = "BasePath";
    /// Configuration file for a domain.
    pub const CONFIGURATION_FILE: &str = "ConfigurationFile";
    /// Explicit private bin path for a domain.
    pub const PRIVATE_BIN_PATH: &str = "PrivateBinPath";
    /// Compute the private bin path from the test file locations.
    pub const AUTO_BIN_PATH: &str = "AutoBinPath";
    /// Launch agents paused, waiting for a debugger.
    pub const AGENT_DEBUG: &str = "AgentDebug";
    /// Launch agents with verbose logging.
    pub const VERBOSE: &str = "Verbose";
    /// Upper bound on concurrently running agents.
    pub const MAX_AGENTS: &str = "MaxAgents";
    /// Worker threads used inside each test executable.
    pub const NUMBER_OF_TEST_WORKERS: &str = "NumberOfTestWorkers";
    /// CLR version read from the test binary.
    pub const IMAGE_RUNTIME_VERSION: &str = "ImageRuntimeVersion";
    /// The test binary requires a 32-bit process.
    pub const IMAGE_REQUIRES_X86: &str = "ImageRequiresX86";
    /// Kind of runner a factory built for this package.
    pub const RUNNER_KIND: &str = "RunnerKind";
    /// Project configuration to expand, instead of the project's active one.
    pub const ACTIVE_CONFIG: &str = "ActiveConfig";
}

/// Errors raised while interpreting package settings.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    /// A setting holds a value of the wrong shape.
    #[error("Invalid value '{value}' for setting {key}: {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },
}

/// Result type for package operations.
pub type PackageResult<T> = Result<T, PackageError>;

/// A loosely typed setting value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl SettingValue {
    /// Interprets command line text: booleans and integers are recognized,
    /// anything else stays a string.
    pub fn parse_loose(s: &str) -> Self {
        if let Ok(b) = s.parse::<bool>() {
            SettingValue::Bool(b)
        } else if let Ok(n) = s.parse::<i64>() {
            SettingValue::Int(n)
        } else {
            SettingValue::Str(s.to_string())
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            SettingValue::Int(n) => Some(*n != 0),
            SettingValue::Str(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(n) => Some(*n),
            SettingValue::Str(s) => s.trim().parse().ok(),
            SettingValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(b) => write!(f, "{}", b),
            SettingValue::Int(n) => write!(f, "{}", n),
            SettingValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Bool(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Int(value)
    }
}

impl From<usize> for SettingValue {
    fn from(value: usize) -> Self {
        SettingValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Str(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Str(value)
    }
}

impl From<&Path> for SettingValue {
    fn from(value: &Path) -> Self {
        SettingValue::Str(value.to_string_lossy().into_owned())
    }
}

static NEXT_PACKAGE_ID: AtomicU64 = AtomicU64::new(1);

/// A unit of test-loading work: files plus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPackage {
    id: String,
    name: String,
    full_name: Option<PathBuf>,
    #[serde(default)]
    sub_packages: Vec<TestPackage>,
    #[serde(default)]
    settings: BTreeMap<String, SettingValue>,
}

impl TestPackage {
    /// Creates a package for a single test file.
    ///
    /// Relative paths are made absolute against the current directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let full_name = std::path::absolute(&path).unwrap_or(path);
        let name = full_name
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| full_name.to_string_lossy().into_owned());

        Self {
            id: next_id(),
            name,
            full_name: Some(full_name),
            sub_packages: Vec::new(),
            settings: BTreeMap::new(),
        }
    }

    /// Creates an anonymous package with one sub-package per file.
    pub fn from_files<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut package = Self::anonymous();
        for path in paths {
            package.add_sub_package(TestPackage::new(path));
        }
        package
    }

    /// Creates an empty package without a file.
    pub fn anonymous() -> Self {
        Self {
            id: next_id(),
            name: String::new(),
            full_name: None,
            sub_packages: Vec::new(),
            settings: BTreeMap::new(),
        }
    }

    /// Adds a sub-package, copying over any parent settings it lacks.
    pub fn add_sub_package(&mut self, mut package: TestPackage) {
        for (key, value) in &self.settings {
            package
                .settings
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self.sub_packages.push(package);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> Option<&Path> {
        self.full_name.as_deref()
    }

    pub fn sub_packages(&self) -> &[TestPackage] {
        &self.sub_packages
    }

    pub fn sub_packages_mut(&mut self) -> &mut [TestPackage] {
        &mut self.sub_packages
    }

    /// Name suitable for logs and results.
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            self.name.clone()
        } else {
            let names: Vec<&str> = self.sub_packages.iter().map(|p| p.name()).collect();
            format!("[{}]", names.join(", "))
        }
    }

    /// Leaf test files in order.
    pub fn test_files(&self) -> Vec<&Path> {
        if self.sub_packages.is_empty() {
            self.full_name.as_deref().into_iter().collect()
        } else {
            self.sub_packages
                .iter()
                .flat_map(|p| p.test_files())
                .collect()
        }
    }

    pub fn settings(&self) -> &BTreeMap<String, SettingValue> {
        &self.settings
    }

    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.settings.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.settings.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<SettingValue>) {
        self.settings.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<SettingValue> {
        self.settings.remove(key)
    }

    /// Removes a setting from this package and every sub-package.
    pub fn remove_recursive(&mut self, key: &str) {
        self.settings.remove(key);
        for sub in &mut self.sub_packages {
            sub.remove_recursive(key);
        }
    }

    /// String form of a setting, whatever its stored type.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.settings.get(key).map(|v| v.to_string())
    }

    /// Boolean setting, `default` when absent or not a boolean.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.settings
            .get(key)
            .and_then(SettingValue::as_bool)
            .unwrap_or(default)
    }

    /// Integer setting, `default` when absent or not an integer.
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.settings
            .get(key)
            .and_then(SettingValue::as_int)
            .unwrap_or(default)
    }

    /// Typed view of the settings.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError::InvalidSetting`] for a value that does not
    /// fit its key.
    pub fn options(&self) -> PackageResult<PackageOptions> {
        PackageOptions::from_package(self)
    }
}

fn next_id() -> String {
    NEXT_PACKAGE_ID.fetch_add(1, Ordering::Relaxed).to_string()
}

/// How tests are distributed over processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessModel {
    /// Let the engine decide from runtime compatibility.
    #[default]
    Default,
    /// Run in the engine's own process.
    Single,
    /// Run in one separate agent process.
    Separate,
    /// Run each sub-package in its own agent process.
    Multiple,
}

impl ProcessModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessModel::Default => "Default",
            ProcessModel::Single => "Single",
            ProcessModel::Separate => "Separate",
            ProcessModel::Multiple => "Multiple",
        }
    }
}

impl fmt::Display for ProcessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(ProcessModel::Default),
            "single" | "inprocess" => Ok(ProcessModel::Single),
            "separate" => Ok(ProcessModel::Separate),
            "multiple" => Ok(ProcessModel::Multiple),
            _ => Err(format!("unknown process model '{}'", s)),
        }
    }
}

/// How tests are distributed over isolation domains within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DomainUsage {
    /// One domain, or one per sub-package when there are several.
    #[default]
    Default,
    /// No domain at all: run directly in the host.
    None,
    /// One domain, or one per sub-package when there are several.
    Single,
    /// One domain per sub-package.
    Multiple,
}

impl DomainUsage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainUsage::Default => "Default",
            DomainUsage::None => "None",
            DomainUsage::Single => "Single",
            DomainUsage::Multiple => "Multiple",
        }
    }
}

impl fmt::Display for DomainUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainUsage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(DomainUsage::Default),
            "none" => Ok(DomainUsage::None),
            "single" => Ok(DomainUsage::Single),
            "multiple" => Ok(DomainUsage::Multiple),
            _ => Err(format!("unknown domain usage '{}'", s)),
        }
    }
}

/// Strongly typed view of the settings the engine consumes.
///
/// Absent settings are `None` (or `false` for flags). Conversion from and
/// to the settings bag happens only through [`from_package`] and
/// [`apply_to`].
///
/// [`from_package`]: PackageOptions::from_package
/// [`apply_to`]: PackageOptions::apply_to
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageOptions {
    pub process_model: Option<ProcessModel>,
    pub domain_usage: Option<DomainUsage>,
    pub runtime_framework: Option<RuntimeFramework>,
    pub run_as_x86: bool,
    pub shadow_copy_files: Option<bool>,
    pub cache_path: Option<PathBuf>,
    pub base_path: Option<PathBuf>,
    pub configuration_file: Option<PathBuf>,
    pub private_bin_path: Option<String>,
    pub auto_bin_path: Option<bool>,
    pub agent_debug: bool,
    pub verbose: bool,
    pub max_agents: Option<usize>,
    pub number_of_test_workers: Option<usize>,
}

impl PackageOptions {
    /// Reads the typed options out of a package's settings.
    pub fn from_package(package: &TestPackage) -> PackageResult<Self> {
        let settings = &package.settings;

        Ok(Self {
            process_model: parse_with(settings, keys::PROCESS_MODEL, |s| s.parse())?,
            domain_usage: parse_with(settings, keys::DOMAIN_USAGE, |s| s.parse())?,
            runtime_framework: parse_with(settings, keys::RUNTIME_FRAMEWORK, |s| {
                RuntimeFramework::parse(s).map_err(|e| e.to_string())
            })?,
            run_as_x86: flag(settings, keys::RUN_AS_X86)?.unwrap_or(false),
            shadow_copy_files: flag(settings, keys::SHADOW_COPY_FILES)?,
            cache_path: settings.get(keys::CACHE_PATH).map(|v| PathBuf::from(v.to_string())),
            base_path: settings.get(keys::BASE_PATH).map(|v| PathBuf::from(v.to_string())),
            configuration_file: settings
                .get(keys::CONFIGURATION_FILE)
                .map(|v| PathBuf::from(v.to_string())),
            private_bin_path: settings.get(keys::PRIVATE_BIN_PATH).map(|v| v.to_string()),
            auto_bin_path: flag(settings, keys::AUTO_BIN_PATH)?,
            agent_debug: flag(settings, keys::AGENT_DEBUG)?.unwrap_or(false),
            verbose: flag(settings, keys::VERBOSE)?.unwrap_or(false),
            max_agents: count(settings, keys::MAX_AGENTS)?,
            number_of_test_workers: count(settings, keys::NUMBER_OF_TEST_WORKERS)?,
        })
    }

    /// Writes every present option into the package's settings bag.
    pub fn apply_to(&self, package: &mut TestPackage) {
        if let Some(model) = self.process_model {
            package.set(keys::PROCESS_MODEL, model.as_str());
        }
        if let Some(usage) = self.domain_usage {
            package.set(keys::DOMAIN_USAGE, usage.as_str());
        }
        if let Some(framework) = &self.runtime_framework {
            package.set(keys::RUNTIME_FRAMEWORK, framework.to_string());
        }
        if self.run_as_x86 {
            package.set(keys::RUN_AS_X86, true);
        }
        if let Some(shadow) = self.shadow_copy_files {
            package.set(keys::SHADOW_COPY_FILES, shadow);
        }
        if let Some(path) = &self.cache_path {
            package.set(keys::CACHE_PATH, path.as_path());
        }
        if let Some(path) = &self.base_path {
            package.set(keys::BASE_PATH, path.as_path());
        }
        if let Some(path) = &self.configuration_file {
            package.set(keys::CONFIGURATION_FILE, path.as_path());
        }
        if let Some(bin) = &self.private_bin_path {
            package.set(keys::PRIVATE_BIN_PATH, bin.as_str());
        }
        if let Some(auto) = self.auto_bin_path {
            package.set(keys::AUTO_BIN_PATH, auto);
        }
        if self.agent_debug {
            package.set(keys::AGENT_DEBUG, true);
        }
        if self.verbose {
            package.set(keys::VERBOSE, true);
        }
        if let Some(n) = self.max_agents {
            package.set(keys::MAX_AGENTS, n);
        }
        if let Some(n) = self.number_of_test_workers {
            package.set(keys::NUMBER_OF_TEST_WORKERS, n);
        }
    }

    pub fn process_model(&self) -> ProcessModel {
        self.process_model.unwrap_or_default()
    }

    pub fn domain_usage(&self) -> DomainUsage {
        self.domain_usage.unwrap_or_default()
    }

    /// Shadow copying is on unless explicitly disabled.
    pub fn shadow_copy_files(&self) -> bool {
        self.shadow_copy_files.unwrap_or(true)
    }
}

fn invalid(key: &str, value: &SettingValue, reason: impl Into<String>) -> PackageError {
    PackageError::InvalidSetting {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_with<T>(
    settings: &BTreeMap<String, SettingValue>,
    key: &str,
    parse: impl Fn(&str) -> Result<T, String>,
) -> PackageResult<Option<T>> {
    match settings.get(key) {
        None => Ok(None),
        Some(value) => parse(&value.to_string())
            .map(Some)
            .map_err(|reason| invalid(key, value, reason)),
    }
}

fn flag(settings: &BTreeMap<String, SettingValue>, key: &str) -> PackageResult<Option<bool>> {
    match settings.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| invalid(key, value, "expected a boolean")),
    }
}

fn count(settings: &BTreeMap<String, SettingValue>, key: &str) -> PackageResult<Option<usize>> {
    match settings.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_int()
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| invalid(key, value, "expected a non-negative integer")),
    }
}
