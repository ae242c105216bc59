//! Runtime framework identification.
//!
//! A [`RuntimeFramework`] names the runtime family and version a test
//! package must execute under. Frameworks are immutable values: they are
//! parsed from package settings, derived from binary image inspection, or
//! reported by the [`HostEnvironment`] the engine runs in.
//!
//! # String Format
//!
//! | Form | Meaning |
//! |------|---------|
//! | `net-4.0` | Runtime family and framework version |
//! | `mono-2.0.50727` | Runtime family and CLR version |
//! | `v4.0` | Any runtime family, framework version 4.0 |
//! | `net` | The `net` family, any version |
//! | `4.0` | Same as `v4.0` |
//!
//! Formatting a parsed framework produces the canonical short form, so
//! `RuntimeFramework::parse(&fw.to_string())` yields `fw` again.
//!
//! # Version Mapping
//!
//! Two-part versions are framework versions and map onto the CLR version
//! that hosts them (`2.0`, `3.0` and `3.5` all run on CLR `2.0.50727`).
//! Versions with a build number are CLR versions and map back onto the
//! `major.minor` framework version.

pub mod host;
pub mod image;
pub mod service;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use host::{ConfiguredHost, HostEnvironment};
pub use image::{BinaryImageInspector, ImageInfo, PeImageInspector};
pub use service::RuntimeFrameworkService;

/// Errors raised while parsing runtime identifiers.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The framework string could not be parsed.
    #[error("Invalid runtime framework: {0}")]
    InvalidFramework(String),

    /// The version string could not be parsed.
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// The runtime family name is not recognized.
    #[error("Unknown runtime type: {0}")]
    UnknownRuntime(String),
}

/// Result type for runtime parsing.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Runtime families a test package can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Matches any runtime family.
    Any,
    /// Microsoft .NET Framework.
    Net,
    /// Mono.
    Mono,
    /// .NET Compact Framework.
    NetCF,
    /// Silverlight.
    Silverlight,
}

impl RuntimeType {
    /// Returns the lowercase token used in framework strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeType::Any => "any",
            RuntimeType::Net => "net",
            RuntimeType::Mono => "mono",
            RuntimeType::NetCF => "netcf",
            RuntimeType::Silverlight => "silverlight",
        }
    }

    fn display_name(&self) -> &'static str {
        match self {
            RuntimeType::Any => "Any",
            RuntimeType::Net => "Net",
            RuntimeType::Mono => "Mono",
            RuntimeType::NetCF => "NetCF",
            RuntimeType::Silverlight => "Silverlight",
        }
    }
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeType {
    type Err = RuntimeError;

    fn from_str(s: &str) -> RuntimeResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(RuntimeType::Any),
            "net" => Ok(RuntimeType::Net),
            "mono" => Ok(RuntimeType::Mono),
            "netcf" => Ok(RuntimeType::NetCF),
            "silverlight" => Ok(RuntimeType::Silverlight),
            _ => Err(RuntimeError::UnknownRuntime(s.to_string())),
        }
    }
}

/// A dotted version number with optional build and revision parts.
///
/// Ordering treats a missing part as lower than any present part, so
/// `4.0 < 4.0.0 < 4.0.30319`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub build: Option<u32>,
    pub revision: Option<u32>,
}

impl Version {
    /// Sentinel meaning "no particular version".
    pub const DEFAULT: Version = Version::new(0, 0);

    pub const fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            build: None,
            revision: None,
        }
    }

    pub const fn with_build(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build: Some(build),
            revision: None,
        }
    }

    /// Returns true for the `0.0` sentinel.
    pub fn is_default(&self) -> bool {
        *self == Self::DEFAULT
    }

    /// Returns only the `major.minor` part.
    pub fn major_minor(&self) -> Version {
        Version::new(self.major, self.minor)
    }

    /// Loose comparison used when matching installed runtimes.
    ///
    /// Major and minor must be equal. Build and revision only have to be
    /// equal when both sides specify them.
    pub fn matches(&self, other: &Version) -> bool {
        fn part(a: Option<u32>, b: Option<u32>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }

        self.major == other.major
            && self.minor == other.minor
            && part(self.build, other.build)
            && part(self.revision, other.revision)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if let Some(build) = self.build {
            write!(f, ".{}", build)?;
            if let Some(revision) = self.revision {
                write!(f, ".{}", revision)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = RuntimeError;

    /// Parses `major.minor[.build[.revision]]`, with an optional leading `v`.
    fn from_str(s: &str) -> RuntimeResult<Self> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        let parts = digits
            .split('.')
            .map(|p| p.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| RuntimeError::InvalidVersion(s.to_string()))?;

        match parts.as_slice() {
            [major, minor] => Ok(Version::new(*major, *minor)),
            [major, minor, build] => Ok(Version::with_build(*major, *minor, *build)),
            [major, minor, build, revision] => Ok(Version {
                major: *major,
                minor: *minor,
                build: Some(*build),
                revision: Some(*revision),
            }),
            _ => Err(RuntimeError::InvalidVersion(s.to_string())),
        }
    }
}

/// A runtime family together with its framework and CLR versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeFramework {
    runtime: RuntimeType,
    framework_version: Version,
    clr_version: Version,
}

impl RuntimeFramework {
    /// Creates a framework from a runtime family and a version.
    ///
    /// A version without a build number is taken as a framework version;
    /// anything longer is taken as a CLR version.
    pub fn new(runtime: RuntimeType, version: Version) -> Self {
        if version.build.is_none() {
            Self {
                runtime,
                framework_version: version,
                clr_version: clr_for_framework(runtime, version),
            }
        } else {
            let framework_version = if runtime == RuntimeType::Mono && version.major == 1 {
                Version::new(1, 0)
            } else {
                version.major_minor()
            };
            Self {
                runtime,
                framework_version,
                clr_version: version,
            }
        }
    }

    /// A framework that matches any runtime family and version.
    pub fn any() -> Self {
        Self::new(RuntimeType::Any, Version::DEFAULT)
    }

    /// Parses a framework string such as `net-4.0`, `v2.0` or `mono`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidFramework`] when the string names no
    /// known runtime family or carries a malformed version.
    pub fn parse(s: &str) -> RuntimeResult<Self> {
        let trimmed = s.trim();
        let invalid = || RuntimeError::InvalidFramework(s.to_string());

        if trimmed.is_empty() {
            return Err(invalid());
        }

        if let Some((runtime, version)) = trimmed.split_once('-') {
            let runtime = runtime.parse::<RuntimeType>().map_err(|_| invalid())?;
            let version = version.parse::<Version>().map_err(|_| invalid())?;
            return Ok(Self::new(runtime, version));
        }

        if let Ok(runtime) = trimmed.parse::<RuntimeType>() {
            return Ok(Self::new(runtime, Version::DEFAULT));
        }

        let version = trimmed.parse::<Version>().map_err(|_| invalid())?;
        Ok(Self::new(RuntimeType::Any, version))
    }

    pub fn runtime(&self) -> RuntimeType {
        self.runtime
    }

    pub fn framework_version(&self) -> Version {
        self.framework_version
    }

    pub fn clr_version(&self) -> Version {
        self.clr_version
    }

    /// True when no particular version was requested.
    pub fn allow_any_version(&self) -> bool {
        self.framework_version.is_default()
    }

    /// Returns a copy with the runtime family replaced.
    pub fn with_runtime(&self, runtime: RuntimeType) -> Self {
        Self {
            runtime,
            ..self.clone()
        }
    }

    /// Returns true if code built for `target` can run on this framework.
    pub fn supports(&self, target: &RuntimeFramework) -> bool {
        if self.runtime != RuntimeType::Any
            && target.runtime != RuntimeType::Any
            && self.runtime != target.runtime
        {
            return false;
        }

        if self.allow_any_version() || target.allow_any_version() {
            return true;
        }

        self.clr_version.matches(&target.clr_version)
            && self.framework_version.major >= target.framework_version.major
            && self.framework_version.minor >= target.framework_version.minor
    }

    /// Human readable name, e.g. `Net 4.0`.
    pub fn display_name(&self) -> String {
        if self.allow_any_version() {
            self.runtime.display_name().to_string()
        } else {
            format!(
                "{} {}",
                self.runtime.display_name(),
                self.framework_version
            )
        }
    }
}

impl Default for RuntimeFramework {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for RuntimeFramework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.allow_any_version() {
            f.write_str(self.runtime.as_str())
        } else if self.runtime == RuntimeType::Any {
            write!(f, "v{}", self.framework_version)
        } else {
            write!(f, "{}-{}", self.runtime, self.framework_version)
        }
    }
}

impl PartialOrd for RuntimeFramework {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RuntimeFramework {
    fn cmp(&self, other: &Self) -> Ordering {
        self.framework_version
            .cmp(&other.framework_version)
            .then_with(|| self.clr_version.cmp(&other.clr_version))
            .then_with(|| self.runtime.cmp(&other.runtime))
    }
}

impl FromStr for RuntimeFramework {
    type Err = RuntimeError;

    fn from_str(s: &str) -> RuntimeResult<Self> {
        Self::parse(s)
    }
}

fn clr_for_framework(runtime: RuntimeType, version: Version) -> Version {
    if version.is_default() {
        return version;
    }

    match (runtime, version.major, version.minor) {
        (RuntimeType::Silverlight, major, _) if major >= 4 => Version::with_build(4, 0, 60310),
        (RuntimeType::Silverlight, _, _) => Version::with_build(2, 0, 50727),
        (RuntimeType::Mono, 1, _) => Version::with_build(1, 1, 4322),
        (_, 1, 0) => Version::with_build(1, 0, 3705),
        (_, 1, 1) => Version::with_build(1, 1, 4322),
        (_, 2, _) | (_, 3, _) => Version::with_build(2, 0, 50727),
        (_, 4, _) => Version::with_build(4, 0, 30319),
        _ => version,
    }
}
