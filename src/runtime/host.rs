//! The environment hosting the engine.
//!
//! Selection logic never reads ambient process state to learn which runtime
//! it runs under or which runtimes are installed. It asks a
//! [`HostEnvironment`], which makes "current runtime" a plain input that
//! tests can vary.

use super::{RuntimeFramework, RuntimeResult};
use crate::config::RuntimeConfig;

/// Describes the runtime hosting the engine and the runtimes installed
/// alongside it.
pub trait HostEnvironment: Send + Sync {
    /// The framework the engine itself is running under.
    fn current_framework(&self) -> &RuntimeFramework;

    /// Every framework installed on this machine.
    fn available_frameworks(&self) -> &[RuntimeFramework];

    /// Returns true if some installed framework supports `framework`.
    fn is_available(&self, framework: &RuntimeFramework) -> bool {
        self.available_frameworks()
            .iter()
            .any(|f| f.supports(framework))
    }

    /// Resolves a framework whose CLR version lacks a build number to the
    /// installed framework with the highest matching build.
    ///
    /// Returns `target` unchanged when it already names a build or when
    /// nothing installed supports it.
    fn best_available(&self, target: &RuntimeFramework) -> RuntimeFramework {
        if target.clr_version().build.is_some() {
            return target.clone();
        }

        self.available_frameworks()
            .iter()
            .filter(|f| f.supports(target))
            .max_by_key(|f| f.clr_version().build)
            .cloned()
            .unwrap_or_else(|| target.clone())
    }

    /// True when the engine process is 64-bit.
    fn is_64bit_process(&self) -> bool {
        cfg!(target_pointer_width = "64")
    }
}

/// A host environment described by configuration.
#[derive(Debug, Clone)]
pub struct ConfiguredHost {
    current: RuntimeFramework,
    available: Vec<RuntimeFramework>,
    is_64bit: bool,
}

impl ConfiguredHost {
    /// Creates a host running `current` with the given installed runtimes.
    ///
    /// The current framework is always counted as installed.
    pub fn new(current: RuntimeFramework, available: Vec<RuntimeFramework>) -> Self {
        let mut available = available;
        if !available.contains(&current) {
            available.push(current.clone());
        }
        available.sort();

        Self {
            current,
            available,
            is_64bit: cfg!(target_pointer_width = "64"),
        }
    }

    /// Builds the host from the `[runtime]` configuration section.
    ///
    /// # Errors
    ///
    /// Returns an error if any configured framework string fails to parse.
    pub fn from_config(config: &RuntimeConfig) -> RuntimeResult<Self> {
        let current = RuntimeFramework::parse(&config.current)?;
        let available = config
            .available
            .iter()
            .map(|s| RuntimeFramework::parse(s))
            .collect::<RuntimeResult<Vec<_>>>()?;

        Ok(Self::new(current, available))
    }

    /// Overrides the process bitness.
    pub fn with_64bit(mut self, is_64bit: bool) -> Self {
        self.is_64bit = is_64bit;
        self
    }
}

impl HostEnvironment for ConfiguredHost {
    fn current_framework(&self) -> &RuntimeFramework {
        &self.current
    }

    fn available_frameworks(&self) -> &[RuntimeFramework] {
        &self.available
    }

    fn is_64bit_process(&self) -> bool {
        self.is_64bit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RuntimeType, Version};

    fn fw(s: &str) -> RuntimeFramework {
        RuntimeFramework::parse(s).unwrap()
    }

    #[test]
    fn test_current_is_always_available() {
        let host = ConfiguredHost::new(fw("net-4.0"), vec![fw("net-2.0")]);
        assert!(host.is_available(&fw("net-4.0")));
        assert!(host.is_available(&fw("net-2.0")));
        assert!(!host.is_available(&fw("mono-4.0")));
    }

    #[test]
    fn test_best_available_picks_highest_build() {
        let host = ConfiguredHost::new(
            fw("net-4.0"),
            vec![
                RuntimeFramework::new(RuntimeType::Net, Version::with_build(5, 0, 100)),
                RuntimeFramework::new(RuntimeType::Net, Version::with_build(5, 0, 200)),
            ],
        );

        let target = RuntimeFramework::new(RuntimeType::Net, Version::new(5, 0));
        assert_eq!(target.clr_version().build, None);

        let best = host.best_available(&target);
        assert_eq!(best.clr_version(), Version::with_build(5, 0, 200));

        let pinned = fw("net-4.0");
        assert_eq!(host.best_available(&pinned), pinned);
    }

    #[test]
    fn test_from_config() {
        let config = RuntimeConfig {
            current: "net-4.0".into(),
            available: vec!["net-2.0".into(), "mono-4.0".into()],
            ..Default::default()
        };
        let host = ConfiguredHost::from_config(&config).unwrap();
        assert_eq!(host.current_framework(), &fw("net-4.0"));
        assert_eq!(host.available_frameworks().len(), 3);

        let bad = RuntimeConfig {
            current: "cobol-1.0".into(),
            ..Default::default()
        };
        assert!(ConfiguredHost::from_config(&bad).is_err());
    }
}
