//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

pub const PASSING_SCRIPT: &str = r#"#!/bin/sh
if [ "$1" = "--list" ]; then
  echo "math::adds: test"
  echo "math::subtracts: test"
  exit 0
fi
echo "running 2 tests"
echo "test math::adds ... ok"
echo "test math::subtracts ... ok"
echo ""
echo "test result: ok. 2 passed; 0 failed; 0 ignored; 0 measured; 0 filtered out; finished in 0.00s"
"#;

pub const FAILING_SCRIPT: &str = r#"#!/bin/sh
if [ "$1" = "--list" ]; then
  echo "math::adds: test"
  echo "math::divides: test"
  exit 0
fi
echo "running 2 tests"
echo "test math::adds ... ok"
echo "test math::divides ... FAILED"
echo ""
echo "failures:"
echo ""
echo "---- math::divides stdout ----"
echo "attempt to divide by zero"
echo ""
echo "failures:"
echo "    math::divides"
echo ""
echo "test result: FAILED. 1 passed; 1 failed; 0 ignored; 0 measured; 0 filtered out; finished in 0.00s"
exit 101
"#;

/// Writes a shell script that behaves like a libtest binary.
#[cfg(unix)]
pub fn write_test_executable(dir: &Path, name: &str, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Engine config that keeps every cache inside `dir`.
pub fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("testagency.toml");
    let cache = dir.join("cache");
    std::fs::write(
        &path,
        format!(
            r#"
[runtime]
current = "net-4.0"
available = ["net-2.0", "net-4.0"]

[agency]
registration_timeout_secs = 30

[domain]
shadow_copy_path = "{}"
"#,
            cache.display()
        ),
    )
    .unwrap();
    path
}
