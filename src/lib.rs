//! testagency: a test engine that loads test packages and runs them in
//! isolated domains or separate agent processes.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Runtime**: Describe runtime frameworks and pick the one a package needs
//! - **Agency**: Launch, track and hand out agent processes
//! - **Runners**: Decide where a package runs (in process, in a domain, in
//!   an agent) and aggregate the results
//! - **Domains**: Isolated execution contexts with their own working and
//!   shadow-copy directories
//! - **Services**: Start and stop the engine's services in dependency order
//! - **Execution**: Dispatch work items with bounded parallelism
//!
//! ```text
//!                    TestEngine
//!                        │
//!              MasterTestRunner ──► RuntimeFrameworkService
//!                        │
//!          DefaultTestRunnerFactory
//!            │                  │
//!     ProcessRunner     InProcessTestRunnerFactory
//!            │                  │
//!       TestAgency       DirectTestRunner ──► DomainManager
//!            │                  │
//!       test-agent         TestDriver
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use testagency::{Config, TestEngine, TestPackage};
//! use testagency::result::{NullListener, TestFilter};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = testagency::load_config(std::path::Path::new("testagency.toml"))?;
//!     let mut engine = TestEngine::new(config)?;
//!     engine.initialize().await?;
//!
//!     let runner = engine.get_runner(TestPackage::new("tests/math_tests"));
//!     let result = runner.run(Arc::new(NullListener), &TestFilter::empty()).await?;
//!     println!("{} passed", result.summary().passed);
//!
//!     runner.unload().await?;
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod agency;
pub mod agent;
pub mod config;
pub mod domain;
pub mod driver;
pub mod engine;
pub mod execution;
pub mod package;
pub mod report;
pub mod result;
pub mod runner;
pub mod runtime;
pub mod service;

// Re-export commonly used types
pub use agency::TestAgency;
pub use config::{Config, load_config};
pub use engine::TestEngine;
pub use package::{PackageOptions, TestPackage};
pub use result::{Outcome, TestEngineResult, TestEventListener, TestFilter};
pub use runner::{MasterTestRunner, TestEngineRunner};
pub use runtime::{RuntimeFramework, RuntimeFrameworkService};
