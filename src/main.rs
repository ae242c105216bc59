//! testagency CLI - loads test packages and runs them through the engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use testagency::config::{self, Config};
use testagency::package::{DomainUsage, PackageOptions, ProcessModel, SettingValue, TestPackage, keys};
use testagency::report::{self, ConsoleListener};
use testagency::result::{ResultKind, TestEngineResult, TestFilter};
use testagency::TestEngine;
use testagency::runtime::{HostEnvironment, RuntimeFramework, RuntimeFrameworkService};
use testagency::service::ProjectService;

#[derive(Parser)]
#[command(name = "testagency")]
#[command(about = "Test engine with process and domain isolation", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "testagency.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        /// Test files or .testproj project files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        package: PackageArgs,

        /// Only run tests with these names
        #[arg(long = "test")]
        tests: Vec<String>,
    },

    /// List the tests that would run
    Explore {
        /// Test files or .testproj project files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        package: PackageArgs,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show installed runtimes and the runtime each file would use
    Frameworks {
        /// Test files or projects to inspect
        files: Vec<PathBuf>,
    },

    /// Validate configuration file
    Validate,
}

/// Options that become package settings.
#[derive(Args)]
struct PackageArgs {
    /// Process model (default, single, separate, multiple)
    #[arg(long)]
    process: Option<ProcessModel>,

    /// Domain usage (default, none, single, multiple)
    #[arg(long)]
    domain: Option<DomainUsage>,

    /// Target runtime framework, e.g. net-4.0 or mono-2.0
    #[arg(long)]
    framework: Option<String>,

    /// Run in a 32-bit agent
    #[arg(long)]
    x86: bool,

    /// Shadow copy test files before loading them
    #[arg(long)]
    shadow_copy: bool,

    /// Maximum number of agent processes
    #[arg(long)]
    agents: Option<usize>,

    /// Number of test workers inside each test file
    #[arg(long)]
    workers: Option<usize>,

    /// Start agents paused so a debugger can attach
    #[arg(long)]
    debug_agent: bool,

    /// Verbose agent logging
    #[arg(long)]
    agent_verbose: bool,

    /// Seconds to wait for an agent to register (0 waits forever)
    #[arg(long)]
    timeout: Option<u64>,

    /// Project configuration to use instead of the project's active one
    #[arg(long, value_name = "NAME")]
    project_config: Option<String>,

    /// Extra package setting as key=value (repeatable)
    #[arg(long = "setting", value_name = "KEY=VALUE")]
    settings: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            files,
            package,
            tests,
        } => run_tests(&cli.config, &files, &package, tests, cli.verbose).await,
        Commands::Explore {
            files,
            package,
            format,
        } => explore_tests(&cli.config, &files, &package, &format).await,
        Commands::Frameworks { files } => show_frameworks(&cli.config, &files),
        Commands::Validate => validate_config(&cli.config),
    }
}

fn load_engine_config(config_path: &Path, args: &PackageArgs) -> Result<Config> {
    let mut config = config::load_config_or_default(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Some(secs) = args.timeout {
        config.agency.registration_timeout_secs = secs;
    }
    if let Some(agents) = args.agents {
        config.execution.max_agents = Some(agents);
    }

    Ok(config)
}

fn build_package(files: &[PathBuf], args: &PackageArgs) -> Result<TestPackage> {
    let options = PackageOptions {
        process_model: args.process,
        domain_usage: args.domain,
        runtime_framework: args
            .framework
            .as_deref()
            .map(RuntimeFramework::parse)
            .transpose()
            .context("Invalid --framework")?,
        run_as_x86: args.x86,
        shadow_copy_files: args.shadow_copy.then_some(true),
        agent_debug: args.debug_agent,
        verbose: args.agent_verbose,
        max_agents: args.agents,
        number_of_test_workers: args.workers,
        ..PackageOptions::default()
    };

    let mut package = match files {
        [single] => TestPackage::new(single),
        _ => TestPackage::anonymous(),
    };
    options.apply_to(&mut package);
    if let Some(name) = &args.project_config {
        package.set(keys::ACTIVE_CONFIG, name.as_str());
    }

    for setting in &args.settings {
        let Some((key, value)) = setting.split_once('=') else {
            bail!("Invalid setting '{}': expected key=value", setting);
        };
        package.set(key.trim(), SettingValue::parse_loose(value.trim()));
    }

    if files.len() > 1 {
        for file in files {
            package.add_sub_package(TestPackage::new(file));
        }
    }

    Ok(package)
}

async fn start_engine(config: Config) -> Result<TestEngine> {
    let mut engine = TestEngine::new(config).context("Failed to create test engine")?;
    engine
        .initialize()
        .await
        .context("Failed to start test engine")?;
    Ok(engine)
}

async fn run_tests(
    config_path: &Path,
    files: &[PathBuf],
    args: &PackageArgs,
    tests: Vec<String>,
    verbose: bool,
) -> Result<()> {
    let config = load_engine_config(config_path, args)?;
    let package = build_package(files, args)?;
    let filter = TestFilter::from_names(tests);

    info!("Running {}", package.display_name());

    let mut engine = start_engine(config).await?;
    let runner = engine.get_runner(package);
    let listener = Arc::new(ConsoleListener::new(verbose));

    let outcome = runner.run(listener, &filter).await;
    if let Err(e) = runner.unload().await {
        warn!("Failed to unload tests: {}", e);
    }
    engine.shutdown().await;

    let result = outcome.context("Test run failed")?;
    report::print_summary(&result);

    if !result.summary().is_success() {
        std::process::exit(1);
    }

    Ok(())
}

async fn explore_tests(
    config_path: &Path,
    files: &[PathBuf],
    args: &PackageArgs,
    format: &str,
) -> Result<()> {
    let config = load_engine_config(config_path, args)?;
    let package = build_package(files, args)?;

    let mut engine = start_engine(config).await?;
    let runner = engine.get_runner(package);

    let explored = runner.explore(&TestFilter::empty()).await;
    if let Err(e) = runner.unload().await {
        warn!("Failed to unload tests: {}", e);
    }
    engine.shutdown().await;

    let result = explored.context("Failed to explore tests")?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&result)?;
            println!("{}", json);
        }
        _ => {
            let cases = result.cases();
            println!("Found {} tests:", cases.len());
            print_tree(&result, 0);
        }
    }

    Ok(())
}

fn print_tree(node: &TestEngineResult, depth: usize) {
    let indent = "  ".repeat(depth + 1);
    match node.kind {
        ResultKind::Case => println!("{}{}", indent, node.name),
        _ => {
            if !node.name.is_empty() {
                match &node.message {
                    Some(message) if node.children.is_empty() => println!(
                        "{}{} {}",
                        indent,
                        node.name,
                        console::style(format!("({})", message)).red()
                    ),
                    _ => println!("{}{}", indent, console::style(&node.name).bold()),
                }
            }
            for child in &node.children {
                print_tree(child, depth + 1);
            }
        }
    }
}

fn show_frameworks(config_path: &Path, files: &[PathBuf]) -> Result<()> {
    let config = config::load_config_or_default(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let selector = RuntimeFrameworkService::from_config(&config)
        .context("Invalid runtime configuration")?;

    println!("Current runtime: {}", selector.current_framework());
    println!();
    println!("Available runtimes:");
    for framework in selector.host().available_frameworks() {
        println!("  {} ({})", framework, framework.display_name());
    }

    if !files.is_empty() {
        let projects = ProjectService::new();
        println!();
        println!("Selected runtimes:");
        for file in files {
            let mut package = TestPackage::new(file);
            projects
                .expand_projects(&mut package)
                .with_context(|| format!("Failed to load project {}", file.display()))?;
            let target = selector.resolve_runtime_framework(&package);
            println!("  {}: {}", file.display(), target);
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let result = config::load_config(config_path).and_then(|config| {
        RuntimeFrameworkService::from_config(&config)
            .context("Invalid runtime configuration")?;
        Ok(config)
    });

    match result {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Current runtime: {}", config.runtime.current);
            println!("  Available runtimes: {}", config.runtime.available.join(", "));
            println!("  Agency bind: {}", config.agency.bind);
            println!(
                "  Registration timeout: {}s",
                config.agency.registration_timeout_secs
            );
            println!("  Max agents: {}", config.execution.max_agents());
            println!(
                "  Level of parallelism: {}",
                config.execution.level_of_parallelism()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}
