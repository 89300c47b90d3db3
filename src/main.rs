//! pytest-bridge CLI - runs pytest and reports results per test.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use pytest_bridge::artifacts::OutputCopier;
use pytest_bridge::config::{self, BridgeConfig, Config};
use pytest_bridge::discovery::PytestDiscoverer;
use pytest_bridge::report::{ConsoleListener, JUnitListener, print_summary};
use pytest_bridge::runner::PytestRunner;
use pytest_bridge::scope::ScopeTree;
use pytest_bridge::tracker::{ExecutionTracker, TrackerSettings};

#[derive(Parser)]
#[command(name = "pytest-bridge")]
#[command(about = "Run pytest and report results per test", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "pytest-bridge.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log every protocol message
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,

        /// Kill pytest after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Discover tests without running them
    Collect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Errors surface again when the subcommand loads the file.
    let bridge = config::load_config(&cli.config)
        .map(|config| config.bridge)
        .unwrap_or_default();
    let log_level = log_level(cli.verbose, cli.debug, &bridge);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { junit, timeout } => {
            run_tests(&cli.config, junit, timeout, cli.verbose, cli.debug).await
        }
        Commands::Collect { format } => collect_tests(&cli.config, &format).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

/// Tracing level for the command-line flags merged with `[bridge]`.
fn log_level(verbose: bool, debug: bool, bridge: &BridgeConfig) -> Level {
    if debug || bridge.debug {
        Level::TRACE
    } else if verbose || bridge.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    }
}

async fn run_tests(
    config_path: &Path,
    junit_override: Option<PathBuf>,
    timeout_override: Option<u64>,
    verbose: bool,
    debug: bool,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    config.bridge.verbose |= verbose;
    config.bridge.debug |= debug;
    if let Some(timeout) = timeout_override {
        config.pytest.timeout_secs = timeout;
    }

    info!("Loaded configuration from {}", config_path.display());

    let tree = PytestDiscoverer::new(config.pytest.clone()).discover().await?;
    info!(
        "Discovered {} tests in {} groups",
        tree.case_count(),
        tree.groups().len()
    );

    let runner = PytestRunner::new(config.pytest.clone());
    let Some(command) = runner.command_line(&tree)? else {
        println!("No tests to run.");
        return Ok(());
    };

    let settings = TrackerSettings::from(&config.bridge);
    let listener = (
        ConsoleListener::new(settings.is_verbose()),
        create_junit_listener(&config, junit_override),
    );
    let mut tracker = ExecutionTracker::new(tree, listener, settings);
    if let Some(outputs_dir) = &config.pytest.outputs_dir {
        tracker = tracker.with_artifacts(
            OutputCopier::new(outputs_dir),
            runner.working_dir(),
        );
    }

    if let Err(e) = runner.run(&command, &mut tracker).await {
        eprintln!("{} {:#}", console::style("error:").red().bold(), e);
    }

    let summary = tracker.listener().0.summary().clone();
    print_summary(&summary);

    if !summary.success() {
        std::process::exit(1);
    }
    Ok(())
}

fn create_junit_listener(config: &Config, junit_override: Option<PathBuf>) -> Option<JUnitListener> {
    if junit_override.is_none() && !config.report.junit {
        return None;
    }
    let path = junit_override.unwrap_or_else(|| config.report.junit_path());
    Some(JUnitListener::new(path))
}

async fn collect_tests(config_path: &Path, format: &str) -> Result<()> {
    let config = config::load_config(config_path)?;
    let tree = PytestDiscoverer::new(config.pytest).discover().await?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&tree_to_json(&tree))?;
            println!("{}", json);
        }
        _ => {
            println!("Discovered {} tests:", tree.case_count());
            for group in tree.groups() {
                for case in group.cases() {
                    println!("  {}", case.selector().unwrap_or(case.display_name()));
                }
            }
        }
    }

    Ok(())
}

fn tree_to_json(tree: &ScopeTree) -> serde_json::Value {
    let groups: Vec<_> = tree
        .groups()
        .iter()
        .map(|group| {
            let cases: Vec<_> = group
                .cases()
                .iter()
                .map(|case| {
                    serde_json::json!({
                        "name": case.display_name(),
                        "method": case.method_name(),
                        "selector": case.selector(),
                    })
                })
                .collect();
            serde_json::json!({
                "name": group.scope().display_name(),
                "file": group.scope().file(),
                "selector": group.scope().selector(),
                "cases": cases,
            })
        })
        .collect();
    serde_json::json!({ "groups": groups })
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Python: {}", config.pytest.python);
            println!("  Working dir: {}", config.pytest.working_dir.display());
            println!("  Timeout: {}s", config.pytest.timeout_secs);
            if let Some(outputs_dir) = &config.pytest.outputs_dir {
                println!("  Outputs dir: {}", outputs_dir.display());
            }
            if config.report.junit {
                println!("  JUnit report: {}", config.report.junit_path().display());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path) -> Result<()> {
    let config = r#"# pytest-bridge configuration file

[bridge]
verbose = false
debug = false
keep_output_for_passed = false

[pytest]
python = "python3"
working_dir = "."
paths = ["tests"]
plugin_args = ["--gradle"]
args = ""
timeout_secs = 3600
# outputs_dir = "build/pytest-outputs"

[pytest.env]

[report]
output_dir = "test-results"
junit = true
junit_file = "junit.xml"
"#;

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, config)?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  pytest-bridge run");

    Ok(())
}
