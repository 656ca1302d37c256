#![warn(missing_docs)]

//! jsplay: a sandboxed JavaScript playground host.
//!
//! `jsplay serve` speaks the NDJSON protocol on stdin/stdout for a UI.
//! The other subcommands run scripts and manage packages and preferences
//! from a terminal.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jsplay_config::{CapabilityOverrides, PlaygroundConfig};
use jsplay_sandbox::{
    stringify_for_console, Capabilities, ConsoleEvent, ConsoleLevel, ConsoleSink, ExecutionMode,
    ExecutionResult, FsModuleResolver, HttpBridge, ModuleCache, SandboxConfig,
    SandboxEnvironment, SandboxExecutor,
};
use jsplay_server::http_bridge::{HttpBridgeConfig, ReqwestHttpBridge};
use jsplay_server::packages::{PackageManager, PackageStatus, PackageStatusSink};
use jsplay_server::preferences::PreferencesStore;
use jsplay_server::PlaygroundServer;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jsplay", version, about = "Sandboxed JavaScript playground host")]
struct Cli {
    /// Config file (default: $JSPLAY_CONFIG, then ./jsplay.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the NDJSON protocol on stdin/stdout.
    Serve,
    /// Run a script once and print its result.
    Run {
        /// Script file; `-` or absent reads stdin.
        file: Option<PathBuf>,
        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Manage installed npm packages.
    #[command(subcommand)]
    Packages(PackagesCommand),
    /// Show or reset editor preferences.
    #[command(subcommand)]
    Prefs(PrefsCommand),
}

#[derive(Subcommand)]
enum PackagesCommand {
    /// List installed packages.
    List,
    /// Install a package.
    Install {
        /// Package name.
        name: String,
        /// Version or range.
        #[arg(long)]
        version: Option<String>,
    },
    /// Remove a package.
    Uninstall {
        /// Package name.
        name: String,
    },
}

#[derive(Subcommand)]
enum PrefsCommand {
    /// Print current preferences.
    Show,
    /// Restore the defaults.
    Reset,
}

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(overrides: &jsplay_config::SandboxOverrides) -> Result<SandboxConfig> {
    let mut config = SandboxConfig::default();
    if let Some(ms) = overrides.timeout_ms {
        config.timeout = Duration::from_millis(ms);
    }
    if let Some(heap) = overrides.max_heap_mb {
        config.max_heap_size = heap * 1024 * 1024;
    }
    if let Some(kb) = overrides.max_code_kb {
        config.max_code_size = kb * 1024;
    }
    if let Some(concurrent) = overrides.max_concurrent {
        config.max_concurrent = concurrent;
    }
    if let Some(events) = overrides.max_console_events {
        config.max_console_events = events;
    }
    if let Some(ref mode) = overrides.execution_mode {
        config.execution_mode = mode
            .parse::<ExecutionMode>()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    config.capabilities = build_capabilities(&overrides.capabilities);
    Ok(config)
}

fn build_capabilities(overrides: &CapabilityOverrides) -> Capabilities {
    let defaults = Capabilities::default();
    Capabilities {
        console: overrides.console.unwrap_or(defaults.console),
        require: overrides.require.unwrap_or(defaults.require),
        fetch: overrides.fetch.unwrap_or(defaults.fetch),
        timers: overrides.timers.unwrap_or(defaults.timers),
    }
}

fn build_http_config(http: &jsplay_config::HttpConfig) -> HttpBridgeConfig {
    let mut config = HttpBridgeConfig::default();
    if let Some(secs) = http.timeout_secs {
        config.timeout = Duration::from_secs(secs);
    }
    if let Some(kb) = http.max_body_kb {
        config.max_body_bytes = kb * 1024;
    }
    if let Some(ref agent) = http.user_agent {
        config.user_agent = agent.clone();
    }
    config.allowed_hosts = http.allowed_hosts.clone();
    config
}

/// Locate the config file.
///
/// Search order:
/// 1. `--config` on the command line
/// 2. `JSPLAY_CONFIG` environment variable
/// 3. `./jsplay.toml` in the current directory
/// 4. None (defaults everywhere, not an error)
fn find_config_file(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }

    if let Ok(path) = std::env::var("JSPLAY_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("jsplay.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

fn load_config(explicit: Option<PathBuf>) -> Result<PlaygroundConfig> {
    match find_config_file(explicit) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            PlaygroundConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok(PlaygroundConfig::from_toml("")?)
        }
    }
}

fn package_manager(config: &PlaygroundConfig, cache: Arc<ModuleCache>) -> PackageManager {
    let manager = PackageManager::new(config.packages_dir(), cache);
    match &config.packages.npm_command {
        Some(npm) => manager.with_npm_command(npm.clone()),
        None => manager,
    }
}

/// Prints console calls of a one-shot run: log/info/debug to stdout,
/// warn/error to stderr.
struct TerminalConsole;

impl ConsoleSink for TerminalConsole {
    fn emit(&self, event: ConsoleEvent) {
        let line = event.args.join(" ");
        match event.level {
            ConsoleLevel::Warn | ConsoleLevel::Error => eprintln!("{line}"),
            ConsoleLevel::Log | ConsoleLevel::Info | ConsoleLevel::Debug => println!("{line}"),
        }
    }
}

/// Prints package progress to stderr.
struct TerminalStatus;

impl PackageStatusSink for TerminalStatus {
    fn report(&self, status: PackageStatus) {
        eprintln!("{}", status.message);
    }
}

fn read_source(file: Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display())),
        _ => {
            let mut source = String::new();
            std::io::stdin()
                .read_to_string(&mut source)
                .context("failed to read script from stdin")?;
            Ok(source)
        }
    }
}

#[cfg(feature = "metrics")]
fn with_metrics(
    executor: SandboxExecutor,
) -> (SandboxExecutor, prometheus_client::registry::Registry) {
    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(jsplay_sandbox::metrics::SandboxMetrics::new(&mut registry));
    (executor.with_metrics(metrics), registry)
}

#[cfg(feature = "metrics")]
fn log_metrics(registry: &prometheus_client::registry::Registry) {
    let mut text = String::new();
    match prometheus_client::encoding::text::encode(&mut text, registry) {
        Ok(()) => tracing::info!(metrics = %text, "sandbox metrics at shutdown"),
        Err(e) => tracing::warn!(error = %e, "failed to encode metrics"),
    }
}

async fn serve(config: PlaygroundConfig) -> Result<()> {
    let sandbox_config = build_sandbox_config(&config.sandbox)?;
    let capabilities = sandbox_config.capabilities;
    let executor = SandboxExecutor::new(sandbox_config);
    #[cfg(feature = "metrics")]
    let (executor, registry) = with_metrics(executor);

    let cache = Arc::new(ModuleCache::new());
    let packages = package_manager(&config, cache);
    let preferences = PreferencesStore::new(config.preferences_path());

    let mut server = PlaygroundServer::new(executor, preferences, packages);
    if capabilities.fetch {
        let bridge = ReqwestHttpBridge::new(build_http_config(&config.http))?;
        server = server.with_http(Arc::new(bridge));
    }

    tracing::info!(
        packages = %config.packages_dir().display(),
        preferences = %config.preferences_path().display(),
        ?capabilities,
        "jsplay host starting"
    );

    let server = Arc::new(server);
    let serving = server.serve(tokio::io::stdin(), tokio::io::stdout());
    tokio::pin!(serving);

    tokio::select! {
        result = &mut serving => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal, stopping");
        }
    }

    #[cfg(feature = "metrics")]
    log_metrics(&registry);

    Ok(())
}

async fn run(config: PlaygroundConfig, file: Option<PathBuf>, json: bool) -> Result<bool> {
    let source = read_source(file)?;
    let sandbox_config = build_sandbox_config(&config.sandbox)?;
    let fetch = sandbox_config.capabilities.fetch;
    let executor = SandboxExecutor::new(sandbox_config);

    let modules = FsModuleResolver::new(config.packages_dir(), Arc::new(ModuleCache::new()));
    let mut env = SandboxEnvironment::new(Arc::new(TerminalConsole)).with_modules(Arc::new(modules));
    if fetch {
        let bridge: Arc<dyn HttpBridge> =
            Arc::new(ReqwestHttpBridge::new(build_http_config(&config.http))?);
        env = env.with_http(bridge);
    }

    let result = executor.execute(&source, env).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        match &result {
            ExecutionResult::Success { value } => println!("{}", stringify_for_console(value)),
            ExecutionResult::Failure { message, .. } => eprintln!("{message}"),
        }
    }
    Ok(result.is_success())
}

async fn packages(config: PlaygroundConfig, command: PackagesCommand) -> Result<()> {
    let manager = package_manager(&config, Arc::new(ModuleCache::new()));
    match command {
        PackagesCommand::List => {
            let installed = manager.installed()?;
            if installed.is_empty() {
                eprintln!("no packages installed in {}", manager.root().display());
            }
            for (name, version) in installed {
                println!("{name}@{version}");
            }
        }
        PackagesCommand::Install { name, version } => {
            let installed = manager
                .install(&name, version.as_deref(), &TerminalStatus)
                .await?;
            println!("{}@{}", installed.name, installed.version);
        }
        PackagesCommand::Uninstall { name } => {
            manager.uninstall(&name, &TerminalStatus).await?;
        }
    }
    Ok(())
}

fn prefs(config: PlaygroundConfig, command: PrefsCommand) -> Result<()> {
    let store = PreferencesStore::new(config.preferences_path());
    match command {
        PrefsCommand::Show => {}
        PrefsCommand::Reset => {
            if !store.reset() {
                anyhow::bail!("failed to write {}", store.path().display());
            }
        }
    }
    println!("{}", serde_json::to_string_pretty(&store.get())?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries protocol frames and script output; logs go to stderr
    let default_level = match cli.command {
        Command::Serve => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config)?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Run { file, json } => {
            if !run(config, file, json).await? {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Packages(command) => packages(config, command).await,
        Command::Prefs(command) => prefs(config, command),
    }
}
