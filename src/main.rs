mod adapters;
mod config;
mod core;
mod ports;

use crate::adapters::cli::console_cli_adapter::ConsoleCliAdapter;
use crate::adapters::config::file_store::TomlFileConfigAdapter;
use crate::adapters::update::fetcher::PackageFetcher;
use crate::adapters::update::orchestrator::UpdateOrchestrator;
use crate::adapters::update::release_source::{
    GitHubReleaseSource, build_http_client, new_release_cache,
};
use crate::adapters::update::rollback::{
    RestoreRequest, WORKER_LOCK_TIMEOUT, WORKER_SUBCOMMAND, WorkerLauncher, run_worker,
};
use crate::config::models::{AppConfig, LogFormat, LoggingConfig};
use crate::core::error::CliError;
use crate::core::types::MessageLevel;
use crate::ports::{ConfigurationStore, UpdateManagerPort};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Self-update and rollback for a file-based deployment", long_about = None)]
struct CliArgs {
    #[clap(long, global = true, value_name = "PATH", help = "Configuration file (default: ./upkeep.toml, then the user config dir)")]
    config: Option<PathBuf>,

    #[clap(long, global = true, action, help = "Print results as JSON")]
    json: bool,

    #[clap(long, global = true, action, help = "Disable colored output")]
    no_color: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the deployed version and the latest published release
    Version,
    /// Check whether a newer release is available
    Check {
        #[clap(long, action, help = "Bypass the cached release information")]
        refresh: bool,
    },
    /// Back up the deployment and install the latest release
    Update,
    /// List available backups, newest first
    Backups,
    /// Restore the deployment from a backup archive
    Rollback {
        #[clap(value_name = "BACKUP_PATH")]
        backup_path: PathBuf,
    },
    /// Manage the configuration file
    #[clap(subcommand)]
    Config(ConfigCommand),
    #[clap(name = WORKER_SUBCOMMAND, hide = true)]
    RollbackWorker(WorkerArgs),
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write the default configuration
    Init {
        #[clap(long, action, help = "Overwrite an existing file")]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[clap(long)]
    archive: PathBuf,
    #[clap(long)]
    deployment_root: PathBuf,
    #[clap(long)]
    scratch_root: PathBuf,
    #[clap(long = "item")]
    items: Vec<String>,
}

fn init_logger_cli(logging_config: &LoggingConfig, terminal_colors_enabled: bool) {
    let env_filter_str = std::env::var("RUST_LOG").unwrap_or_else(|_| logging_config.level.clone());
    let env_filter = EnvFilter::try_new(&env_filter_str).unwrap_or_else(|e| {
        eprintln!("[LOGGER WARN] Failed to parse RUST_LOG/config log level '{env_filter_str}': {e}. Defaulting to 'info'.");
        EnvFilter::new("info")
    });

    let subscriber_builder = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(terminal_colors_enabled)
        .with_target(true);

    match logging_config.format {
        LogFormat::Pretty => {
            let _ = tracing::subscriber::set_global_default(subscriber_builder.pretty().finish());
        }
        LogFormat::Json => {
            let _ = tracing::subscriber::set_global_default(subscriber_builder.json().finish());
        }
        LogFormat::Compact => {
            let _ = tracing::subscriber::set_global_default(subscriber_builder.compact().finish());
        }
    }
    tracing::debug!(
        "Logger initialized with effective filter '{}' and format '{:?}'",
        env_filter_str,
        logging_config.format
    );
}

fn build_orchestrator(
    app_config: &AppConfig,
    config_path: &Path,
) -> Result<UpdateOrchestrator, CliError> {
    let http_client = build_http_client(&app_config.release_source)?;
    let release_source = Arc::new(GitHubReleaseSource::new(
        app_config.release_source.clone(),
        app_config.retry.clone(),
        http_client.clone(),
        new_release_cache(&app_config.release_source),
    ));
    let fetcher = PackageFetcher::new(
        app_config.release_source.clone(),
        app_config.download.clone(),
        app_config.retry.clone(),
        http_client,
    );
    // the worker re-reads the same file for its logging settings
    let worker_config = config_path.exists().then_some(config_path);
    let launcher = WorkerLauncher::current_exe(worker_config)?;

    Ok(UpdateOrchestrator::new(
        app_config,
        release_source,
        fetcher,
        launcher,
    )?)
}

async fn run_command(
    command: Command,
    app_config: &AppConfig,
    config_path: &Path,
    console: &ConsoleCliAdapter,
) -> Result<ExitCode, CliError> {
    if let Command::RollbackWorker(args) = command {
        let request = RestoreRequest {
            archive: args.archive,
            deployment_root: args.deployment_root,
            scratch_root: args.scratch_root,
            fallback_items: args.items,
        };
        info!(
            "Rollback worker {} restoring {}",
            std::process::id(),
            request.archive.display()
        );
        let report = run_worker(request, WORKER_LOCK_TIMEOUT).await?;
        info!(
            "Rollback worker finished: version {} restored ({} items)",
            report.version.as_deref().unwrap_or("unknown"),
            report.restored.len()
        );
        return Ok(ExitCode::SUCCESS);
    }

    let orchestrator = build_orchestrator(app_config, config_path)?;
    match command {
        Command::Version => {
            console.display_version_info(&orchestrator.version_info().await)?;
        }
        Command::Check { refresh } => {
            console.display_update_check(&orchestrator.check_update(refresh).await?)?;
        }
        Command::Update => {
            let result = orchestrator.execute_update().await;
            console.display_update_result(&result)?;
            if !result.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Backups => {
            console.display_backups(&orchestrator.list_backups().await?)?;
        }
        Command::Rollback { backup_path } => {
            let status = orchestrator.rollback(&backup_path).await?;
            console.display_rollback(&backup_path, status)?;
        }
        Command::Config(_) | Command::RollbackWorker(_) => {}
    }
    Ok(ExitCode::SUCCESS)
}

fn init_config(
    config_store: &dyn ConfigurationStore,
    config_path: &Path,
    force: bool,
    console: &ConsoleCliAdapter,
) -> Result<ExitCode, CliError> {
    if config_path.exists() && !force {
        console.display_message(
            &format!(
                "{} already exists; use --force to overwrite it.",
                config_path.display()
            ),
            MessageLevel::Warning,
        );
        return Ok(ExitCode::FAILURE);
    }
    config_store.save_app_config_file(&AppConfig::default(), config_path)?;
    console.display_message(
        &format!("Default configuration written to {}", config_path.display()),
        MessageLevel::Info,
    );
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli_args = CliArgs::parse();

    let config_store: Arc<dyn ConfigurationStore> =
        Arc::new(TomlFileConfigAdapter::new(std::env::current_dir()?));
    let config_path = match &cli_args.config {
        Some(path) => path.clone(),
        None => config::find_config_file()?,
    };

    let app_config = match config_store.load_app_config_file(&config_path) {
        Ok(app_config) => app_config,
        Err(e) => {
            eprintln!("[CRITICAL] Failed to load configuration: {e}. Exiting.");
            return Err(e.into());
        }
    };

    let colors_allowed = app_config.cli.enable_colors && !cli_args.no_color;
    let stdout_colors = colors_allowed && supports_color::on(supports_color::Stream::Stdout).is_some();
    let stderr_colors = colors_allowed && supports_color::on(supports_color::Stream::Stderr).is_some();
    init_logger_cli(&app_config.logging, stderr_colors);

    let console = ConsoleCliAdapter::new(stdout_colors, cli_args.json);

    let outcome = match cli_args.command {
        Command::Config(ConfigCommand::Init { force }) => {
            let target = match &cli_args.config {
                Some(path) => Ok(path.clone()),
                None => config_store.get_default_config_path().map_err(CliError::from),
            };
            match target {
                Ok(target) => init_config(config_store.as_ref(), &target, force, &console),
                Err(e) => Err(e),
            }
        }
        command => run_command(command, &app_config, &config_path, &console).await,
    };

    match outcome {
        Ok(code) => Ok(code),
        Err(e) => {
            error!("{}", e);
            console.display_error(&e);
            Ok(ExitCode::FAILURE)
        }
    }
}
