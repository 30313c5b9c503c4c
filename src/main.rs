//! Conductor CLI entry point

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use conductor::cli::{Cli, Command};
use conductor::config::Config;
use conductor::error::EngineError;
use conductor::exec::{CommandExecutor, ScanChangeTracker};
use conductor::process::Process;
use conductor::scheduler::{ExecuteOptions, Scheduler};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            return ExitCode::from(1);
        }
    };

    let log_path = init_tracing(&config, cli.verbose);

    let code = match run(cli.command, config).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("{} {e}", "error:".red().bold());
            e.exit_code()
        }
    };

    if std::env::var("COPY_LOGS_TO_CWD").map(|v| v == "1").unwrap_or(false)
        && let Some(log_path) = log_path
    {
        let dest = PathBuf::from(log_path.file_name().unwrap_or_default());
        if let Err(e) = std::fs::copy(&log_path, &dest) {
            eprintln!("{} could not copy logs to {}: {e}", "warning:".yellow(), dest.display());
        }
    }

    ExitCode::from(code.clamp(0, u8::MAX as i32) as u8)
}

async fn run(command: Command, config: Config) -> Result<(), EngineError> {
    match command {
        Command::Execute {
            process,
            resume,
            require_resume,
            state_path,
            concurrency,
        } => {
            let process = Process::from_file(&process)?;

            let Some(agent_command) = config.agent_command.clone() else {
                return Err(EngineError::InvalidProcess(
                    "no agent-command configured; set it in the config file".to_string(),
                ));
            };
            let executor = Arc::new(CommandExecutor::new(agent_command, &config.workspace));
            let tracker = Arc::new(ScanChangeTracker::new(&config.workspace));

            let scheduler = Scheduler::new(process, config, executor)
                .with_change_tracker(tracker)
                .with_shutdown(spawn_ctrl_c_watch());

            scheduler
                .execute(ExecuteOptions {
                    resume,
                    require_resume,
                    state_path,
                    concurrency,
                })
                .await?;

            println!("{}", "execution completed".green().bold());
            Ok(())
        }

        Command::Validate { process } => {
            let process = Process::from_file(&process)?;
            println!(
                "{} goal: {}  ({} agents, {} steps)",
                "valid".green().bold(),
                process.goal,
                process.agents.len(),
                process.steps.len()
            );
            Ok(())
        }

        Command::Example { outpath } => {
            let json = serde_json::to_vec_pretty(&Process::example())
                .map_err(|e| EngineError::InvalidProcess(e.to_string()))?;
            std::fs::write(&outpath, json)?;
            println!("{} {}", "wrote".green().bold(), outpath.display());
            Ok(())
        }
    }
}

/// Turn Ctrl-C into the scheduler's cancellation signal
fn spawn_ctrl_c_watch() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping dispatch");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Log to a file under the user data dir; stderr when that fails
fn init_tracing(config: &Config, verbose: bool) -> Option<PathBuf> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { config.log_level.as_str() })
    });

    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("conductor")
        .join("logs");

    if std::fs::create_dir_all(&log_dir).is_ok() {
        let log_path = log_dir.join("conductor.log");
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
            return Some(log_path);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    None
}
