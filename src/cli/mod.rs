// CLI module - foreground supervision and config checking

mod output;

pub use output::{config_table, print_info, print_success_msg, status_table};

use crate::config::ProcessConfig;
use crate::error::{Result, WardenError};
use crate::process::{StatusReport, Supervisor, SupervisorHandle};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

/// Warden - keeps one process alive
#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise the configured process in the foreground
    ///
    /// SIGHUP restarts the process, SIGUSR1 prints its status to stderr,
    /// SIGINT and SIGTERM stop it and exit.
    Run {
        /// Path to a .toml or .json config file
        config: PathBuf,

        /// Print the final status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a config file and print the resolved settings
    Check {
        /// Path to a .toml or .json config file
        config: PathBuf,
    },
}

impl Cli {
    /// Execute the parsed command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { config, json } => run(&config, json).await,
            Commands::Check { config } => check(&config),
        }
    }
}

async fn run(path: &Path, json: bool) -> Result<()> {
    let config = ProcessConfig::from_file(path)?;
    let autostart = config.autostart;

    info!(name = %config.name, "supervising {}", config.script.display());
    let handle = Supervisor::new(config).spawn().await?;

    if !autostart {
        print_info("autostart is off; send SIGHUP to start the process");
    }

    let status = wait_for_shutdown(&handle).await?;

    if json {
        let rendered = serde_json::to_string_pretty(&status)
            .map_err(|e| WardenError::Serialization(e.to_string()))?;
        println!("{}", rendered);
    } else {
        println!("{}", status_table(&status));
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(handle: &SupervisorHandle) -> Result<StatusReport> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, restarting process");
                handle.restart().await?;
            }
            _ = sigusr1.recv() => {
                eprintln!("{}", status_table(&handle.status().await?));
            }
        }
    }

    handle.shutdown().await
}

#[cfg(not(unix))]
async fn wait_for_shutdown(handle: &SupervisorHandle) -> Result<StatusReport> {
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C, shutting down");
    handle.shutdown().await
}

fn check(path: &Path) -> Result<()> {
    let config = ProcessConfig::from_file(path)?;

    print_success_msg(&format!("{} is valid", path.display()));
    println!("{}", config_table(&config)?);

    Ok(())
}
