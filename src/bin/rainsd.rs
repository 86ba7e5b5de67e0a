use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use rainsd::config::Config;
use rainsd::log::{level_from_verbosity, Logger};
use rainsd::net::{tls, ListenerUnit, StartupError, Switchboard};
use rainsd::reaper::ReaperUnit;
use rainsd::server::{Server, UnitCommand};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser)]
#[command(version, about = "RAINS server core")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

/// Exit codes distinguish why startup failed, so a process supervisor can
/// tell a bad config/certificate (retrying will not help) from a transient
/// bind failure (the address may free up).
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_BIND_ERROR: u8 = 2;

#[derive(Subcommand)]
enum Command {
    /// Start the server and run until terminated.
    Start {
        /// Path to the TOML configuration file.
        #[arg(long, value_name = "PATH")]
        config: Utf8PathBuf,

        /// Log verbosity: 0 = error, 1 = warn, 2 = info, 3 = debug, 4+ = trace.
        #[arg(long, default_value_t = 2)]
        log_level: u8,
    },
    /// Validate a running server's configuration file and exit without
    /// starting anything; a deployed instance is stopped through its
    /// process supervisor (ctrl-c/SIGTERM), not a remote command.
    Shutdown {
        /// Path to the TOML configuration file to validate.
        #[arg(long, value_name = "PATH")]
        config: Utf8PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match args.command {
        Command::Start { config, log_level } => start(config, log_level).await,
        Command::Shutdown { config } => shutdown(config),
    }
}

fn shutdown(config_path: Utf8PathBuf) -> ExitCode {
    match Config::load(&config_path) {
        Ok(_) => {
            println!("configuration at '{config_path}' is valid; stop the running process directly (ctrl-c/SIGTERM)");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

async fn start(config_path: Utf8PathBuf, log_level: u8) -> ExitCode {
    Logger::launch(level_from_verbosity(log_level));
    tls::install_crypto_provider();

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let server = Server::new(config);
    let switchboard = Arc::new(Switchboard::new(server.clone()));

    let mut unit_commands = Vec::new();

    let (listener_tx, listener_rx) = mpsc::unbounded_channel();
    unit_commands.push(listener_tx);
    let listener = ListenerUnit { server: server.clone() };
    let listener_join = tokio::spawn(async move { listener.run(listener_rx).await });

    let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();
    unit_commands.push(reaper_tx);
    let reaper = ReaperUnit {
        server: server.clone(),
        switchboard: switchboard.clone(),
    };
    let reaper_join = tokio::spawn(async move { reaper.run(reaper_rx).await });

    let handler = server.handler(switchboard);
    let prio_join = tokio::spawn(server.queues.clone().run_priority_worker(handler.clone()));
    let shared_join = tokio::spawn(server.queues.clone().run_shared_worker(handler.clone()));
    let notify_join = tokio::spawn(server.queues.clone().run_notify_worker(handler.clone()));

    info!("rainsd is running, press ctrl-c to stop");
    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to install ctrl-c handler");
    }

    for tx in unit_commands {
        let _ = tx.send(UnitCommand::Terminate);
    }
    let listener_result = listener_join.await;
    let _ = reaper_join.await;
    prio_join.abort();
    shared_join.abort();
    notify_join.abort();

    match listener_result {
        Ok(Err(StartupError::Bind)) => ExitCode::from(EXIT_BIND_ERROR),
        Ok(Err(StartupError::Certificate)) => ExitCode::from(EXIT_CONFIG_ERROR),
        Ok(Err(StartupError::Terminated)) | Ok(Ok(())) | Err(_) => ExitCode::SUCCESS,
    }
}
