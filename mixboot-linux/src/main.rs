// mixboot: bring a mixnet client from cold start to a usable session, then serve or send.

mod bootstrap;
mod channel;
mod config;
mod error;
mod gate;
mod gateway;
mod identity_resolver;
mod ndf_resolver;
mod server;
mod session;
mod state;
#[cfg(test)]
mod testing;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use mixboot_core::single_use::Endpoints;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::bootstrap::{definition_source, run_sender, run_server};
use crate::config::Config;
use crate::error::{BootstrapError, Stage};
use crate::gateway::GatewayFactory;

#[derive(Parser)]
#[command(name = "mixboot", version, about = "Mixnet client bootstrap daemon")]
struct Cli {
    /// Config file (default: ~/.config/mixboot/config.toml, then /etc/mixboot/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Export our contact and answer single-use requests
    Serve {
        /// Where to write our contact
        #[arg(long)]
        contact: Option<PathBuf>,
    },
    /// Open a direct channel to a peer and send it one message
    Connect {
        /// Peer contact file
        #[arg(long)]
        peer: Option<PathBuf>,
        /// Message text
        #[arg(long)]
        message: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    let config = match config::load(cli.config.as_deref()) {
        Ok(c) => apply_flags(c, &cli.command),
        Err(e) => {
            eprintln!("mixboot: {} failed: {}", Stage::Config, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = init_logging(&config, cli.verbose) {
        eprintln!("mixboot: {:#}", e);
        std::process::exit(1);
    }
    if let Err(e) = run(config, cli.command) {
        error!("{:#}", e);
        // The log may be a file; the terminal still has to see why we stopped.
        let _ = write_fatal(&mut std::io::stderr(), &e);
        std::process::exit(1);
    }
}

fn write_fatal(out: &mut impl Write, e: &anyhow::Error) -> std::io::Result<()> {
    writeln!(out, "mixboot: {:#}", e)
}

fn apply_flags(mut config: Config, command: &Command) -> Config {
    match command {
        Command::Serve { contact } => {
            if let Some(p) = contact {
                config.contact_path = p.clone();
            }
        }
        Command::Connect { peer, message } => {
            if let Some(p) = peer {
                config.peer_contact_path = p.clone();
            }
            if let Some(m) = message {
                config.message = m.clone();
            }
        }
    }
    config
}

fn init_logging(config: &Config, verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => config.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("bad log level {:?}", level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_file == "-" {
        builder.with_writer(std::io::stderr).init();
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)
            .with_context(|| format!("open log file {}", config.log_file))?;
        builder.with_ansi(false).with_writer(Mutex::new(file)).init();
    }
    Ok(())
}

fn run(config: Config, command: Command) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        info!(version = env!("CARGO_PKG_VERSION"), state = %config.state_path.display(), "mixboot starting");
        let source = definition_source(&config).map_err(report)?;
        let factory = GatewayFactory;
        // Keep the run alive until shutdown: dropping it would end the session.
        match command {
            Command::Serve { .. } => {
                let _run = run_server(&config, &source, &factory, Endpoints::new())
                    .await
                    .map_err(report)?;
                shutdown_signal().await?;
            }
            Command::Connect { .. } => {
                let _run = run_sender(&config, &source, &factory).await.map_err(report)?;
                shutdown_signal().await?;
            }
        }
        info!("shutting down");
        Ok::<(), anyhow::Error>(())
    })
}

fn report(e: BootstrapError) -> anyhow::Error {
    let stage = e.stage();
    anyhow::Error::new(e).context(format!("stage {}", stage))
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
