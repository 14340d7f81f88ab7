use anyhow::{Context, Result};
use clap::Parser;
use kurafuto::config;
use kurafuto::server::{self, Server};
use std::path::PathBuf;

/// A Minecraft Classic reverse proxy / load balancer.
#[derive(Parser)]
#[command(name = "kurafuto")]
struct Cli {
    /// The file your Kurafuto configuration is stored in.
    #[arg(long = "config", default_value = "kurafuto.json")]
    config: PathBuf,

    /// Force a specific salt to be used (don't do this!).
    #[arg(long = "force-salt", default_value = "")]
    force_salt: String,

    /// Debugging verbosity level (0, 1, or 2).
    #[arg(short = 'v', default_value_t = 0)]
    verbosity: u8,
}

fn level_for(verbosity: u8) -> log::LevelFilter {
    match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(level_for(cli.verbosity))
        .init();

    let config = config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let salt = server::resolve_salt(if cli.force_salt.is_empty() {
        None
    } else {
        Some(cli.force_salt.clone())
    });

    let (srv, listener) = Server::bind(config, salt).await?;

    log::info!(
        "Kurafuto now listening on {}:{} with {} servers",
        srv.config.address,
        srv.config.port,
        srv.config.servers.len()
    );
    log::debug!(
        "Debugging level {} enabled! (Salt: {})",
        cli.verbosity,
        srv.salt
    );
    if !srv.config.ignore_packets.is_empty() {
        log::debug!("Ignoring these packets: {:?}", srv.config.ignore_packets);
    }
    if !srv.config.drop_packets.is_empty() {
        log::debug!("Dropping these packets: {:?}", srv.config.drop_packets);
    }
    if !srv.config.drop_extensions.is_empty() {
        log::debug!("Dropping these extensions: {:?}", srv.config.drop_extensions);
    }
    if srv.config.heartbeat {
        log::warn!("heartbeat is enabled in config but not implemented; ignoring");
    }

    let run_server = srv.clone();
    let run_task = tokio::spawn(async move { run_server.run(listener).await });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("received SIGINT"),
        _ = sigterm.recv() => log::info!("received SIGTERM"),
        _ = sighup.recv() => log::info!("received SIGHUP"),
    }

    srv.quit();
    run_task.await.context("accept loop task panicked")?;

    Ok(())
}
