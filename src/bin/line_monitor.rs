use anyhow::Context;
use clap::Parser;
use line_monitor::{CurlProber, HttpControlPlane, LineMonitor, MonitorConfig, SqliteStore};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

/// Probe SOCKS5 egress lines and keep their health tiers up to date.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Re-download the node catalog even if the store already has one.
    #[arg(long)]
    refresh_catalog: bool,

    /// Override the SQLite database path from the config file.
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = MonitorConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    let control_plane = HttpControlPlane::new(&config.base_api_addr, config.control_plane_timeout)
        .context("building control plane client")?
        .with_catalog_filter(config.catalog_line_id, config.catalog_project_id);
    let prober = CurlProber::new(config.curl_program.clone(), config.kill_timeout);

    let monitor = LineMonitor::new(
        config,
        Arc::new(control_plane),
        Arc::new(store),
        Arc::new(prober),
    );
    monitor
        .ensure_catalog(cli.refresh_catalog)
        .await
        .context("bootstrapping node catalog")?;

    let run = monitor.run();
    tokio::pin!(run);
    tokio::select! {
        _ = &mut run => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            info!("Received ctrl-c, waiting for in-flight cycles");
            monitor.shutdown();
            run.await;
        }
    }
    Ok(())
}
