use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use sysmex_bridge::config::AnalyzerConfig;
use sysmex_bridge::mapping::MappingTable;
use sysmex_bridge::services::archive::{FileArchiver, MessageArchiver, NoopArchiver};
use sysmex_bridge::services::coordinator::TransactionCoordinator;
use sysmex_bridge::services::supervisor::ConnectionSupervisor;
use sysmex_bridge::services::upstream::HttpLisClient;

#[derive(Parser)]
#[command(
    name = "sysmex-bridge",
    about = "ASTM/HL7 bridge between a Sysmex XP analyzer and the LIS"
)]
struct Args {
    /// Analyzer configuration file
    #[arg(short, long, default_value = "bridge.toml")]
    config: PathBuf,

    /// Directory for archived messages (when archive_msg is enabled)
    #[arg(long, default_value = "archive")]
    archive_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let args = Args::parse();
    let config = AnalyzerConfig::load(&args.config)?;

    let mapping = match &config.mapping_path {
        Some(path) => MappingTable::load(path)?,
        None => {
            log::warn!("No mapping table configured; vendor codes pass through unmapped");
            MappingTable::empty()
        }
    };

    let archiver: Arc<dyn MessageArchiver> = if config.archive_msg {
        Arc::new(FileArchiver::new(&args.archive_dir))
    } else {
        Arc::new(NoopArchiver)
    };
    let upstream = Arc::new(HttpLisClient::with_default_config());

    let coordinator = Arc::new(TransactionCoordinator::new(
        config, mapping, upstream, archiver,
    ));
    let supervisor = ConnectionSupervisor::new(coordinator);

    supervisor.listen_device().await?;
    log::info!("Bridge running; Ctrl-C stops it");

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested");
    supervisor.stop_listening().await;

    Ok(())
}
