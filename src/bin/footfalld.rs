//! footfalld - people-counting daemon
//!
//! This daemon:
//! 1. Loads configuration (file + environment)
//! 2. Opens the count database
//! 3. Builds the camera registry (connector, detector/tracker pipeline factory)
//! 4. Serves the HTTP API until Ctrl-C, then drains every camera worker

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use footfall::annotate::Annotator;
use footfall::detect::build_detector;
use footfall::api::{ApiConfig, ApiServer};
use footfall::pipeline::ConfiguredPipelineFactory;
use footfall::server::StreamServer;
use footfall::{shared_store, CameraRegistry, DefaultConnector, FootfallConfig, SqliteCountStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (.toml or JSON).
    #[arg(long, env = "FOOTFALL_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = FootfallConfig::load_from(args.config.as_deref())?;

    // Load the model once up front so a bad detector setup fails here, not per viewer.
    let detector = build_detector(&config.detector)?;
    log::info!(
        "detector {} ready ({})",
        detector.name(),
        detector.acceleration()
    );
    drop(detector);

    let store = shared_store(SqliteCountStore::open(&config.db_path)?);
    let annotator = Arc::new(Annotator::from_font_path(config.annotate.font_path.as_deref())?);
    let pipelines = ConfiguredPipelineFactory::new(
        config.detector.clone(),
        config.tracker,
        annotator,
    );
    let connector = DefaultConnector {
        read_timeout: config.stream.frame_timeout,
    };
    let registry = CameraRegistry::with_branches(
        Arc::new(connector),
        Arc::new(pipelines),
        store,
        config.worker.clone(),
        config.branches.clone(),
    );

    let server = StreamServer::new(registry.clone(), config.stream.clone());
    let api_config = ApiConfig {
        addr: config.http_addr.clone(),
        branches: config.branches.clone(),
        ..ApiConfig::default()
    };
    let api_handle = ApiServer::new(api_config, server).spawn()?;
    log::info!(
        "footfalld running. db={} detector={} snapshot every {:?}",
        config.db_path,
        config.detector.backend,
        config.worker.snapshot_interval
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("footfalld waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;
    registry.shutdown()?;

    Ok(())
}
