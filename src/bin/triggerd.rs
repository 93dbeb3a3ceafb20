//! triggerd - ALPR trigger daemon
//!
//! This daemon:
//! 1. Loads configuration and seeds camera records into the SQLite store
//! 2. Starts a stream (capture + process workers) for every enabled camera
//! 3. Hands each triggered vehicle's best shot to the recognition queue
//!    (SQLite outbox, or MQTT when a broker is configured)
//! 4. Logs fleet statistics periodically and stops all streams on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use alpr_trigger::config::TriggerdConfig;
use alpr_trigger::{
    BackendRegistry, CaptureHandoff, MqttRecognitionQueue, OverlayRenderer, Pool,
    RecognitionQueue, SqliteStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera ALPR trigger daemon")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "TRIGGERD_CONFIG")]
    config: Option<PathBuf>,

    /// Start only these cameras instead of every enabled one.
    #[arg(long = "camera")]
    cameras: Vec<String>,

    /// Print the available detector backends and exit.
    #[arg(long)]
    list_backends: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut registry = BackendRegistry::with_builtin();
    if args.list_backends {
        for name in registry.list() {
            println!("{}", name);
        }
        return Ok(());
    }

    let cfg = TriggerdConfig::load_from(args.config.as_deref())?;

    let store = Arc::new(SqliteStore::open(&cfg.db_path)?);
    for camera in &cfg.cameras {
        store.upsert_camera(camera)?;
    }
    log::info!(
        "opened {} ({} seeded camera(s))",
        cfg.db_path,
        cfg.cameras.len()
    );

    registry.set_default(&cfg.detector.backend)?;
    let detector = registry.default_factory()?;
    log::info!("detector backend: {}", cfg.detector.backend);

    let mqtt = match &cfg.mqtt {
        Some(mqtt) => Some(Arc::new(MqttRecognitionQueue::connect(
            &mqtt.broker_addr,
            &mqtt.topic,
            &mqtt.client_id,
        )?)),
        None => None,
    };
    let queue: Arc<dyn RecognitionQueue> = match &mqtt {
        Some(mqtt) => mqtt.clone() as Arc<dyn RecognitionQueue>,
        None => store.clone() as Arc<dyn RecognitionQueue>,
    };
    log::info!("recognition jobs go to {}", queue.name());

    let overlay = match &cfg.font_path {
        Some(path) => OverlayRenderer::from_font_file(path).unwrap_or_else(|e| {
            log::warn!("overlay text disabled: {:#}", e);
            OverlayRenderer::new()
        }),
        None => OverlayRenderer::new(),
    };

    let handoff = CaptureHandoff::new(&cfg.storage_dir, store.clone(), queue);
    let pool = Pool::new(store.clone(), store.clone(), handoff, detector)
        .with_settings(cfg.stream.clone())
        .with_overlay(overlay);

    let started = if args.cameras.is_empty() {
        pool.start_all_enabled()?
    } else {
        args.cameras.iter().filter(|id| pool.start(id)).count()
    };
    log::info!("triggerd running with {} camera(s)", started);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    loop {
        match rx.recv_timeout(cfg.stats_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                for (camera_id, stats) in pool.get_all_stats() {
                    match serde_json::to_string(&stats) {
                        Ok(json) => log::info!("stats {}: {}", camera_id, json),
                        Err(e) => log::warn!("stats {}: {}", camera_id, e),
                    }
                }
            }
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("shutdown signal received, stopping cameras...");
    pool.stop_all();
    if let Some(mqtt) = mqtt {
        if let Err(e) = mqtt.disconnect() {
            log::warn!("MQTT disconnect failed: {:#}", e);
        }
    }
    Ok(())
}
