//! Headless camstream operator: boots every configured stream and reports
//! their status until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use camstream::capture::v4l2::log_capture_devices;
use camstream::{AppConfig, BackendRegistry, ImageFileSink, StreamId};
use color_eyre::{eyre::eyre, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camstream=info")))
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camstream launching...");

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = AppConfig::load(path.as_deref())?;
    info!(sources = config.sources.len(), "Configuration loaded");

    log_capture_devices();

    let registry = Arc::new(camstream::registry_from_config(
        &config,
        BackendRegistry::default(),
        Arc::new(ImageFileSink::new()),
    ));
    info!(platform = %registry.platform(), "Booting streams");
    if !registry.boot(&config.sources) {
        return Err(eyre!("stream registry refused to boot"));
    }

    let mut tick = tokio::time::interval(config.ui.tick());
    loop {
        tokio::select! {
            _ = tick.tick() => report(&registry),
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("Interrupted");
                break;
            }
        }
    }

    // Joining blocks, keep it off the runtime threads
    let clean = tokio::task::spawn_blocking({
        let registry = registry.clone();
        move || registry.shutdown()
    })
    .await?;
    info!(clean, "camstream shutting down");
    Ok(())
}

fn report(registry: &camstream::StreamRegistry) {
    let ids = (0..registry.stream_count())
        .map(StreamId::Camera)
        .chain(std::iter::once(StreamId::Composite));
    for id in ids {
        info!(
            stream = %id,
            state = %registry.state(id),
            ms_per_frame = registry.ms_frame_time(id),
            frames = registry.stream_frame_count(id),
            recording = registry.is_recording(id),
            "Status"
        );
    }
}
