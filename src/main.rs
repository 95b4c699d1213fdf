//! pingrelay - MQTT to ping bridge
//!
//! Accepts destination definitions (YAML config or live bus messages),
//! continuously probes each destination's liveness over ICMP, and
//! republishes liveness transitions and telemetry back onto the bus:
//! - `<prefix>status[/<name>]` (subscribe): telemetry query
//! - `<prefix>destination/<name>` (subscribe): add/replace/remove control
//! - `<prefix>state/<name>`, `<prefix>info/<name>` (publish): results
//!
//! The bus connection is supervised and reconnects forever on failure.

mod config;
mod manager;
mod mqtt;
mod probe;
mod topics;

use anyhow::{Context, Result};
use config::Settings;
use probe::IcmpProber;
use topics::TopicScheme;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let settings = Settings::from_env();

    let default_filter = if settings.debug { "trace" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!(
        "starting pingrelay as {} against {}:{}, config yaml: {:?}",
        settings.mqtt.client_id, settings.mqtt.host, settings.mqtt.port, settings.config_path
    );

    // the only fatal error path: a config that cannot be read or decoded
    let cfg = config::load_app_config(&settings.config_path)
        .await
        .context("startup configuration failed")?;

    let topics = TopicScheme::new(&settings.topic_prefix);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sub_tx, sub_rx) = mpsc::channel(mqtt::SUB_QUEUE_CAP);

    let pub_tx = mqtt::start(settings.mqtt.clone(), topics.clone(), sub_tx, shutdown_rx.clone());
    let done = manager::start(
        cfg,
        topics,
        Box::new(IcmpProber::new()),
        pub_tx,
        sub_rx,
        shutdown_rx,
    );

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for interrupt: {e}");
            return;
        }
        info!("interrupt received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    let _ = done.await;
    info!("stopping pingrelay");
    Ok(())
}
