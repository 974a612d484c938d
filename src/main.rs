use breezart_bridge::{Config, Controller, Coordinator, DeviceClient};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    info!(
        host = %cfg.device.host,
        port = cfg.device.port,
        interval_secs = cfg.polling.interval_secs,
        "loaded config"
    );

    if std::env::args().nth(1).as_deref() == Some("probe") {
        return probe(&cfg).await;
    }

    let client = DeviceClient::new(&cfg.device);
    let coordinator = Arc::new(Coordinator::new(client, cfg.polling.interval()));
    let controller = Arc::new(Controller::new(
        coordinator.clone(),
        cfg.polling.hold_window(),
    ));

    let poller = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run().await })
    };
    let tracker = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.track_snapshots().await })
    };

    let mut snapshots = coordinator.subscribe();
    let sig = tokio::signal::ctrl_c();
    tokio::pin!(sig);
    loop {
        tokio::select! {
            biased;
            _ = &mut sig => {
                info!("shutdown requested");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    warn!("snapshot channel closed");
                    break;
                }
                let latest = snapshots.borrow_and_update().clone();
                if let Some(snapshot) = latest {
                    match snapshot.to_json() {
                        Ok(json) => info!(snapshot = %json, "device snapshot"),
                        Err(e) => warn!(error = %e, "failed to serialize snapshot"),
                    }
                }
            }
        }
    }

    poller.abort();
    tracker.abort();
    coordinator.shutdown().await;
    Ok(())
}

/// One-shot connectivity check: read properties and exit.
async fn probe(cfg: &Config) -> Result<(), anyhow::Error> {
    let mut client = DeviceClient::new(&cfg.device);
    info!(host = %client.host(), port = client.port(), "probing device");
    client.connect().await?;
    let result = client.fetch_properties().await;
    client.disconnect().await;

    let props = result?;
    println!("{}", serde_json::to_string_pretty(&props)?);
    Ok(())
}
