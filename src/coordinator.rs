//! Periodic refresh of device state into a published [`Snapshot`].
//!
//! The coordinator owns the only session to the device. Ticks and commands
//! take the same lock, so at most one request/response pair is ever on the
//! wire. Refresh requests are coalesced through a single [`Notify`] permit.

use crate::client::{Command, DeviceClient};
use crate::error::{AppError, Result};
use crate::model::Snapshot;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NeedsProperties,
    Ready,
}

/// Outcome of recent ticks, for a degraded indicator next to the snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Health {
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl Health {
    pub fn is_degraded(&self) -> bool {
        self.last_error.is_some()
    }
}

struct Link {
    client: DeviceClient,
    phase: Phase,
}

impl Link {
    async fn ensure_ready(&mut self) -> Result<()> {
        if !self.client.is_connected() {
            self.phase = Phase::NeedsProperties;
            self.client.connect().await?;
        }
        if self.phase == Phase::NeedsProperties || self.client.properties().is_none() {
            self.phase = Phase::NeedsProperties;
            self.client.fetch_properties().await?;
            self.phase = Phase::Ready;
        }
        Ok(())
    }

    async fn poll(&mut self) -> Result<Snapshot> {
        self.ensure_ready().await?;
        let properties = self
            .client
            .properties()
            .cloned()
            .ok_or_else(|| AppError::Protocol("properties unavailable after fetch".into()))?;
        let state = self.client.fetch_state().await?;
        let sensors = self.client.fetch_sensors().await?;
        Ok(Snapshot::new(properties, state, sensors))
    }

    async fn execute(&mut self, command: Command) -> Result<()> {
        self.ensure_ready().await?;
        self.client.execute(command).await
    }

    /// Transport failures poison the session: close it and rediscover
    /// properties on the next connection.
    async fn recover(&mut self, err: &AppError) {
        if err.is_transport() {
            warn!(error = %err, "transport failure, closing session");
            self.client.disconnect().await;
            self.phase = Phase::NeedsProperties;
        } else if err.is_protocol_mismatch() {
            error!(error = %err, "unexpected response from device, decoder assumptions may not hold");
        }
    }
}

pub struct Coordinator {
    link: Mutex<Link>,
    snapshot_tx: watch::Sender<Option<Arc<Snapshot>>>,
    health_tx: watch::Sender<Health>,
    refresh: Notify,
    interval: Duration,
}

impl Coordinator {
    pub fn new(client: DeviceClient, interval: Duration) -> Self {
        let (snapshot_tx, _) = watch::channel(None);
        let (health_tx, _) = watch::channel(Health::default());
        Self {
            link: Mutex::new(Link {
                client,
                phase: Phase::NeedsProperties,
            }),
            snapshot_tx,
            health_tx,
            refresh: Notify::new(),
            interval,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.snapshot_tx.subscribe()
    }

    pub fn health(&self) -> watch::Receiver<Health> {
        self.health_tx.subscribe()
    }

    /// Last successfully published snapshot; survives failed ticks.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.snapshot_tx.borrow().clone()
    }

    pub async fn phase(&self) -> Phase {
        self.link.lock().await.phase
    }

    /// Ask for an early tick. Requests made while one is pending or running
    /// collapse into a single extra tick.
    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    /// Run one tick now, waiting for any tick or command in progress.
    pub async fn tick(&self) -> Result<Arc<Snapshot>> {
        let mut link = self.link.lock().await;
        match link.poll().await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.snapshot_tx.send_replace(Some(snapshot.clone()));
                self.health_tx.send_modify(|h| {
                    h.last_success = Some(snapshot.fetched_at);
                    h.last_error = None;
                    h.consecutive_failures = 0;
                });
                debug!(fetched_at = %snapshot.fetched_at, "snapshot published");
                Ok(snapshot)
            }
            Err(err) => {
                link.recover(&err).await;
                self.health_tx.send_modify(|h| {
                    h.last_error = Some(err.to_string());
                    h.consecutive_failures += 1;
                });
                warn!(error = %err, "tick failed, keeping last snapshot");
                Err(err)
            }
        }
    }

    /// Send a command over the shared session.
    pub async fn execute(&self, command: Command) -> Result<()> {
        let mut link = self.link.lock().await;
        let result = link.execute(command).await;
        if let Err(err) = &result {
            link.recover(err).await;
            warn!(command = %command, error = %err, "command failed");
        }
        result
    }

    /// Poll forever. Tick failures are logged and published, never fatal.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "poll coordinator started");
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.refresh.notified() => {
                    debug!("refresh requested");
                    ticker.reset();
                }
            }
            let _ = self.tick().await;
        }
    }

    pub async fn shutdown(&self) {
        let mut link = self.link.lock().await;
        link.client.disconnect().await;
        link.phase = Phase::NeedsProperties;
        info!("disconnected from device");
    }
}
