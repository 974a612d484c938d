//! User-facing control surface: commands with optimistic feedback.

use crate::client::Command;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::model::{FieldMap, FieldValue, ModeSet};
use crate::overlay::{ControlField, OptimisticOverlay};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub struct Controller {
    coordinator: Arc<Coordinator>,
    overlay: Mutex<OptimisticOverlay>,
}

impl Controller {
    pub fn new(coordinator: Arc<Coordinator>, hold: Duration) -> Self {
        Self {
            coordinator,
            overlay: Mutex::new(OptimisticOverlay::new(hold)),
        }
    }

    pub async fn set_power(&self, on: bool) -> Result<()> {
        self.send(Command::SetPower(on), ControlField::Power, on.into())
            .await
    }

    pub async fn set_temperature(&self, temperature: i32) -> Result<()> {
        self.send(
            Command::SetTemperature(temperature),
            ControlField::TemperatureTarget,
            i64::from(temperature).into(),
        )
        .await
    }

    pub async fn set_fan_speed(&self, speed: i32) -> Result<()> {
        self.send(
            Command::SetFanSpeed(speed),
            ControlField::SpeedTarget,
            i64::from(speed).into(),
        )
        .await
    }

    pub async fn set_mode(&self, mode: ModeSet) -> Result<()> {
        self.send(
            Command::SetMode(mode),
            ControlField::ModeSet,
            mode.code().into(),
        )
        .await
    }

    async fn send(&self, command: Command, field: ControlField, value: FieldValue) -> Result<()> {
        // Bounds come from the last snapshot; nothing is predicted or sent
        // for a value the device would refuse.
        if let Some(snapshot) = self.coordinator.latest() {
            command.validate(&snapshot.properties)?;
        }

        let id = self
            .overlay
            .lock()
            .await
            .predict(field, value, Instant::now());

        match self.coordinator.execute(command).await {
            Ok(()) => {
                self.coordinator.request_refresh();
                Ok(())
            }
            Err(err) => {
                self.overlay.lock().await.fail(field, id);
                Err(err)
            }
        }
    }

    /// Latest snapshot with live predictions on top.
    pub async fn view(&self) -> Option<FieldMap> {
        self.view_at(Instant::now()).await
    }

    /// Before the first snapshot the map holds only live predictions;
    /// `None` when there is neither.
    pub async fn view_at(&self, now: Instant) -> Option<FieldMap> {
        let mut fields = self
            .coordinator
            .latest()
            .map(|snapshot| snapshot.fields())
            .unwrap_or_default();
        self.overlay.lock().await.apply(&mut fields, now);
        (!fields.is_empty()).then_some(fields)
    }

    /// Call once per published snapshot.
    pub async fn observe(&self, now: Instant) {
        self.overlay.lock().await.on_snapshot(now);
    }

    /// Feed every published snapshot into the overlay until the
    /// coordinator goes away.
    pub async fn track_snapshots(&self) {
        let mut rx = self.coordinator.subscribe();
        while rx.changed().await.is_ok() {
            debug!("snapshot observed by controller");
            self.observe(Instant::now()).await;
        }
    }
}
