pub mod client;
pub mod codec;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod overlay;
pub mod transport;

pub use client::{Command, DeviceClient};
pub use config::Config;
pub use control::Controller;
pub use coordinator::{Coordinator, Health, Phase};
pub use error::{AppError, Result};
pub use model::{DeviceProperties, DeviceState, ModeSet, SensorReadings, Snapshot};
