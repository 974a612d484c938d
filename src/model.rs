use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Capability bounds and identity, read once per connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProperties {
    pub temp_min: u16,
    pub temp_max: u16,
    pub speed_min: u16,
    pub speed_max: u16,
    pub has_cooler: bool,
    pub has_humidifier: bool,
    pub firmware_ver: u32,
    /// "major.minor"
    pub protocol_ver: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    pub power: bool,
    pub unit_state: u16,
    pub mode: u16,
    pub mode_set: u16,
    pub temperature: i16,
    pub temperature_target: u16,
    pub humidity: Option<u16>,
    pub speed: u16,
    pub speed_target: u16,
    pub speed_fact: Option<u16>,
    pub filter_dust: Option<u16>,
    pub is_warn_err: bool,
    pub is_fatal_err: bool,
    pub danger_overheat: bool,
    pub change_filter: bool,
    pub color_msg: u16,
    pub color_ind: u16,
    pub msg: Option<String>,
}

impl DeviceState {
    pub fn unit_state_kind(&self) -> Option<UnitState> {
        UnitState::from_raw(self.unit_state)
    }

    pub fn mode_kind(&self) -> Option<Mode> {
        Mode::from_raw(self.mode)
    }

    pub fn mode_set_kind(&self) -> Option<ModeSet> {
        ModeSet::from_raw(self.mode_set)
    }

    pub fn color_msg_kind(&self) -> Option<ColorMsg> {
        ColorMsg::from_raw(self.color_msg)
    }

    pub fn color_ind_kind(&self) -> Option<ColorInd> {
        ColorInd::from_raw(self.color_ind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorReadings {
    pub temp_supply: Option<f64>,
    pub temp_room: Option<f64>,
    pub temp_outdoor: Option<f64>,
    pub temp_water: Option<f64>,
    pub power_consumption: Option<f64>,
}

/// Result of one successful tick. Serializes as a single flat object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub properties: DeviceProperties,
    #[serde(flatten)]
    pub state: DeviceState,
    #[serde(flatten)]
    pub sensors: SensorReadings,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    I64(i64),
    F64(f64),
    Bool(bool),
    Text(String),
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<u16> for FieldValue {
    fn from(v: u16) -> Self {
        FieldValue::I64(i64::from(v))
    }
}

impl From<i16> for FieldValue {
    fn from(v: i16) -> Self {
        FieldValue::I64(i64::from(v))
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::I64(i64::from(v))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::I64(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::F64(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

pub type FieldMap = BTreeMap<&'static str, Option<FieldValue>>;

impl Snapshot {
    pub fn new(
        properties: DeviceProperties,
        state: DeviceState,
        sensors: SensorReadings,
    ) -> Self {
        Self {
            properties,
            state,
            sensors,
            fetched_at: Utc::now(),
        }
    }

    /// Flat name → value view handed to presentation adapters.
    pub fn fields(&self) -> FieldMap {
        fn put<V: Into<FieldValue>>(map: &mut FieldMap, key: &'static str, v: Option<V>) {
            map.insert(key, v.map(Into::into));
        }

        let p = &self.properties;
        let s = &self.state;
        let r = &self.sensors;
        let mut m = FieldMap::new();

        put(&mut m, "temp_min", Some(p.temp_min));
        put(&mut m, "temp_max", Some(p.temp_max));
        put(&mut m, "speed_min", Some(p.speed_min));
        put(&mut m, "speed_max", Some(p.speed_max));
        put(&mut m, "has_cooler", Some(p.has_cooler));
        put(&mut m, "has_humidifier", Some(p.has_humidifier));
        put(&mut m, "firmware_ver", Some(p.firmware_ver));
        put(&mut m, "protocol_ver", Some(p.protocol_ver.clone()));

        put(&mut m, "power", Some(s.power));
        put(&mut m, "unit_state", Some(s.unit_state));
        put(&mut m, "mode", Some(s.mode));
        put(&mut m, "mode_set", Some(s.mode_set));
        put(&mut m, "temperature", Some(s.temperature));
        put(&mut m, "temperature_target", Some(s.temperature_target));
        put(&mut m, "humidity", s.humidity);
        put(&mut m, "speed", Some(s.speed));
        put(&mut m, "speed_target", Some(s.speed_target));
        put(&mut m, "speed_fact", s.speed_fact);
        put(&mut m, "filter_dust", s.filter_dust);
        put(&mut m, "is_warn_err", Some(s.is_warn_err));
        put(&mut m, "is_fatal_err", Some(s.is_fatal_err));
        put(&mut m, "danger_overheat", Some(s.danger_overheat));
        put(&mut m, "change_filter", Some(s.change_filter));
        put(&mut m, "color_msg", Some(s.color_msg));
        put(&mut m, "color_ind", Some(s.color_ind));
        put(&mut m, "msg", s.msg.clone());

        put(&mut m, "temp_supply", r.temp_supply);
        put(&mut m, "temp_room", r.temp_room);
        put(&mut m, "temp_outdoor", r.temp_outdoor);
        put(&mut m, "temp_water", r.temp_water);
        put(&mut m, "power_consumption", r.power_consumption);

        m
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Off,
    On,
    ShuttingDown,
    StartingUp,
}

impl UnitState {
    pub fn from_raw(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::Off),
            1 => Some(Self::On),
            2 => Some(Self::ShuttingDown),
            3 => Some(Self::StartingUp),
            _ => None,
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::On => "on",
            Self::ShuttingDown => "shutting down",
            Self::StartingUp => "starting up",
        })
    }
}

/// What the unit is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Heating,
    Cooling,
    AutoHeating,
    AutoCooling,
    Ventilation,
    Off,
}

impl Mode {
    pub fn from_raw(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::Heating),
            1 => Some(Self::Cooling),
            2 => Some(Self::AutoHeating),
            3 => Some(Self::AutoCooling),
            4 => Some(Self::Ventilation),
            5 => Some(Self::Off),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Heating => "heating",
            Self::Cooling => "cooling",
            Self::AutoHeating => "auto (heating)",
            Self::AutoCooling => "auto (cooling)",
            Self::Ventilation => "ventilation",
            Self::Off => "off",
        })
    }
}

/// Mode requested by the user; also the argument of the set-mode command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSet {
    Heat = 1,
    Cool = 2,
    Auto = 3,
    Vent = 4,
}

impl ModeSet {
    pub fn from_raw(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Heat),
            2 => Some(Self::Cool),
            3 => Some(Self::Auto),
            4 => Some(Self::Vent),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for ModeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Heat => "heat",
            Self::Cool => "cool",
            Self::Auto => "auto",
            Self::Vent => "vent",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMsg {
    Normal,
    Warning,
    Error,
}

impl ColorMsg {
    pub fn from_raw(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::Normal),
            1 => Some(Self::Warning),
            2 => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ColorMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorInd {
    Off,
    Transition,
    On,
}

impl ColorInd {
    pub fn from_raw(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::Off),
            1 => Some(Self::Transition),
            2 => Some(Self::On),
            _ => None,
        }
    }
}

impl fmt::Display for ColorInd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Transition => "transition",
            Self::On => "on",
        })
    }
}
