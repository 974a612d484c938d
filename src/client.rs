use crate::codec::{
    bit, build_request, classify_errors, decode_hex_signed16, decode_hex_unsigned, extract_bits,
    tokenize, DELIMITER, NO_DATA,
};
use crate::config::DeviceConfig;
use crate::error::{AppError, Result};
use crate::model::{DeviceProperties, DeviceState, ModeSet, SensorReadings};
use crate::transport::{DeviceStream, Response, Session};
use std::fmt;
use std::time::Duration;
use tracing::info;

pub const REQ_GET_PROPERTIES: &str = "VPr07";
pub const REQ_GET_STATE: &str = "VSt07";
pub const REQ_GET_SENSORS: &str = "VSens";
pub const REQ_SET_POWER: &str = "VWPwr";
pub const REQ_SET_TEMP: &str = "VWTmp";
pub const REQ_SET_FAN_SPEED: &str = "VWSpd";
pub const REQ_SET_MODE: &str = "VWFtr";

pub const RESP_PROPERTIES: &str = "VPr07";
pub const RESP_STATE: &str = "VSt07";
pub const RESP_SENSORS: &str = "VSens";
pub const RESP_OK: &str = "OK";

/// Tags that only ever answer a read request.
const DATA_TAGS: [&str; 3] = [RESP_PROPERTIES, RESP_STATE, RESP_SENSORS];

const PROPERTIES_TOKENS: usize = 8;
const STATE_TOKENS: usize = 7;
const MSG_INDEX: usize = 10;
const ABSENT_BYTE: u16 = 255;

/// Single-word write commands accepted by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetPower(bool),
    SetTemperature(i32),
    SetFanSpeed(i32),
    SetMode(ModeSet),
}

impl Command {
    fn request_type(&self) -> &'static str {
        match self {
            Command::SetPower(_) => REQ_SET_POWER,
            Command::SetTemperature(_) => REQ_SET_TEMP,
            Command::SetFanSpeed(_) => REQ_SET_FAN_SPEED,
            Command::SetMode(_) => REQ_SET_MODE,
        }
    }

    fn data(&self) -> i64 {
        match *self {
            Command::SetPower(on) => i64::from(on),
            Command::SetTemperature(t) => i64::from(t),
            Command::SetFanSpeed(s) => i64::from(s),
            Command::SetMode(m) => i64::from(m.code()),
        }
    }

    /// Rejects values outside the capability bounds the device reported.
    pub fn validate(&self, props: &DeviceProperties) -> Result<()> {
        match *self {
            Command::SetTemperature(t) => {
                check_bounds("temperature", i64::from(t), props.temp_min, props.temp_max)
            }
            Command::SetFanSpeed(s) => {
                check_bounds("fan speed", i64::from(s), props.speed_min, props.speed_max)
            }
            Command::SetPower(_) | Command::SetMode(_) => Ok(()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetPower(on) => write!(f, "set_power({})", on),
            Command::SetTemperature(t) => write!(f, "set_temperature({})", t),
            Command::SetFanSpeed(s) => write!(f, "set_fan_speed({})", s),
            Command::SetMode(m) => write!(f, "set_mode({})", m),
        }
    }
}

pub fn check_bounds(field: &'static str, value: i64, min: u16, max: u16) -> Result<()> {
    let (min, max) = (i64::from(min), i64::from(max));
    if value < min || value > max {
        return Err(AppError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Protocol client for one configured device.
pub struct DeviceClient {
    host: String,
    port: u16,
    password: u16,
    timeout: Duration,
    session: Session,
    properties: Option<DeviceProperties>,
}

impl DeviceClient {
    pub fn new(cfg: &DeviceConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            password: cfg.password,
            timeout: Duration::from_secs(cfg.timeout_secs),
            session: Session::new(Duration::from_millis(cfg.settle_ms)),
            properties: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bounds read during the current connection, if any.
    pub fn properties(&self) -> Option<&DeviceProperties> {
        self.properties.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.properties = None;
        self.session
            .connect(&self.host, self.port, self.timeout)
            .await
    }

    /// Adopt an established stream; used by tests and tooling.
    pub fn attach<S: DeviceStream + 'static>(&mut self, stream: S) {
        self.properties = None;
        self.session.attach(stream);
    }

    /// Properties belong to the connection and are forgotten with it.
    pub async fn disconnect(&mut self) {
        self.session.disconnect(self.timeout).await;
        self.properties = None;
    }

    /// One request/response pair. A reply carrying another request's tag, or
    /// a reply cut short without a terminator that then fails to decode,
    /// means the stream is out of step and fails as [`AppError::Desync`].
    async fn exchange<T>(
        &mut self,
        kind: &str,
        data: Option<i64>,
        expected: &str,
        decode: impl FnOnce(&[String]) -> Result<T>,
    ) -> Result<T> {
        let request = build_request(kind, self.password, data)?;
        let response = self.session.send_receive(&request, self.timeout).await?;
        let tokens = classify_errors(tokenize(&response.text))?;

        let first = tokens.first().map(String::as_str).unwrap_or_default();
        let foreign = if expected == RESP_OK {
            DATA_TAGS.contains(&first)
        } else {
            first != expected
        };
        if foreign {
            return Err(desync(request, response));
        }

        match decode(tokens.as_slice()) {
            Err(err) if !response.terminated && err.is_protocol_mismatch() => {
                Err(desync(request, response))
            }
            other => other,
        }
    }

    pub async fn fetch_properties(&mut self) -> Result<DeviceProperties> {
        let props = self
            .exchange(REQ_GET_PROPERTIES, None, RESP_PROPERTIES, parse_properties)
            .await?;
        info!(
            temp_min = props.temp_min,
            temp_max = props.temp_max,
            speed_min = props.speed_min,
            speed_max = props.speed_max,
            firmware = props.firmware_ver,
            protocol = %props.protocol_ver,
            "device properties loaded"
        );
        self.properties = Some(props.clone());
        Ok(props)
    }

    pub async fn fetch_state(&mut self) -> Result<DeviceState> {
        self.exchange(REQ_GET_STATE, None, RESP_STATE, parse_state)
            .await
    }

    pub async fn fetch_sensors(&mut self) -> Result<SensorReadings> {
        self.exchange(REQ_GET_SENSORS, None, RESP_SENSORS, parse_sensors)
            .await
    }

    pub async fn set_power(&mut self, on: bool) -> Result<()> {
        self.execute(Command::SetPower(on)).await
    }

    pub async fn set_temperature(&mut self, temperature: i32) -> Result<()> {
        self.execute(Command::SetTemperature(temperature)).await
    }

    pub async fn set_fan_speed(&mut self, speed: i32) -> Result<()> {
        self.execute(Command::SetFanSpeed(speed)).await
    }

    pub async fn set_mode(&mut self, mode: ModeSet) -> Result<()> {
        self.execute(Command::SetMode(mode)).await
    }

    pub async fn execute(&mut self, command: Command) -> Result<()> {
        if let Some(props) = &self.properties {
            command.validate(props)?;
        }
        self.exchange(
            command.request_type(),
            Some(command.data()),
            RESP_OK,
            |tokens| match tokens.first() {
                Some(tag) if tag == RESP_OK => Ok(()),
                _ => Err(AppError::CommandRejected {
                    command: command.to_string(),
                    response: tokens.join(&DELIMITER.to_string()),
                }),
            },
        )
        .await?;
        info!(command = %command, "command accepted");
        Ok(())
    }
}

fn desync(request: String, response: Response) -> AppError {
    AppError::Desync {
        request,
        response: response.text,
    }
}

fn expect_tag(tokens: &[String], tag: &str, min_len: usize) -> Result<()> {
    match tokens.first() {
        Some(first) if first == tag => {}
        _ => {
            return Err(AppError::Protocol(format!(
                "expected {} response, got {:?}",
                tag, tokens
            )))
        }
    }
    if tokens.len() < min_len {
        return Err(AppError::Protocol(format!(
            "{} response has {} tokens, expected at least {}",
            tag,
            tokens.len(),
            min_len
        )));
    }
    Ok(())
}

fn absent_if_full(v: u16) -> Option<u16> {
    (v != ABSENT_BYTE).then_some(v)
}

pub fn parse_properties(tokens: &[String]) -> Result<DeviceProperties> {
    expect_tag(tokens, RESP_PROPERTIES, PROPERTIES_TOKENS)?;

    let tempr = &tokens[1];
    let speed = &tokens[2];
    let misc = &tokens[4];
    let proto = &tokens[5];

    let minor = extract_bits(proto, 0, 7)?;
    let major = extract_bits(proto, 8, 15)?;

    Ok(DeviceProperties {
        temp_min: extract_bits(tempr, 0, 7)?,
        temp_max: extract_bits(tempr, 8, 15)?,
        speed_min: extract_bits(speed, 0, 7)?,
        speed_max: extract_bits(speed, 8, 15)?,
        has_cooler: bit(misc, 14)?,
        has_humidifier: bit(misc, 13)?,
        firmware_ver: decode_hex_unsigned(&tokens[7])?,
        protocol_ver: format!("{}.{}", major, minor),
    })
}

pub fn parse_state(tokens: &[String]) -> Result<DeviceState> {
    expect_tag(tokens, RESP_STATE, STATE_TOKENS)?;

    let w_state = &tokens[1];
    let w_mode = &tokens[2];
    let w_tempr = &tokens[3];
    let w_humid = &tokens[4];
    let w_speed = &tokens[5];
    let w_misc = &tokens[6];

    // current temperature is a signed byte
    let temperature = extract_bits(w_tempr, 0, 7)? as u8 as i8;

    Ok(DeviceState {
        power: bit(w_state, 0)?,
        is_warn_err: bit(w_state, 1)?,
        is_fatal_err: bit(w_state, 2)?,
        danger_overheat: bit(w_state, 3)?,
        change_filter: bit(w_state, 5)?,
        mode_set: extract_bits(w_state, 6, 8)?,
        unit_state: extract_bits(w_mode, 0, 1)?,
        mode: extract_bits(w_mode, 3, 5)?,
        temperature: i16::from(temperature),
        temperature_target: extract_bits(w_tempr, 8, 15)?,
        humidity: absent_if_full(extract_bits(w_humid, 0, 7)?),
        speed: extract_bits(w_speed, 0, 3)?,
        speed_target: extract_bits(w_speed, 4, 7)?,
        speed_fact: absent_if_full(extract_bits(w_speed, 8, 15)?),
        color_msg: extract_bits(w_misc, 4, 5)?,
        color_ind: extract_bits(w_misc, 6, 7)?,
        filter_dust: absent_if_full(extract_bits(w_misc, 8, 15)?),
        msg: tokens.get(MSG_INDEX).cloned(),
    })
}

fn sensor(tokens: &[String], index: usize, decode: fn(&str) -> Result<f64>) -> Result<Option<f64>> {
    let Some(token) = tokens.get(index) else {
        return Ok(None);
    };
    if decode_hex_unsigned(token)? == NO_DATA {
        return Ok(None);
    }
    decode(token).map(Some)
}

fn signed_tenths(token: &str) -> Result<f64> {
    Ok(f64::from(decode_hex_signed16(token)?) / 10.0)
}

fn unsigned_plain(token: &str) -> Result<f64> {
    Ok(f64::from(decode_hex_unsigned(token)?))
}

/// Missing trailing tokens read as absent, same as the sentinel.
pub fn parse_sensors(tokens: &[String]) -> Result<SensorReadings> {
    expect_tag(tokens, RESP_SENSORS, 1)?;

    Ok(SensorReadings {
        temp_supply: sensor(tokens, 1, signed_tenths)?,
        temp_room: sensor(tokens, 3, signed_tenths)?,
        temp_outdoor: sensor(tokens, 5, signed_tenths)?,
        temp_water: sensor(tokens, 7, unsigned_plain)?,
        power_consumption: sensor(tokens, 8, unsigned_plain)?,
    })
}
