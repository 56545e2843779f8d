//! Decoding of validated response payloads into typed readings.

use crate::catalog::ResponseShape;
use serde_derive::Deserialize;
use std::fmt;
use thiserror::Error;

/// Number of comma-separated tokens in a `GS` answer.
pub const GENERAL_STATUS_TOKENS: usize = 28;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    GridVoltage,
    GridFrequency,
    AcOutputVoltage,
    AcOutputFrequency,
    OutputApparentPower,
    OutputActivePower,
    LoadPercent,
    BatteryVoltage,
    BatteryVoltageScc,
    BatteryVoltageScc2,
    BatteryDischargeCurrent,
    BatteryChargeCurrent,
    BatteryCapacity,
    HeatsinkTemperature,
    Mppt1Temperature,
    Mppt2Temperature,
    Pv1Power,
    Pv2Power,
    Pv1Voltage,
    Pv2Voltage,
    Mode,
}

impl Field {
    pub const COUNT: usize = 21;

    /// Numeric fields in `GS` wire order.
    pub const MEASUREMENTS: &'static [Field] = &[
        Field::GridVoltage,
        Field::GridFrequency,
        Field::AcOutputVoltage,
        Field::AcOutputFrequency,
        Field::OutputApparentPower,
        Field::OutputActivePower,
        Field::LoadPercent,
        Field::BatteryVoltage,
        Field::BatteryVoltageScc,
        Field::BatteryVoltageScc2,
        Field::BatteryDischargeCurrent,
        Field::BatteryChargeCurrent,
        Field::BatteryCapacity,
        Field::HeatsinkTemperature,
        Field::Mppt1Temperature,
        Field::Mppt2Temperature,
        Field::Pv1Power,
        Field::Pv2Power,
        Field::Pv1Voltage,
        Field::Pv2Voltage,
    ];

    pub fn all() -> impl Iterator<Item = Field> {
        Field::MEASUREMENTS
            .iter()
            .copied()
            .chain(std::iter::once(Field::Mode))
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::GridVoltage => "grid_voltage",
            Field::GridFrequency => "grid_frequency",
            Field::AcOutputVoltage => "ac_output_voltage",
            Field::AcOutputFrequency => "ac_output_frequency",
            Field::OutputApparentPower => "output_apparent_power",
            Field::OutputActivePower => "output_active_power",
            Field::LoadPercent => "load_percent",
            Field::BatteryVoltage => "battery_voltage",
            Field::BatteryVoltageScc => "battery_voltage_scc",
            Field::BatteryVoltageScc2 => "battery_voltage_scc2",
            Field::BatteryDischargeCurrent => "battery_discharge_current",
            Field::BatteryChargeCurrent => "battery_charge_current",
            Field::BatteryCapacity => "battery_capacity",
            Field::HeatsinkTemperature => "heatsink_temperature",
            Field::Mppt1Temperature => "mppt1_temperature",
            Field::Mppt2Temperature => "mppt2_temperature",
            Field::Pv1Power => "pv1_power",
            Field::Pv2Power => "pv2_power",
            Field::Pv1Voltage => "pv1_voltage",
            Field::Pv2Voltage => "pv2_voltage",
            Field::Mode => "mode",
        }
    }

    /// Divisor applied to the raw integer token.
    fn scale(self) -> f32 {
        match self {
            Field::GridVoltage
            | Field::GridFrequency
            | Field::AcOutputVoltage
            | Field::AcOutputFrequency
            | Field::BatteryVoltage
            | Field::BatteryVoltageScc
            | Field::BatteryVoltageScc2
            | Field::Pv1Voltage
            | Field::Pv2Voltage => 10.0,
            _ => 1.0,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceMode {
    PowerOn,
    Standby,
    Bypass,
    Battery,
    Fault,
    /// Hybrid mode, the inverter runs from the grid.
    Line,
}

impl DeviceMode {
    pub fn from_code(code: u8) -> Option<DeviceMode> {
        match code {
            0 => Some(DeviceMode::PowerOn),
            1 => Some(DeviceMode::Standby),
            2 => Some(DeviceMode::Bypass),
            3 => Some(DeviceMode::Battery),
            4 => Some(DeviceMode::Fault),
            5 => Some(DeviceMode::Line),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceMode::PowerOn => "PowerOn",
            DeviceMode::Standby => "Standby",
            DeviceMode::Bypass => "Bypass",
            DeviceMode::Battery => "Battery",
            DeviceMode::Fault => "Fault",
            DeviceMode::Line => "Line",
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single value handed to a publication sink.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldValue {
    Number(f32),
    Mode(DeviceMode),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(value) => write!(f, "{value}"),
            FieldValue::Mode(mode) => write!(f, "{mode}"),
        }
    }
}

/// Scaled measurements in wire order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Measurements {
    values: Vec<(Field, f32)>,
}

impl Measurements {
    pub fn get(&self, field: Field) -> Option<f32> {
        self.values
            .iter()
            .find(|(candidate, _)| *candidate == field)
            .map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Field, f32)> + '_ {
        self.values.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DecodedReading {
    Measurements(Measurements),
    DeviceMode(DeviceMode),
}

impl DecodedReading {
    /// The reading flattened into publishable values.
    pub fn values(&self) -> Vec<(Field, FieldValue)> {
        match self {
            DecodedReading::Measurements(measurements) => measurements
                .iter()
                .map(|(field, value)| (field, FieldValue::Number(value)))
                .collect(),
            DecodedReading::DeviceMode(mode) => vec![(Field::Mode, FieldValue::Mode(*mode))],
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("cannot parse {field} from {raw_token:?}")]
    FieldParse {
        field: &'static str,
        raw_token: String,
    },
    #[error("expected {expected} tokens, found {found}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("unknown mode code {code}")]
    UnknownModeCode { code: u8 },
}

impl ParseError {
    /// Whether the frame was sound and only its content is unknown to us.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ParseError::UnknownModeCode { .. })
    }
}

pub fn parse(shape: ResponseShape, payload: &[u8]) -> Result<DecodedReading, ParseError> {
    let text = std::str::from_utf8(payload).map_err(|_| ParseError::FieldParse {
        field: "payload",
        raw_token: String::from_utf8_lossy(payload).into_owned(),
    })?;

    match shape {
        ResponseShape::Measurements => parse_general_status(text).map(DecodedReading::Measurements),
        ResponseShape::DeviceMode => parse_mode(text).map(DecodedReading::DeviceMode),
    }
}

fn parse_general_status(text: &str) -> Result<Measurements, ParseError> {
    let tokens: Vec<&str> = text.split(',').collect();
    if tokens.len() != GENERAL_STATUS_TOKENS {
        return Err(ParseError::ShapeMismatch {
            expected: GENERAL_STATUS_TOKENS,
            found: tokens.len(),
        });
    }

    // the measurement fields occupy the leading tokens, status flags follow
    let values = Field::MEASUREMENTS
        .iter()
        .zip(&tokens)
        .map(|(&field, token)| {
            token
                .parse::<i32>()
                .map(|raw| (field, raw as f32 / field.scale()))
                .map_err(|_| ParseError::FieldParse {
                    field: field.name(),
                    raw_token: token.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Measurements { values })
}

fn parse_mode(text: &str) -> Result<DeviceMode, ParseError> {
    let tokens: Vec<&str> = text.split(',').collect();
    if tokens.len() != 1 {
        return Err(ParseError::ShapeMismatch {
            expected: 1,
            found: tokens.len(),
        });
    }

    let token = tokens[0];
    let code = token.parse::<u8>().map_err(|_| ParseError::FieldParse {
        field: Field::Mode.name(),
        raw_token: token.to_string(),
    })?;
    DeviceMode::from_code(code).ok_or(ParseError::UnknownModeCode { code })
}
