//! Parses and validates inbound device payloads (MQTT and HTTP share the same
//! wire shape) into normalized [`Reading`] records, and renders outbound
//! subscriber frames.
//!
//! Range table: bounds below are a versioned artifact (§9 design note) —
//! other layers consume these constants rather than re-validating.

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::CodecError;

/// Bump whenever a bound in this module changes.
pub const RANGE_TABLE_VERSION: u32 = 1;

/// Default maximum allowed skew between a device timestamp and server time.
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: i64 = 24 * 3600;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    pub device_id: String,
    pub timestamp: String,
    #[serde(default)]
    pub firmware: Option<String>,
    #[serde(default)]
    pub sensors: SensorsPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct SensorsPayload {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub tires: Vec<TireReading>,
    #[serde(default)]
    pub battery_v: Option<f64>,
    #[serde(default)]
    pub rssi: Option<f64>,
    /// Unknown top-level keys are captured here rather than rejected, so a
    /// firmware update that adds a sensor kind degrades to `quality=suspect`
    /// instead of being dropped.
    #[serde(flatten)]
    pub unknown: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct TireReading {
    pub position: String,
    #[serde(default)]
    pub pressure_kpa: Option<f64>,
    #[serde(default)]
    pub temperature_c: Option<f64>,
}

// ---------------------------------------------------------------------------
// Normalized domain types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Pressure,
    Temperature,
    Humidity,
    Battery,
    Accel,
    Light,
    Composite,
    /// Forward-compatible bucket for sensor keys this build doesn't know
    /// about yet. Carries the original key so operators can see what arrived.
    Unknown,
}

impl SensorKind {
    /// Parses the `kind` token used inside alert rule predicates (§4.7),
    /// e.g. `threshold_below(pressure, 200.0)`.
    pub fn parse(s: &str) -> Self {
        match s {
            "pressure" => Self::Pressure,
            "temperature" => Self::Temperature,
            "humidity" => Self::Humidity,
            "battery" => Self::Battery,
            "accel" => Self::Accel,
            "light" => Self::Light,
            "composite" => Self::Composite,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TirePosition {
    FrontLeft,
    FrontRight,
    RearLeft,
    RearRight,
    None,
}

impl TirePosition {
    fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "FL" | "FRONT_LEFT" => Self::FrontLeft,
            "FR" | "FRONT_RIGHT" => Self::FrontRight,
            "RL" | "REAR_LEFT" => Self::RearLeft,
            "RR" | "REAR_RIGHT" => Self::RearRight,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    Suspect,
    Invalid,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub device_id: String,
    pub sensor_kind: SensorKind,
    pub unknown_key: Option<String>,
    pub position: TirePosition,
    pub value: f64,
    pub unit: &'static str,
    pub device_timestamp: i64,
    pub ingest_timestamp: i64,
    pub quality: Quality,
}

/// Envelope produced by decoding one inbound frame: the device identity plus
/// zero or more normalized readings.
#[derive(Debug)]
pub struct DecodedFrame {
    pub device_id: String,
    pub device_timestamp: i64,
    pub firmware: Option<String>,
    pub readings: Vec<Reading>,
}

// ---------------------------------------------------------------------------
// Range table
// ---------------------------------------------------------------------------

struct Range {
    lo: f64,
    hi: f64,
    unit: &'static str,
}

const PRESSURE_RANGE: Range = Range { lo: 0.0, hi: 600.0, unit: "kPa" };
const TEMPERATURE_RANGE: Range = Range { lo: -40.0, hi: 120.0, unit: "C" };
const HUMIDITY_RANGE: Range = Range { lo: 0.0, hi: 100.0, unit: "%RH" };
const BATTERY_RANGE: Range = Range { lo: 0.0, hi: 5.0, unit: "V" };

fn classify(kind: SensorKind, value: f64) -> Quality {
    let range = match kind {
        SensorKind::Pressure => &PRESSURE_RANGE,
        SensorKind::Temperature => &TEMPERATURE_RANGE,
        SensorKind::Humidity => &HUMIDITY_RANGE,
        SensorKind::Battery => &BATTERY_RANGE,
        _ => return Quality::Suspect,
    };
    if value < range.lo || value > range.hi {
        Quality::Invalid
    } else {
        Quality::Good
    }
}

fn unit_for(kind: SensorKind) -> &'static str {
    match kind {
        SensorKind::Pressure => PRESSURE_RANGE.unit,
        SensorKind::Temperature => TEMPERATURE_RANGE.unit,
        SensorKind::Humidity => HUMIDITY_RANGE.unit,
        SensorKind::Battery => BATTERY_RANGE.unit,
        SensorKind::Accel => "g",
        SensorKind::Light => "lux",
        SensorKind::Composite | SensorKind::Unknown => "",
    }
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode one inbound frame. Never panics on malformed input.
pub fn decode_frame(
    bytes: &[u8],
    now: OffsetDateTime,
    max_clock_skew_secs: i64,
) -> Result<DecodedFrame, CodecError> {
    let frame: InboundFrame =
        serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedJson {
            offset: Some(e.column()),
            source: e,
        })?;

    if frame.device_id.trim().is_empty() {
        return Err(CodecError::MissingDeviceId);
    }

    let device_ts = OffsetDateTime::parse(&frame.timestamp, &Rfc3339)
        .map_err(|_| CodecError::BadTimestamp(frame.timestamp.clone()))?;

    let skew = (now - device_ts).whole_seconds().abs();
    if skew > max_clock_skew_secs {
        return Err(CodecError::ClockSkew {
            skew_secs: skew,
            max_skew_secs: max_clock_skew_secs,
        });
    }

    let device_timestamp = device_ts.unix_timestamp();
    let ingest_timestamp = now.unix_timestamp();
    let mut readings = Vec::new();

    let mut push = |kind: SensorKind, position: TirePosition, value: f64, unknown_key: Option<String>| {
        readings.push(Reading {
            device_id: frame.device_id.clone(),
            sensor_kind: kind,
            unknown_key,
            position,
            value,
            unit: unit_for(kind),
            device_timestamp,
            ingest_timestamp,
            quality: classify(kind, value),
        });
    };

    if let Some(v) = frame.sensors.temperature {
        push(SensorKind::Temperature, TirePosition::None, v, None);
    }
    if let Some(v) = frame.sensors.humidity {
        push(SensorKind::Humidity, TirePosition::None, v, None);
    }
    if let Some(v) = frame.sensors.pressure {
        push(SensorKind::Pressure, TirePosition::None, v, None);
    }
    if let Some(v) = frame.sensors.battery_v {
        push(SensorKind::Battery, TirePosition::None, v, None);
    }
    for tire in &frame.sensors.tires {
        let position = TirePosition::parse(&tire.position);
        if let Some(v) = tire.pressure_kpa {
            push(SensorKind::Pressure, position, v, None);
        }
        if let Some(v) = tire.temperature_c {
            push(SensorKind::Temperature, position, v, None);
        }
    }
    for (key, value) in &frame.sensors.unknown {
        if key == "rssi" {
            continue; // diagnostic field, not a Reading
        }
        if let Some(v) = value.as_f64() {
            push(SensorKind::Unknown, TirePosition::None, v, Some(key.clone()));
        }
    }

    Ok(DecodedFrame {
        device_id: frame.device_id,
        device_timestamp,
        firmware: frame.firmware,
        readings,
    })
}

// ---------------------------------------------------------------------------
// Outbound subscriber frame rendering (§6 WebSocket protocol)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame<'a> {
    Subscribed,
    Reading {
        device_id: &'a str,
        sensor_kind: SensorKind,
        position: TirePosition,
        value: f64,
        unit: &'a str,
        device_timestamp: i64,
        ingest_timestamp: i64,
        quality: Quality,
    },
    Ping,
}

/// Serialize a Reading once into a shared outbound frame blob, so a single
/// broadcast encodes a reading exactly once regardless of subscriber count.
pub fn render_reading_frame(r: &Reading) -> String {
    let frame = OutboundFrame::Reading {
        device_id: &r.device_id,
        sensor_kind: r.sensor_kind,
        position: r.position,
        value: r.value,
        unit: r.unit,
        device_timestamp: r.device_timestamp,
        ingest_timestamp: r.ingest_timestamp,
        quality: r.quality,
    };
    serde_json::to_string(&frame).expect("OutboundFrame always serializes")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::parse("2024-01-26T14:30:25Z", &Rfc3339).unwrap()
    }

    #[test]
    fn happy_path_tpms_reading() {
        let body = br#"{"device_id":"HK_000001","timestamp":"2024-01-26T14:30:25Z",
            "sensors":{"tires":[{"position":"FL","pressure_kpa":220.0,"temperature_c":35.0}]}}"#;
        let decoded = decode_frame(body, now(), DEFAULT_MAX_CLOCK_SKEW_SECS).unwrap();
        assert_eq!(decoded.device_id, "HK_000001");
        assert_eq!(decoded.readings.len(), 2);
        let pressure = decoded
            .readings
            .iter()
            .find(|r| r.sensor_kind == SensorKind::Pressure)
            .unwrap();
        assert_eq!(pressure.position, TirePosition::FrontLeft);
        assert_eq!(pressure.value, 220.0);
        assert_eq!(pressure.quality, Quality::Good);
    }

    #[test]
    fn missing_device_id_rejected() {
        let body = br#"{"device_id":"","timestamp":"2024-01-26T14:30:25Z","sensors":{}}"#;
        assert!(matches!(
            decode_frame(body, now(), DEFAULT_MAX_CLOCK_SKEW_SECS),
            Err(CodecError::MissingDeviceId)
        ));
    }

    #[test]
    fn absent_device_id_field_fails_to_parse() {
        let body = br#"{"timestamp":"2024-01-26T14:30:25Z","sensors":{}}"#;
        assert!(matches!(
            decode_frame(body, now(), DEFAULT_MAX_CLOCK_SKEW_SECS),
            Err(CodecError::MalformedJson { .. })
        ));
    }

    #[test]
    fn excessive_clock_skew_rejected() {
        let body = br#"{"device_id":"d1","timestamp":"2020-01-01T00:00:00Z","sensors":{}}"#;
        assert!(matches!(
            decode_frame(body, now(), DEFAULT_MAX_CLOCK_SKEW_SECS),
            Err(CodecError::ClockSkew { .. })
        ));
    }

    #[test]
    fn out_of_range_pressure_marked_invalid_value_retained() {
        let body = br#"{"device_id":"d1","timestamp":"2024-01-26T14:30:25Z",
            "sensors":{"tires":[{"position":"FL","pressure_kpa":9999}]}}"#;
        let decoded = decode_frame(body, now(), DEFAULT_MAX_CLOCK_SKEW_SECS).unwrap();
        let r = &decoded.readings[0];
        assert_eq!(r.quality, Quality::Invalid);
        assert_eq!(r.value, 9999.0);
    }

    #[test]
    fn unknown_sensor_kind_preserved_as_suspect() {
        let body = br#"{"device_id":"d1","timestamp":"2024-01-26T14:30:25Z",
            "sensors":{"co2_ppm":410.5}}"#;
        let decoded = decode_frame(body, now(), DEFAULT_MAX_CLOCK_SKEW_SECS).unwrap();
        assert_eq!(decoded.readings.len(), 1);
        let r = &decoded.readings[0];
        assert_eq!(r.sensor_kind, SensorKind::Unknown);
        assert_eq!(r.unknown_key.as_deref(), Some("co2_ppm"));
        assert_eq!(r.quality, Quality::Suspect);
    }

    #[test]
    fn rssi_is_diagnostic_not_a_reading() {
        let body = br#"{"device_id":"d1","timestamp":"2024-01-26T14:30:25Z","sensors":{"rssi":-58}}"#;
        let decoded = decode_frame(body, now(), DEFAULT_MAX_CLOCK_SKEW_SECS).unwrap();
        assert!(decoded.readings.is_empty());
    }

    #[test]
    fn malformed_json_does_not_panic() {
        let body = b"{not json";
        assert!(decode_frame(body, now(), DEFAULT_MAX_CLOCK_SKEW_SECS).is_err());
    }

    #[test]
    fn humidity_in_range_is_good() {
        let body = br#"{"device_id":"d1","timestamp":"2024-01-26T14:30:25Z","sensors":{"humidity":60.1}}"#;
        let decoded = decode_frame(body, now(), DEFAULT_MAX_CLOCK_SKEW_SECS).unwrap();
        assert_eq!(decoded.readings[0].quality, Quality::Good);
    }

    #[test]
    fn battery_out_of_range_is_invalid() {
        let body = br#"{"device_id":"d1","timestamp":"2024-01-26T14:30:25Z","sensors":{"battery_v":9.9}}"#;
        let decoded = decode_frame(body, now(), DEFAULT_MAX_CLOCK_SKEW_SECS).unwrap();
        assert_eq!(decoded.readings[0].quality, Quality::Invalid);
    }

    #[test]
    fn render_reading_frame_round_trips_through_json() {
        let body = br#"{"device_id":"d1","timestamp":"2024-01-26T14:30:25Z","sensors":{"pressure":101.3}}"#;
        let decoded = decode_frame(body, now(), DEFAULT_MAX_CLOCK_SKEW_SECS).unwrap();
        let json = render_reading_frame(&decoded.readings[0]);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "reading");
        assert_eq!(value["device_id"], "d1");
    }

    #[test]
    fn tire_position_parses_all_variants() {
        assert_eq!(TirePosition::parse("FL"), TirePosition::FrontLeft);
        assert_eq!(TirePosition::parse("fr"), TirePosition::FrontRight);
        assert_eq!(TirePosition::parse("RL"), TirePosition::RearLeft);
        assert_eq!(TirePosition::parse("RR"), TirePosition::RearRight);
        assert_eq!(TirePosition::parse("bogus"), TirePosition::None);
    }
}
