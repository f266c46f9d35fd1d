//! Record types persisted by the node.
//!
//! Every type has an explicit little-endian payload encoding for flash and a
//! serde `Serialize` impl producing the telemetry `values` object sent to the
//! backend. The timestamp is carried separately in both encodings.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::event_log::LogCode;
use crate::storage::{PayloadReader, PayloadWriter, Record};

/// Water quality and level reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WaterSensorEntry {
    #[serde(skip)]
    pub timestamp: u32,
    /// Degrees Celsius
    #[serde(rename = "s_temp")]
    pub temperature: f32,
    /// mg/L
    #[serde(rename = "s_do")]
    pub dissolved_oxygen: f32,
    /// uS/cm
    #[serde(rename = "s_cond")]
    pub conductivity: f32,
    #[serde(rename = "s_ph")]
    pub ph: f32,
    /// Centimetres
    #[serde(rename = "s_wl")]
    pub water_level: i32,
}

impl Record for WaterSensorEntry {
    const PAYLOAD_SIZE: usize = 20;

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn encode_payload(&self, out: &mut [u8]) {
        let mut w = PayloadWriter::new(out);
        w.put_f32(self.temperature);
        w.put_f32(self.dissolved_oxygen);
        w.put_f32(self.conductivity);
        w.put_f32(self.ph);
        w.put_i32(self.water_level);
    }

    fn decode_payload(timestamp: u32, payload: &[u8]) -> Self {
        let mut r = PayloadReader::new(payload);
        Self {
            timestamp,
            temperature: r.f32(),
            dissolved_oxygen: r.f32(),
            conductivity: r.f32(),
            ph: r.f32(),
            water_level: r.i32(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeatherEntry {
    #[serde(skip)]
    pub timestamp: u32,
    #[serde(rename = "w_temp")]
    pub temperature: f32,
    #[serde(rename = "w_hum")]
    pub humidity: f32,
    /// hPa
    #[serde(rename = "w_pres")]
    pub pressure: f32,
    /// m/s
    #[serde(rename = "w_wspd")]
    pub wind_speed: f32,
    /// Degrees from north
    #[serde(rename = "w_wdir")]
    pub wind_direction: f32,
    /// Millimetres since the previous reading
    #[serde(rename = "w_rain")]
    pub rain: f32,
}

impl Record for WeatherEntry {
    const PAYLOAD_SIZE: usize = 24;

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn encode_payload(&self, out: &mut [u8]) {
        let mut w = PayloadWriter::new(out);
        for v in [
            self.temperature,
            self.humidity,
            self.pressure,
            self.wind_speed,
            self.wind_direction,
            self.rain,
        ] {
            w.put_f32(v);
        }
    }

    fn decode_payload(timestamp: u32, payload: &[u8]) -> Self {
        let mut r = PayloadReader::new(payload);
        Self {
            timestamp,
            temperature: r.f32(),
            humidity: r.f32(),
            pressure: r.f32(),
            wind_speed: r.f32(),
            wind_direction: r.f32(),
            rain: r.f32(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SoilMoistureEntry {
    #[serde(skip)]
    pub timestamp: u32,
    /// Volumetric water content, percent
    #[serde(rename = "m_moist")]
    pub moisture: f32,
    #[serde(rename = "m_temp")]
    pub temperature: f32,
    #[serde(rename = "m_cond")]
    pub conductivity: f32,
}

impl Record for SoilMoistureEntry {
    const PAYLOAD_SIZE: usize = 12;

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn encode_payload(&self, out: &mut [u8]) {
        let mut w = PayloadWriter::new(out);
        w.put_f32(self.moisture);
        w.put_f32(self.temperature);
        w.put_f32(self.conductivity);
    }

    fn decode_payload(timestamp: u32, payload: &[u8]) -> Self {
        let mut r = PayloadReader::new(payload);
        Self {
            timestamp,
            moisture: r.f32(),
            temperature: r.f32(),
            conductivity: r.f32(),
        }
    }
}

/// Enclosure environment sensor, used for device health.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AuxSensorEntry {
    #[serde(skip)]
    pub timestamp: u32,
    #[serde(rename = "i_temp")]
    pub temperature: f32,
    #[serde(rename = "i_hum")]
    pub humidity: f32,
    #[serde(rename = "i_pres")]
    pub pressure_hpa: i32,
    #[serde(rename = "i_alt")]
    pub altitude_m: i32,
}

impl Record for AuxSensorEntry {
    const PAYLOAD_SIZE: usize = 16;

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn encode_payload(&self, out: &mut [u8]) {
        let mut w = PayloadWriter::new(out);
        w.put_f32(self.temperature);
        w.put_f32(self.humidity);
        w.put_i32(self.pressure_hpa);
        w.put_i32(self.altitude_m);
    }

    fn decode_payload(timestamp: u32, payload: &[u8]) -> Self {
        let mut r = PayloadReader::new(payload);
        Self {
            timestamp,
            temperature: r.f32(),
            humidity: r.f32(),
            pressure_hpa: r.i32(),
            altitude_m: r.i32(),
        }
    }
}

/// Event log entry: a code and two code-specific metadata words.
///
/// The code is kept raw so entries written by other firmware versions still
/// decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: u32,
    pub code: u16,
    pub meta1: u32,
    pub meta2: u32,
}

impl LogEntry {
    pub fn new(timestamp: u32, code: u16, meta1: u32, meta2: u32) -> Self {
        Self {
            timestamp,
            code,
            meta1,
            meta2,
        }
    }

    pub fn log_code(&self) -> Option<LogCode> {
        LogCode::from_u16(self.code)
    }
}

impl Record for LogEntry {
    const PAYLOAD_SIZE: usize = 10;

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn encode_payload(&self, out: &mut [u8]) {
        let mut w = PayloadWriter::new(out);
        w.put_u16(self.code);
        w.put_u32(self.meta1);
        w.put_u32(self.meta2);
    }

    fn decode_payload(timestamp: u32, payload: &[u8]) -> Self {
        let mut r = PayloadReader::new(payload);
        Self {
            timestamp,
            code: r.u16(),
            meta1: r.u32(),
            meta2: r.u32(),
        }
    }
}

/// Serializes the raw entry plus dashboard friendly `d_*` keys for the codes
/// that carry device health telemetry.
impl Serialize for LogEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("log_code", &self.code)?;
        map.serialize_entry("log_m1", &self.meta1)?;
        map.serialize_entry("log_m2", &self.meta2)?;

        match self.log_code() {
            Some(LogCode::Boot) => map.serialize_entry("d_boot", &1)?,
            Some(LogCode::Wakeup) => map.serialize_entry("d_wakeup", &1)?,
            Some(LogCode::Sleep) => map.serialize_entry("d_tm_awake_s", &self.meta1)?,
            Some(LogCode::GsmConnectFailed) => map.serialize_entry("d_gsm_conn_fail", &1)?,
            Some(LogCode::GsmRssi) => map.serialize_entry("d_gsm_rssi", &(self.meta1 as i32))?,
            Some(LogCode::NtpTimeSyncFailed) => map.serialize_entry("d_ntp_fail", &1)?,
            Some(LogCode::SensorDataSubmitted) => {
                map.serialize_entry("d_sd_total_rec", &self.meta1)?;
                if self.meta2 > 0 {
                    map.serialize_entry("d_sd_crc", &self.meta2)?;
                }
            }
            Some(LogCode::SensorDataSubmissionErrors) => {
                map.serialize_entry("d_sd_total_req", &self.meta1)?;
                map.serialize_entry("d_sd_failed_req", &self.meta2)?;
            }
            Some(LogCode::Battery) => {
                map.serialize_entry("d_bat_mv", &self.meta1)?;
                map.serialize_entry("d_bat_p", &self.meta2)?;
            }
            Some(LogCode::BatteryGsm) => {
                map.serialize_entry("d_bat_gsm_mv", &self.meta1)?;
                map.serialize_entry("d_bat_gsm_p", &self.meta2)?;
            }
            _ => {}
        }

        map.end()
    }
}
