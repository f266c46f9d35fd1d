//! Compile-time constants and runtime identity configuration.

use alloc::string::String;
use serde::{Deserialize, Serialize};

/// Records held in RAM by a store before a forced flush.
pub const DATA_STORE_BUFFER_ELEMENTS: usize = 10;

/// Append attempts per flush before the buffer is kept for the next commit.
pub const FLUSH_RETRIES: usize = 3;

/// Upper bound (exclusive) of the chunk file name postfix search.
pub const FILENAME_POSTFIX_MAX: u32 = 100;

/// Sensor records per chunk file, and per telemetry request.
pub const SENSOR_DATA_ENTRIES_PER_SUBMIT_REQ: usize = 8;

/// Log records per chunk file, and per telemetry request.
pub const LOG_ENTRIES_PER_SUBMIT_REQ: usize = 8;

/// Largest telemetry body the backend accepts from the device.
pub const PAYLOAD_BUFFER_SIZE: usize = 2048;

pub const WATER_SENSOR_DATA_DIR: &str = "/sd";
pub const WEATHER_DATA_DIR: &str = "/wx";
pub const SOIL_MOISTURE_DATA_DIR: &str = "/soil";
pub const AUX_SENSOR_DATA_DIR: &str = "/aux";
pub const LOG_DATA_DIR: &str = "/log";

/// Key-value namespace and key of the device configuration blob.
pub const DEVICE_CONFIG_NAMESPACE: &str = "DevConf";
pub const DEVICE_CONFIG_KEY: &str = "DevConf";

/// Valid call-home intervals, 1 minute to 3 days.
pub const CALL_HOME_INT_MINS_MIN: u32 = 1;
pub const CALL_HOME_INT_MINS_MAX: u32 = 24 * 60 * 3;

/// Valid sensor read intervals, 1 minute to 1 day.
pub const READ_SENSORS_INT_MINS_MIN: u32 = 1;
pub const READ_SENSORS_INT_MINS_MAX: u32 = 24 * 60;

/// Battery percentage at or below which the critical schedule is used.
pub const BATTERY_LEVEL_CRITICAL: u8 = 40;

/// RTC timestamps at or below this value mean the clock was never set.
pub const FAIL_CHECK_TIMESTAMP: u32 = 1_567_157_191;

/// Modem connect attempts, with a power cycle between each.
pub const GSM_TRIES: usize = 3;
pub const GSM_RETRY_DELAY_MS: u32 = 100;

/// Backend identity of this device.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct BackendConfig {
    /// ThingsBoard device access token, part of every request path
    pub access_token: String,
    /// Human readable name used in console output
    pub device_name: String,
}

impl BackendConfig {
    /// A device without an access token cannot talk to the backend at all.
    pub fn has_identity(&self) -> bool {
        !self.access_token.trim().is_empty()
    }
}

/// Description of the running firmware image.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub version: u32,
    /// Bitmask of compiled-in features, reported as a client attribute
    pub features: u32,
}

pub mod features {
    pub const WATER_SENSORS: u32 = 1 << 0;
    pub const WEATHER_STATION: u32 = 1 << 1;
    pub const SOIL_MOISTURE: u32 = 1 << 2;
    pub const AUX_ENV_SENSOR: u32 = 1 << 3;
}
