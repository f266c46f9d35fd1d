//! Contracts for the hardware and transport collaborators of the core.
//!
//! The modem driver, HTTP transport, RTC, battery gauge, firmware flasher and
//! sensor drivers live outside this crate. A board support package provides
//! one value implementing [`Board`], which bundles all of them together with
//! an `embedded_hal` delay used for retry pacing.

use alloc::vec::Vec;

use embassy_time::Duration;
use embedded_hal::delay::DelayNs;
use thiserror_no_std::Error;

use crate::error::ErrorDetail;
use crate::records::{AuxSensorEntry, SoilMoistureEntry, WaterSensorEntry, WeatherEntry};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("No SIM card")]
    NoSimCard,
    #[error("Modem power failure: {0}")]
    Power(ErrorDetail),
    #[error("Network connection failed: {0}")]
    Connect(ErrorDetail),
    #[error("Transport error: {0}")]
    Transport(ErrorDetail),
}

/// Cellular modem.
pub trait Modem {
    fn power_on(&mut self) -> Result<(), LinkError>;

    fn power_off(&mut self);

    /// Registers on the network and opens a data session.
    fn connect(&mut self) -> Result<(), LinkError>;

    /// Hard power cycle, used between connection attempts.
    fn power_cycle(&mut self) -> Result<(), LinkError>;

    /// Signal strength in dBm.
    fn rssi(&mut self) -> Option<i32>;

    /// Supply as measured by the modem itself.
    fn gsm_battery(&mut self) -> Option<BatteryStatus> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP transport to the telemetry backend, over the modem's data session.
///
/// `path` is relative to the backend host, e.g. `/api/v1/{token}/telemetry`.
pub trait HttpClient {
    fn request(&mut self, method: Method, path: &str, body: &[u8]) -> Result<Response, LinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryStatus {
    pub millivolts: u32,
    pub percent: u8,
}

/// Timekeeping, power and restart services of the MCU.
pub trait Platform {
    /// Milliseconds since boot.
    fn uptime_ms(&self) -> u64;

    /// RTC time, seconds since the Unix epoch.
    fn timestamp(&self) -> u32;

    /// Light sleep for `duration`, returning on the timer wake-up.
    fn light_sleep(&mut self, duration: Duration);

    /// Resets the MCU. Implementations on hardware do not return.
    fn restart(&mut self);

    fn battery(&mut self) -> Option<BatteryStatus>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FirmwareError {
    #[error("Firmware download failed: {0}")]
    Download(ErrorDetail),
    #[error("Firmware image rejected: {0}")]
    Verify(ErrorDetail),
    #[error("Rollback failed: {0}")]
    Rollback(ErrorDetail),
}

/// Over-the-air firmware flashing.
pub trait FirmwareUpdater {
    /// Downloads, verifies against `md5` and stages the image at `url`.
    fn flash(&mut self, url: &str, md5: &str) -> Result<(), FirmwareError>;

    /// Whether a previous image is available to roll back to.
    fn can_rollback(&self) -> bool;

    /// Marks the previous image bootable. The caller restarts afterwards.
    fn rollback(&mut self) -> Result<(), FirmwareError>;
}

/// Sensor drivers. `None` means the sensor is absent or the read failed.
pub trait SensorSource {
    fn read_water(&mut self, timestamp: u32) -> Option<WaterSensorEntry>;

    fn read_weather(&mut self, _timestamp: u32) -> Option<WeatherEntry> {
        None
    }

    fn read_soil(&mut self, _timestamp: u32) -> Option<SoilMoistureEntry> {
        None
    }

    fn read_aux(&mut self, _timestamp: u32) -> Option<AuxSensorEntry> {
        None
    }
}

/// Everything the node needs from the board it runs on.
pub trait Board: Modem + HttpClient + Platform + FirmwareUpdater + SensorSource + DelayNs {}

impl<T> Board for T where T: Modem + HttpClient + Platform + FirmwareUpdater + SensorSource + DelayNs
{}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_success_range() {
        let ok = Response {
            status: 204,
            body: Vec::new(),
        };
        assert!(ok.is_success());
        let not_found = Response {
            status: 404,
            body: Vec::new(),
        };
        assert!(!not_found.is_success());
    }
}
