//! Scriptable fakes of the board collaborators for unit tests.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use embassy_time::Duration;
use embedded_hal::delay::DelayNs;

use crate::error::detail;
use crate::hal::{
    BatteryStatus, FirmwareError, FirmwareUpdater, HttpClient, LinkError, Method, Modem, Platform,
    Response, SensorSource,
};
use crate::records::{AuxSensorEntry, SoilMoistureEntry, WaterSensorEntry, WeatherEntry};

pub fn water_entry(timestamp: u32) -> WaterSensorEntry {
    WaterSensorEntry {
        timestamp,
        temperature: 12.5,
        dissolved_oxygen: 8.25,
        conductivity: 410.0,
        ph: 7.5,
        water_level: 132,
    }
}

/// Clock, battery and restart counter. Sleeping advances both clocks.
#[derive(Debug, Clone)]
pub struct FakePlatform {
    pub uptime_ms: u64,
    pub slept: Vec<u64>,
    pub timestamp: u32,
    pub battery: Option<BatteryStatus>,
    pub restarts: u32,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            uptime_ms: 0,
            slept: Vec::new(),
            timestamp: 1_700_000_000,
            battery: Some(BatteryStatus {
                millivolts: 3_950,
                percent: 80,
            }),
            restarts: 0,
        }
    }
}

impl Platform for FakePlatform {
    fn uptime_ms(&self) -> u64 {
        self.uptime_ms
    }

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn light_sleep(&mut self, duration: Duration) {
        let ms = duration.as_millis();
        self.slept.push(ms);
        self.uptime_ms += ms;
        self.timestamp += (ms / 1000) as u32;
    }

    fn restart(&mut self) {
        self.restarts += 1;
    }

    fn battery(&mut self) -> Option<BatteryStatus> {
        self.battery
    }
}

/// Board with a scripted modem, backend and firmware updater.
///
/// The backend answers by path: shared attribute reads return
/// `shared_attributes`, client attribute posts follow `attributes_ok` and
/// telemetry posts pop `telemetry_script` (success once it is empty).
#[derive(Debug)]
pub struct MockBoard {
    pub platform: FakePlatform,
    pub modem_on: bool,
    /// Connection attempts that fail before one succeeds
    pub connect_failures: usize,
    pub connect_attempts: usize,
    pub power_cycles: usize,
    pub no_sim: bool,
    pub rssi: Option<i32>,
    pub requests: Vec<(Method, String, Vec<u8>)>,
    pub shared_attributes: Result<Response, LinkError>,
    pub attributes_ok: bool,
    pub telemetry_script: VecDeque<bool>,
    pub flash_result: Result<(), FirmwareError>,
    pub flashed: Vec<(String, String)>,
    pub rollback_available: bool,
    pub rolled_back: bool,
    /// Report weather, soil and aux readings besides water
    pub all_sensors: bool,
}

impl Default for MockBoard {
    fn default() -> Self {
        Self {
            platform: FakePlatform::default(),
            modem_on: false,
            connect_failures: 0,
            connect_attempts: 0,
            power_cycles: 0,
            no_sim: false,
            rssi: Some(-71),
            requests: Vec::new(),
            shared_attributes: Ok(Response {
                status: 200,
                body: b"{}".to_vec(),
            }),
            attributes_ok: true,
            telemetry_script: VecDeque::new(),
            flash_result: Ok(()),
            flashed: Vec::new(),
            rollback_available: false,
            rolled_back: false,
            all_sensors: false,
        }
    }
}

impl MockBoard {
    pub fn telemetry_requests(&self) -> usize {
        self.requests
            .iter()
            .filter(|(_, path, _)| path.ends_with("/telemetry"))
            .count()
    }
}

impl Modem for MockBoard {
    fn power_on(&mut self) -> Result<(), LinkError> {
        self.modem_on = true;
        Ok(())
    }

    fn power_off(&mut self) {
        self.modem_on = false;
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.connect_attempts += 1;
        if self.no_sim {
            return Err(LinkError::NoSimCard);
        }
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            return Err(LinkError::Connect(detail("no network")));
        }
        Ok(())
    }

    fn power_cycle(&mut self) -> Result<(), LinkError> {
        self.power_cycles += 1;
        Ok(())
    }

    fn rssi(&mut self) -> Option<i32> {
        self.rssi
    }
}

impl HttpClient for MockBoard {
    fn request(&mut self, method: Method, path: &str, body: &[u8]) -> Result<Response, LinkError> {
        self.requests.push((method, String::from(path), body.to_vec()));

        if path.contains("sharedKeys=") {
            return self.shared_attributes.clone();
        }

        let ok = if path.ends_with("/attributes") {
            self.attributes_ok
        } else {
            self.telemetry_script.pop_front().unwrap_or(true)
        };
        Ok(Response {
            status: if ok { 200 } else { 503 },
            body: Vec::new(),
        })
    }
}

impl Platform for MockBoard {
    fn uptime_ms(&self) -> u64 {
        self.platform.uptime_ms()
    }

    fn timestamp(&self) -> u32 {
        self.platform.timestamp()
    }

    fn light_sleep(&mut self, duration: Duration) {
        self.platform.light_sleep(duration);
    }

    fn restart(&mut self) {
        self.platform.restart();
    }

    fn battery(&mut self) -> Option<BatteryStatus> {
        self.platform.battery()
    }
}

impl FirmwareUpdater for MockBoard {
    fn flash(&mut self, url: &str, md5: &str) -> Result<(), FirmwareError> {
        self.flash_result.clone()?;
        self.flashed.push((String::from(url), String::from(md5)));
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        self.rollback_available
    }

    fn rollback(&mut self) -> Result<(), FirmwareError> {
        self.rolled_back = true;
        Ok(())
    }
}

impl SensorSource for MockBoard {
    fn read_water(&mut self, timestamp: u32) -> Option<WaterSensorEntry> {
        Some(water_entry(timestamp))
    }

    fn read_weather(&mut self, timestamp: u32) -> Option<WeatherEntry> {
        self.all_sensors.then_some(WeatherEntry {
            timestamp,
            temperature: 18.0,
            humidity: 61.5,
            pressure: 1013.25,
            wind_speed: 3.5,
            wind_direction: 270.0,
            rain: 0.25,
        })
    }

    fn read_soil(&mut self, timestamp: u32) -> Option<SoilMoistureEntry> {
        self.all_sensors.then_some(SoilMoistureEntry {
            timestamp,
            moisture: 28.5,
            temperature: 13.0,
            conductivity: 0.5,
        })
    }

    fn read_aux(&mut self, timestamp: u32) -> Option<AuxSensorEntry> {
        self.all_sensors.then_some(AuxSensorEntry {
            timestamp,
            temperature: 24.5,
            humidity: 40.0,
            pressure_hpa: 1012,
            altitude_m: 110,
        })
    }
}

impl DelayNs for MockBoard {
    fn delay_ns(&mut self, _ns: u32) {}
}
