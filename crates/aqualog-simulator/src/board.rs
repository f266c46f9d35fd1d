//! Simulated board: virtual clock, flaky modem, in-process backend and
//! synthetic sensors.

use std::time::{SystemTime, UNIX_EPOCH};

use embedded_hal::delay::DelayNs;
use log::{debug, info, warn};

use aqualog_core::error::detail;
use aqualog_core::hal::{
    BatteryStatus, FirmwareError, FirmwareUpdater, HttpClient, LinkError, Method, Modem, Platform,
    Response, SensorSource,
};
use aqualog_core::records::{AuxSensorEntry, SoilMoistureEntry, WaterSensorEntry, WeatherEntry};

// ---------------------------------------------------------------------------
// Deterministic randomness
// ---------------------------------------------------------------------------

/// Linear congruential generator, so runs with the same seed repeat.
struct Lcg(u64);

impl Lcg {
    fn next_f64(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// What the simulated ThingsBoard server has received.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackendStats {
    pub telemetry_posts: u32,
    pub telemetry_bytes: usize,
    pub attribute_posts: u32,
    pub attribute_reads: u32,
    pub rejected: u32,
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

pub struct SimBoard {
    epoch_base: u32,
    uptime_ms: u64,
    modem_on: bool,
    link_failure_rate: f64,
    rng: Lcg,
    shared_attributes: String,
    backend: BackendStats,
    restart_requested: bool,
    staged_firmware: Option<String>,
}

impl SimBoard {
    pub fn new(link_failure_rate: f64, shared_attributes: String, seed: u64) -> Self {
        let epoch_base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;

        Self {
            epoch_base,
            uptime_ms: 0,
            modem_on: false,
            link_failure_rate,
            rng: Lcg(seed),
            shared_attributes,
            backend: BackendStats::default(),
            restart_requested: false,
            staged_firmware: None,
        }
    }

    pub fn backend_stats(&self) -> BackendStats {
        self.backend
    }

    /// Returns and clears the pending restart request.
    pub fn take_restart(&mut self) -> bool {
        std::mem::take(&mut self.restart_requested)
    }

    /// Simulated reboot: RAM state is gone, the RTC keeps running.
    pub fn reboot(&mut self) {
        self.epoch_base = self.timestamp();
        self.uptime_ms = 0;
        self.modem_on = false;
        if let Some(url) = self.staged_firmware.take() {
            info!("Booting staged firmware from {}", url);
        }
    }

    fn link_fails(&mut self) -> bool {
        self.rng.next_f64() < self.link_failure_rate
    }

    /// Seconds of virtual time, as a float for the sensor waveforms.
    fn t(&self) -> f64 {
        self.uptime_ms as f64 / 1000.0
    }
}

impl Modem for SimBoard {
    fn power_on(&mut self) -> Result<(), LinkError> {
        debug!("Modem on");
        self.modem_on = true;
        Ok(())
    }

    fn power_off(&mut self) {
        debug!("Modem off");
        self.modem_on = false;
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        if !self.modem_on {
            return Err(LinkError::Power(detail("modem is off")));
        }
        // Registration takes a while
        self.uptime_ms += 4_000;
        if self.link_fails() {
            return Err(LinkError::Connect(detail("network registration timed out")));
        }
        Ok(())
    }

    fn power_cycle(&mut self) -> Result<(), LinkError> {
        self.modem_on = false;
        self.uptime_ms += 2_000;
        self.modem_on = true;
        Ok(())
    }

    fn rssi(&mut self) -> Option<i32> {
        self.modem_on
            .then(|| -75 + (8.0 * (self.t() / 900.0).sin()) as i32)
    }

    fn gsm_battery(&mut self) -> Option<BatteryStatus> {
        self.battery().map(|b| BatteryStatus {
            millivolts: b.millivolts - 40,
            ..b
        })
    }
}

impl HttpClient for SimBoard {
    fn request(&mut self, method: Method, path: &str, body: &[u8]) -> Result<Response, LinkError> {
        if !self.modem_on {
            return Err(LinkError::Transport(detail("no data session")));
        }
        self.uptime_ms += 800;
        if self.link_fails() {
            self.backend.rejected += 1;
            warn!("Backend: {:?} {} dropped", method, path);
            return Err(LinkError::Transport(detail("connection reset")));
        }

        let response = match method {
            Method::Get if path.contains("sharedKeys=") => {
                self.backend.attribute_reads += 1;
                Response {
                    status: 200,
                    body: self.shared_attributes.as_bytes().to_vec(),
                }
            }
            Method::Post if path.ends_with("/telemetry") => {
                self.backend.telemetry_posts += 1;
                self.backend.telemetry_bytes += body.len();
                debug!("Backend: telemetry {}", String::from_utf8_lossy(body));
                Response {
                    status: 200,
                    body: Vec::new(),
                }
            }
            Method::Post if path.ends_with("/attributes") => {
                self.backend.attribute_posts += 1;
                debug!("Backend: attributes {}", String::from_utf8_lossy(body));
                Response {
                    status: 200,
                    body: Vec::new(),
                }
            }
            _ => Response {
                status: 404,
                body: Vec::new(),
            },
        };
        Ok(response)
    }
}

impl Platform for SimBoard {
    fn uptime_ms(&self) -> u64 {
        self.uptime_ms
    }

    fn timestamp(&self) -> u32 {
        self.epoch_base + (self.uptime_ms / 1000) as u32
    }

    fn light_sleep(&mut self, duration: embassy_time::Duration) {
        self.uptime_ms += duration.as_millis();
    }

    fn restart(&mut self) {
        info!("Restart requested");
        self.restart_requested = true;
    }

    fn battery(&mut self) -> Option<BatteryStatus> {
        // Solar charged: swings through the day
        let percent = 70.0 + 25.0 * (self.t() / 43_200.0).sin();
        Some(BatteryStatus {
            millivolts: 3_300 + (percent * 9.0) as u32,
            percent: percent as u8,
        })
    }
}

impl FirmwareUpdater for SimBoard {
    fn flash(&mut self, url: &str, md5: &str) -> Result<(), FirmwareError> {
        if !url.starts_with("http") {
            return Err(FirmwareError::Download(detail("unsupported url scheme")));
        }
        info!("Flashing {} (md5 {})", url, md5);
        self.uptime_ms += 60_000;
        self.staged_firmware = Some(url.to_string());
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }

    fn rollback(&mut self) -> Result<(), FirmwareError> {
        info!("Rolling back to previous firmware");
        Ok(())
    }
}

impl SensorSource for SimBoard {
    fn read_water(&mut self, timestamp: u32) -> Option<WaterSensorEntry> {
        let t = self.t();
        Some(WaterSensorEntry {
            timestamp,
            temperature: (14.0 + 3.0 * (t / 43_200.0).sin()) as f32,
            dissolved_oxygen: (8.5 + 1.2 * (t / 21_600.0).cos()) as f32,
            conductivity: (420.0 + 35.0 * (t / 7_200.0).sin()) as f32,
            ph: (7.4 + 0.2 * (t / 10_800.0).sin()) as f32,
            water_level: 130 + (12.0 * (t / 86_400.0).sin()) as i32,
        })
    }

    fn read_weather(&mut self, timestamp: u32) -> Option<WeatherEntry> {
        let t = self.t();
        Some(WeatherEntry {
            timestamp,
            temperature: (18.0 + 6.0 * (t / 43_200.0).sin()) as f32,
            humidity: (60.0 + 15.0 * (t / 43_200.0).cos()) as f32,
            pressure: (1013.0 + 4.0 * (t / 86_400.0).sin()) as f32,
            wind_speed: (3.0 + 2.5 * (t / 1_800.0).sin()).max(0.0) as f32,
            wind_direction: ((t / 60.0) % 360.0) as f32,
            rain: 0.0,
        })
    }

    fn read_soil(&mut self, timestamp: u32) -> Option<SoilMoistureEntry> {
        let t = self.t();
        Some(SoilMoistureEntry {
            timestamp,
            moisture: (32.0 - 4.0 * (t / 86_400.0).sin()) as f32,
            temperature: (12.0 + 2.0 * (t / 43_200.0).sin()) as f32,
            conductivity: 0.45,
        })
    }

    fn read_aux(&mut self, timestamp: u32) -> Option<AuxSensorEntry> {
        let t = self.t();
        Some(AuxSensorEntry {
            timestamp,
            temperature: (24.0 + 4.0 * (t / 43_200.0).sin()) as f32,
            humidity: (40.0 + 5.0 * (t / 43_200.0).cos()) as f32,
            pressure_hpa: 1013,
            altitude_m: 112,
        })
    }
}

impl DelayNs for SimBoard {
    fn delay_ns(&mut self, ns: u32) {
        self.uptime_ms += u64::from(ns / 1_000_000);
    }
}
