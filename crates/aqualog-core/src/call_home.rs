//! Call-home cycle: bring the link up, exchange remote control data, publish
//! client attributes and drain every telemetry store to the backend.
//!
//! Abort points:
//! - modem cannot connect: nothing else can be done
//! - remote control fetch fails at the transport level: the link is too
//!   unreliable to spend energy on uploads
//!
//! Telemetry is drained one chunk file per request. A file is deleted only
//! after the backend accepted it, or when none of its records pass the CRC
//! check. Failed files stay on flash for the next cycle.

use core::ops::AddAssign;

use alloc::vec::Vec;
use embedded_hal::delay::DelayNs;
use log::{error, info, warn};
use serde::Serialize;
use thiserror_no_std::Error;

use crate::config::{BackendConfig, FirmwareInfo, GSM_RETRY_DELAY_MS, GSM_TRIES};
use crate::device_config::{DeviceConfig, KeyValueStore};
use crate::event_log::{EventLog, LogCode};
use crate::hal::{Board, HttpClient, LinkError, Method, Modem};
use crate::node::TelemetryStores;
use crate::ota;
use crate::payload::{self, ClientAttributes};
use crate::remote_control::{self, IntervalChange, RemoteControlError, RemoteControlOutcome};
use crate::scheduler::WakeupReason;
use crate::storage::{DataStore, DataStoreReader, FileSystem, Record, StoreError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallHomeError {
    #[error("Modem connection failed: {0}")]
    Connect(LinkError),
    #[error("{0}")]
    RemoteControl(RemoteControlError),
}

/// Powers the modem through up to [`GSM_TRIES`] connection attempts.
pub fn connect_persist<M: Modem + DelayNs>(modem: &mut M) -> Result<(), LinkError> {
    let mut last_err = LinkError::Connect(crate::error::detail("no attempt made"));

    for attempt in 1..=GSM_TRIES {
        match modem.connect() {
            Ok(()) => {
                info!(" Modem connected (attempt {}/{})", attempt, GSM_TRIES);
                return Ok(());
            }
            // Power cycling will not insert a SIM card
            Err(LinkError::NoSimCard) => return Err(LinkError::NoSimCard),
            Err(e) => {
                warn!(" Connect attempt {}/{} failed: {}", attempt, GSM_TRIES, e);
                last_err = e;
            }
        }

        if attempt < GSM_TRIES {
            if let Err(e) = modem.power_cycle() {
                warn!(" Modem power cycle failed: {}", e);
            }
            modem.delay_ms(GSM_RETRY_DELAY_MS);
        }
    }

    Err(last_err)
}

/// Counters for one drained store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Records read from flash
    pub total_entries: u32,
    /// Records that passed the CRC check and were put in a request
    pub submitted_entries: u32,
    /// Records in requests the backend accepted
    pub successful_entries: u32,
    pub crc_failures: u32,
    pub total_requests: u32,
    pub failed_requests: u32,
}

impl AddAssign for DrainStats {
    fn add_assign(&mut self, rhs: Self) {
        self.total_entries += rhs.total_entries;
        self.submitted_entries += rhs.submitted_entries;
        self.successful_entries += rhs.successful_entries;
        self.crc_failures += rhs.crc_failures;
        self.total_requests += rhs.total_requests;
        self.failed_requests += rhs.failed_requests;
    }
}

/// Uploads every chunk file of `store`, one request per file.
///
/// Buffered records are committed first so they are included.
pub fn submit_stored_telemetry<R, F, H>(
    fs: &mut F,
    store: &mut DataStore<R>,
    http: &mut H,
    path: &str,
) -> Result<DrainStats, StoreError>
where
    R: Record + Serialize,
    F: FileSystem,
    H: HttpClient,
{
    if let Err(e) = store.commit(fs) {
        warn!(" {}: buffered records not flushed before upload: {}", store.dir(), e);
    }

    let mut stats = DrainStats::default();
    let mut reader = DataStoreReader::<R>::new(store.dir());

    while reader.next_file(fs)? {
        let mut valid = Vec::with_capacity(store.entries_per_file());
        let mut read_error = None;

        loop {
            match reader.next_entry(fs) {
                Ok(Some(record)) => {
                    stats.total_entries += 1;
                    if reader.entry_crc_valid() {
                        valid.push(record);
                    } else {
                        stats.crc_failures += 1;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = read_error {
            error!(" Failed reading {:?}, leaving it: {}", reader.current_file(), e);
            continue;
        }

        if valid.is_empty() {
            warn!(" Deleting {:?}, no valid records", reader.current_file());
            if let Err(e) = reader.delete_file(fs) {
                error!(" Delete failed: {}", e);
            }
            continue;
        }

        let count = valid.len() as u32;
        stats.submitted_entries += count;
        stats.total_requests += 1;

        if submit(http, path, &valid) {
            stats.successful_entries += count;
            if let Err(e) = reader.delete_file(fs) {
                // Re-sent next cycle; the backend tolerates duplicates
                error!(" Delete after upload failed: {}", e);
            }
        } else {
            stats.failed_requests += 1;
            warn!(" Upload of {:?} failed, kept for retry", reader.current_file());
        }
    }

    info!(
        " {}: {} read, {} submitted, {} accepted, {} bad crc, {}/{} requests failed",
        store.dir(),
        stats.total_entries,
        stats.submitted_entries,
        stats.successful_entries,
        stats.crc_failures,
        stats.failed_requests,
        stats.total_requests
    );
    Ok(stats)
}

fn submit<R: Record + Serialize, H: HttpClient>(http: &mut H, path: &str, records: &[R]) -> bool {
    let body = match payload::build_telemetry(records) {
        Ok(body) => body,
        Err(e) => {
            error!(" Telemetry payload not built: {}", e);
            return false;
        }
    };

    match http.request(Method::Post, path, &body) {
        Ok(resp) if resp.is_success() => true,
        Ok(resp) => {
            warn!(" Telemetry rejected with HTTP {}", resp.status);
            false
        }
        Err(e) => {
            warn!(" Telemetry request failed: {}", e);
            false
        }
    }
}

/// Log codes reported after draining one store.
struct DrainCodes {
    submitted: LogCode,
    submission_errors: LogCode,
    crc_errors: LogCode,
}

const WATER_CODES: DrainCodes = DrainCodes {
    submitted: LogCode::SensorDataSubmitted,
    submission_errors: LogCode::SensorDataSubmissionErrors,
    crc_errors: LogCode::SensorDataCrcErrors,
};

const WEATHER_CODES: DrainCodes = DrainCodes {
    submitted: LogCode::WeatherDataSubmitted,
    submission_errors: LogCode::WeatherDataSubmissionErrors,
    crc_errors: LogCode::WeatherDataCrcErrors,
};

const SOIL_CODES: DrainCodes = DrainCodes {
    submitted: LogCode::SoilDataSubmitted,
    submission_errors: LogCode::SoilDataSubmissionErrors,
    crc_errors: LogCode::SoilDataCrcErrors,
};

const AUX_CODES: DrainCodes = DrainCodes {
    submitted: LogCode::AuxDataSubmitted,
    submission_errors: LogCode::AuxDataSubmissionErrors,
    crc_errors: LogCode::AuxDataCrcErrors,
};

const LOG_CODES: DrainCodes = DrainCodes {
    submitted: LogCode::LogSubmitted,
    submission_errors: LogCode::LogSubmissionErrors,
    crc_errors: LogCode::LogDataCrcErrors,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallHomeReport {
    pub remote_control: Option<RemoteControlOutcome>,
    pub client_attributes_sent: bool,
    /// A new firmware image was flashed this cycle
    pub ota_flashed: bool,
    /// The cycle ended in a requested restart, telemetry was skipped
    pub restarted: bool,
    pub water: DrainStats,
    pub weather: DrainStats,
    pub soil: DrainStats,
    pub aux: DrainStats,
    pub log: DrainStats,
}

impl CallHomeReport {
    /// Counters summed over every store.
    pub fn totals(&self) -> DrainStats {
        let mut total = DrainStats::default();
        for stats in [self.water, self.weather, self.soil, self.aux, self.log] {
            total += stats;
        }
        total
    }
}

/// Borrowed view of the node state needed for one call-home cycle.
pub struct CallHome<'a, F: FileSystem, K: KeyValueStore, B: Board> {
    pub fs: &'a mut F,
    pub config: &'a mut DeviceConfig<K>,
    pub board: &'a mut B,
    pub stores: &'a mut TelemetryStores,
    pub event_log: &'a mut EventLog,
    pub backend: &'a BackendConfig,
    pub firmware: &'a FirmwareInfo,
}

impl<F: FileSystem, K: KeyValueStore, B: Board> CallHome<'_, F, K, B> {
    pub fn run(&mut self) -> Result<CallHomeReport, CallHomeError> {
        info!(" ==== Calling home ====");
        self.log(LogCode::CallingHome, 0, 0);
        self.log_battery();
        self.log_fs_space();

        if let Err(e) = self.connect() {
            error!(" Could not connect modem, aborting call home: {}", e);
            let code = match e {
                LinkError::NoSimCard => LogCode::GsmNoSimCard,
                _ => LogCode::GsmConnectFailed,
            };
            self.log(code, 0, 0);
            self.finish();
            return Err(CallHomeError::Connect(e));
        }

        if let Some(rssi) = self.board.rssi() {
            self.log(LogCode::GsmRssi, rssi as u32, 0);
        }
        if let Some(battery) = self.board.gsm_battery() {
            self.log(
                LogCode::BatteryGsm,
                battery.millivolts,
                u32::from(battery.percent),
            );
        }

        let mut report = CallHomeReport::default();
        let mut reboot_pending = false;

        match self.handle_remote_control() {
            Ok(outcome) => {
                if let RemoteControlOutcome::Applied(changes) = outcome {
                    if changes.ota_requested && self.handle_ota() {
                        report.ota_flashed = true;
                        reboot_pending = true;
                    }
                    reboot_pending |= changes.reboot_requested;
                }
                report.remote_control = Some(outcome);
            }
            Err(e) if e.is_transport() => {
                error!(" Remote control fetch failed, aborting call home: {}", e);
                self.finish();
                return Err(CallHomeError::RemoteControl(e));
            }
            Err(e) => {
                warn!(" Remote control not applied: {}", e);
                let code = match e {
                    RemoteControlError::Parse(_) => Some(LogCode::RemoteControlParseFailed),
                    RemoteControlError::MissingDataId => Some(LogCode::RemoteControlInvalidFormat),
                    _ => None,
                };
                if let Some(code) = code {
                    self.log(code, 0, 0);
                }
            }
        }

        report.client_attributes_sent = self.publish_client_attributes();

        if reboot_pending {
            info!(" Device reboot requested. Rebooting...");
            self.config.set_clean_reboot(true);
            if let Err(e) = self.config.commit() {
                error!(" Failed to persist clean reboot flag: {}", e);
            }
            if let Err(e) = self.stores.commit_all(self.fs) {
                warn!(" Sensor data not fully committed before restart: {}", e);
            }
            self.finish();
            report.restarted = true;
            self.board.restart();
            return Ok(report);
        }

        let path = payload::telemetry_path(&self.backend.access_token);
        report.water = self.drain_water(&path);
        report.weather = self.drain_weather(&path);
        report.soil = self.drain_soil(&path);
        report.aux = self.drain_aux(&path);
        report.log = self.drain_log(&path);

        self.board.power_off();
        self.log(LogCode::CallingHomeEnd, 0, 0);
        self.log_fs_space();
        self.commit_log();
        info!(" ==== Calling home END ====");

        Ok(report)
    }

    fn log(&mut self, code: LogCode, meta1: u32, meta2: u32) {
        let ts = self.board.timestamp();
        self.event_log.log(self.fs, ts, code, meta1, meta2);
    }

    fn commit_log(&mut self) {
        if let Err(e) = self.event_log.commit(self.fs) {
            error!(" Event log not committed: {}", e);
        }
    }

    /// Powers the modem down and persists the event log.
    fn finish(&mut self) {
        self.board.power_off();
        self.commit_log();
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.board.power_on()?;
        connect_persist(self.board)
    }

    fn log_battery(&mut self) {
        if let Some(battery) = self.board.battery() {
            self.log(LogCode::Battery, battery.millivolts, u32::from(battery.percent));
        }
    }

    fn log_fs_space(&mut self) {
        match self.fs.usage() {
            Ok(usage) => self.log(
                LogCode::FsSpace,
                (usage.used_bytes / 1024) as u32,
                (usage.total_bytes / 1024) as u32,
            ),
            Err(e) => warn!(" Filesystem usage unavailable: {}", e),
        }
    }

    fn handle_remote_control(&mut self) -> Result<RemoteControlOutcome, RemoteControlError> {
        let path = payload::shared_attributes_path(&self.backend.access_token);
        let resp = self
            .board
            .request(Method::Get, &path, &[])
            .map_err(RemoteControlError::Transport)?;
        if !resp.is_success() {
            return Err(RemoteControlError::Status(resp.status));
        }

        let doc = remote_control::parse(&resp.body)?;
        let outcome = remote_control::apply(self.config, &doc)?;

        if let RemoteControlOutcome::Applied(changes) = outcome {
            self.log(LogCode::RemoteControlApplied, changes.data_id, 0);
            for (change, reason) in [
                (changes.read_sensors_int, WakeupReason::ReadSensors),
                (changes.call_home_int, WakeupReason::CallHome),
            ] {
                if let IntervalChange::Rejected(requested) = change {
                    self.log(
                        LogCode::RemoteControlIntervalRejected,
                        requested.log_value(),
                        reason as u32,
                    );
                }
            }
        }
        Ok(outcome)
    }

    /// Returns true when a new image was flashed and needs a reboot.
    fn handle_ota(&mut self) -> bool {
        let data = self.config.remote_control_data().clone();
        let request = match ota::validate_request(&data, self.firmware.version) {
            Ok(request) => request,
            Err(rejection) => {
                warn!(" OTA request ignored: {:?}", rejection);
                if let Some(code) = rejection.log_code() {
                    self.log(code, 0, 0);
                }
                return false;
            }
        };

        self.log(LogCode::OtaRequested, request.version, 0);
        match ota::start_update(self.board, self.config, &request) {
            Ok(()) => true,
            Err(e) => {
                error!(" OTA failed: {}", e);
                self.log(LogCode::OtaFailed, request.version, 0);
                false
            }
        }
    }

    fn publish_client_attributes(&mut self) -> bool {
        let attrs = ClientAttributes {
            cur_fw_v: self.firmware.version,
            cur_ws_int: self
                .config
                .get_wakeup_schedule_reason_int(WakeupReason::ReadSensors)
                .unwrap_or(0),
            cur_ch_int: self
                .config
                .get_wakeup_schedule_reason_int(WakeupReason::CallHome)
                .unwrap_or(0),
            uptime_s: self.board.uptime_ms() / 1000,
            features: self.firmware.features,
        };

        let sent = match payload::build_client_attributes(&attrs) {
            Ok(body) => {
                let path = payload::client_attributes_path(&self.backend.access_token);
                matches!(
                    self.board.request(Method::Post, &path, &body),
                    Ok(ref resp) if resp.is_success()
                )
            }
            Err(e) => {
                error!(" Client attributes not built: {}", e);
                false
            }
        };

        if !sent {
            warn!(" Client attributes not published");
            self.log(LogCode::ClientAttributesFailed, 0, 0);
        }
        sent
    }

    fn drain_water(&mut self, path: &str) -> DrainStats {
        let result = submit_stored_telemetry(self.fs, &mut self.stores.water, self.board, path);
        self.report_drain(result, &WATER_CODES)
    }

    fn drain_weather(&mut self, path: &str) -> DrainStats {
        let result = submit_stored_telemetry(self.fs, &mut self.stores.weather, self.board, path);
        self.report_drain(result, &WEATHER_CODES)
    }

    fn drain_soil(&mut self, path: &str) -> DrainStats {
        let result = submit_stored_telemetry(self.fs, &mut self.stores.soil, self.board, path);
        self.report_drain(result, &SOIL_CODES)
    }

    fn drain_aux(&mut self, path: &str) -> DrainStats {
        let result = submit_stored_telemetry(self.fs, &mut self.stores.aux, self.board, path);
        self.report_drain(result, &AUX_CODES)
    }

    /// The event log is drained last; nothing may be logged while it is read.
    fn drain_log(&mut self, path: &str) -> DrainStats {
        let result =
            submit_stored_telemetry(self.fs, self.event_log.store_mut(), self.board, path);
        self.report_drain(result, &LOG_CODES)
    }

    fn report_drain(&mut self, result: Result<DrainStats, StoreError>, codes: &DrainCodes) -> DrainStats {
        let stats = match result {
            Ok(stats) => stats,
            Err(e) => {
                error!(" Store could not be drained: {}", e);
                return DrainStats::default();
            }
        };

        if stats.total_entries == 0 {
            return stats;
        }

        self.log(codes.submitted, stats.submitted_entries, stats.crc_failures);
        if stats.failed_requests > 0 {
            self.log(codes.submission_errors, stats.total_requests, stats.failed_requests);
        }
        if stats.crc_failures > 0 {
            self.log(codes.crc_errors, stats.crc_failures, stats.total_entries);
        }
        stats
    }
}
