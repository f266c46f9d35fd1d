//! Top level device session: boot handling and the sleep/wake cycle.
//!
//! ```text
//! start()        boot bookkeeping, OTA self test
//! loop {
//!   run_cycle()  commit -> sleep -> read sensors? -> call home?
//! }
//! ```

use log::{error, info, warn};
use thiserror_no_std::Error;

use crate::call_home::{CallHome, CallHomeError, CallHomeReport};
use crate::config::{
    AUX_SENSOR_DATA_DIR, BATTERY_LEVEL_CRITICAL, BackendConfig, FAIL_CHECK_TIMESTAMP, FirmwareInfo,
    SENSOR_DATA_ENTRIES_PER_SUBMIT_REQ, SOIL_MOISTURE_DATA_DIR, WATER_SENSOR_DATA_DIR,
    WEATHER_DATA_DIR,
};
use crate::device_config::{DeviceConfig, KeyValueStore};
use crate::event_log::{EventLog, LogCode};
use crate::hal::Board;
use crate::ota::{self, SelfTestOutcome};
use crate::records::{AuxSensorEntry, SoilMoistureEntry, WaterSensorEntry, WeatherEntry};
use crate::scheduler::{
    BATTERY_CRITICAL_WAKEUP_SCHEDULE, Scheduler, SleepReport, WakeupReason, WakeupSchedule,
};
use crate::storage::{DataStore, FileSystem, StoreError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Backend access token not configured")]
    MissingIdentity,
    #[error("Wake-up schedule has no active entry")]
    EmptySchedule,
}

/// The sensor data stores, one per record type.
pub struct TelemetryStores {
    pub water: DataStore<WaterSensorEntry>,
    pub weather: DataStore<WeatherEntry>,
    pub soil: DataStore<SoilMoistureEntry>,
    pub aux: DataStore<AuxSensorEntry>,
}

impl Default for TelemetryStores {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStores {
    pub fn new() -> Self {
        Self {
            water: DataStore::new(WATER_SENSOR_DATA_DIR, SENSOR_DATA_ENTRIES_PER_SUBMIT_REQ),
            weather: DataStore::new(WEATHER_DATA_DIR, SENSOR_DATA_ENTRIES_PER_SUBMIT_REQ),
            soil: DataStore::new(SOIL_MOISTURE_DATA_DIR, SENSOR_DATA_ENTRIES_PER_SUBMIT_REQ),
            aux: DataStore::new(AUX_SENSOR_DATA_DIR, SENSOR_DATA_ENTRIES_PER_SUBMIT_REQ),
        }
    }

    /// Flushes every store. All are attempted; the first error is returned.
    pub fn commit_all<F: FileSystem>(&mut self, fs: &mut F) -> Result<(), StoreError> {
        let results = [
            self.water.commit(fs),
            self.weather.commit(fs),
            self.soil.commit(fs),
            self.aux.commit(fs),
        ];
        results.into_iter().collect()
    }

    pub fn dropped_records(&self) -> u32 {
        self.water.dropped_records()
            + self.weather.dropped_records()
            + self.soil.dropped_records()
            + self.aux.dropped_records()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootReport {
    pub clean_reboot: bool,
    pub config_crc_errors: u32,
    pub self_test: Option<SelfTestOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub sleep: SleepReport,
    pub rtc_valid: bool,
    pub sensors_read: bool,
    pub call_home: Option<Result<CallHomeReport, CallHomeError>>,
}

pub struct Node<F: FileSystem, K: KeyValueStore, B: Board> {
    fs: F,
    config: DeviceConfig<K>,
    board: B,
    stores: TelemetryStores,
    event_log: EventLog,
    scheduler: Scheduler,
    backend: BackendConfig,
    firmware: FirmwareInfo,
    /// Dropped record count already written to the event log
    reported_drops: u32,
}

impl<F: FileSystem, K: KeyValueStore, B: Board> Node<F, K, B> {
    pub fn new(
        fs: F,
        kv: K,
        board: B,
        backend: BackendConfig,
        firmware: FirmwareInfo,
        mins_as_secs: bool,
    ) -> Result<Self, NodeError> {
        if !backend.has_identity() {
            return Err(NodeError::MissingIdentity);
        }

        Ok(Self {
            fs,
            config: DeviceConfig::new(kv),
            board,
            stores: TelemetryStores::new(),
            event_log: EventLog::new(),
            scheduler: Scheduler::new(mins_as_secs),
            backend,
            firmware,
            reported_drops: 0,
        })
    }

    /// Boot bookkeeping. Runs once before the first cycle.
    pub fn start(&mut self) -> BootReport {
        info!(" Starting {} fw v{}", self.backend.device_name, self.firmware.version);

        if let Err(e) = self.config.init() {
            error!(" Running on in-RAM defaults: {}", e);
        }

        self.log(LogCode::Boot, self.firmware.version, self.firmware.features);
        let config_crc_errors = self.config.crc_errors();
        if config_crc_errors > 0 {
            self.log(LogCode::ConfigDataCrcErrors, config_crc_errors, 0);
        }

        let clean_reboot = self.config.clean_reboot();
        if clean_reboot {
            self.config.set_clean_reboot(false);
            if let Err(e) = self.config.commit() {
                warn!(" Could not clear clean reboot flag: {}", e);
            }
            self.log(LogCode::Restart, 0, 0);
        } else {
            warn!(" Previous run did not end with a requested restart");
            self.log(LogCode::UnexpectedReboot, 0, 0);
        }

        let self_test = self.config.ota_flashed().then(|| self.ota_self_test());
        self.commit_log();

        BootReport {
            clean_reboot,
            config_crc_errors,
            self_test,
        }
    }

    fn ota_self_test(&mut self) -> SelfTestOutcome {
        let outcome = ota::first_boot_self_test(&mut self.board, &mut self.config, &self.backend);
        let version = self.firmware.version;

        match outcome {
            SelfTestOutcome::Passed => self.log(LogCode::OtaSelfTestPassed, version, 0),
            SelfTestOutcome::RolledBack => {
                self.log(LogCode::OtaSelfTestFailed, version, 0);
                self.log(LogCode::OtaRollingBack, version, 0);
                self.commit_log();
                self.board.restart();
            }
            SelfTestOutcome::RollbackNotPossible => {
                self.log(LogCode::OtaSelfTestFailed, version, 0);
                self.log(LogCode::OtaRollbackNotPossible, version, 0);
            }
            SelfTestOutcome::RollbackFailed => {
                self.log(LogCode::OtaSelfTestFailed, version, 0);
                self.log(LogCode::OtaFailed, version, 0);
            }
        }
        outcome
    }

    /// Schedule in effect given the current battery level.
    pub fn active_schedule(&mut self) -> WakeupSchedule {
        match self.board.battery() {
            Some(battery) if battery.percent <= BATTERY_LEVEL_CRITICAL => {
                warn!(" Battery at {}%, using critical schedule", battery.percent);
                BATTERY_CRITICAL_WAKEUP_SCHEDULE
            }
            _ => *self.config.wakeup_schedule(),
        }
    }

    /// Sleeps until the next scheduled event and handles it.
    pub fn run_cycle(&mut self) -> Result<CycleReport, NodeError> {
        let awake_s = self.scheduler.awake_ms(&self.board) / 1000;
        self.log(LogCode::Sleep, awake_s as u32, 0);
        self.commit_all();

        let schedule = self.active_schedule();
        let sleep = self
            .scheduler
            .sleep(&mut self.board, &schedule)
            .ok_or(NodeError::EmptySchedule)?;
        self.log(LogCode::Wakeup, u32::from(sleep.reasons.bits()), 0);

        let timestamp = self.board.timestamp();
        let rtc_valid = timestamp > FAIL_CHECK_TIMESTAMP;
        if !rtc_valid {
            error!(" RTC reads {}, clock not set", timestamp);
            self.log(LogCode::RtcCheckFailed, timestamp, 0);
        }

        let mut sensors_read = false;
        if sleep.reasons.contains(WakeupReason::ReadSensors) {
            if rtc_valid {
                self.read_sensors(timestamp);
                sensors_read = true;
            } else {
                warn!(" Skipping sensor read without a valid timestamp");
            }
        }

        let call_home = if sleep.reasons.contains(WakeupReason::CallHome) {
            let result = self.call_home();
            if let Err(e) = &result {
                error!(" Call home failed: {}", e);
            }
            Some(result)
        } else {
            None
        };

        self.commit_all();

        Ok(CycleReport {
            sleep,
            rtc_valid,
            sensors_read,
            call_home,
        })
    }

    pub fn call_home(&mut self) -> Result<CallHomeReport, CallHomeError> {
        CallHome {
            fs: &mut self.fs,
            config: &mut self.config,
            board: &mut self.board,
            stores: &mut self.stores,
            event_log: &mut self.event_log,
            backend: &self.backend,
            firmware: &self.firmware,
        }
        .run()
    }

    fn read_sensors(&mut self, timestamp: u32) {
        info!(" Reading sensors");

        match self.board.read_water(timestamp) {
            Some(entry) => {
                if let Err(e) = self.stores.water.add(&mut self.fs, entry) {
                    warn!(" Water reading not stored: {}", e);
                }
            }
            None => warn!(" No water sensor reading"),
        }

        if let Some(entry) = self.board.read_weather(timestamp) {
            if let Err(e) = self.stores.weather.add(&mut self.fs, entry) {
                warn!(" Weather reading not stored: {}", e);
            }
        }
        if let Some(entry) = self.board.read_soil(timestamp) {
            if let Err(e) = self.stores.soil.add(&mut self.fs, entry) {
                warn!(" Soil reading not stored: {}", e);
            }
        }
        if let Some(entry) = self.board.read_aux(timestamp) {
            if let Err(e) = self.stores.aux.add(&mut self.fs, entry) {
                warn!(" Aux reading not stored: {}", e);
            }
        }
    }

    fn log(&mut self, code: LogCode, meta1: u32, meta2: u32) {
        let ts = self.board.timestamp();
        self.event_log.log(&mut self.fs, ts, code, meta1, meta2);
    }

    fn commit_log(&mut self) {
        if let Err(e) = self.event_log.commit(&mut self.fs) {
            error!(" Event log not committed: {}", e);
        }
    }

    /// Flushes all stores and reports newly dropped records.
    fn commit_all(&mut self) {
        if let Err(e) = self.stores.commit_all(&mut self.fs) {
            warn!(" Sensor data not fully committed: {}", e);
        }

        let dropped = self.stores.dropped_records() + self.event_log.store().dropped_records();
        if dropped > self.reported_drops {
            self.log(
                LogCode::StoreRecordsDropped,
                dropped - self.reported_drops,
                dropped,
            );
            self.reported_drops = dropped;
        }

        self.commit_log();
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut F {
        &mut self.fs
    }

    pub fn config(&self) -> &DeviceConfig<K> {
        &self.config
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn stores(&self) -> &TelemetryStores {
        &self.stores
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Tears the session down, keeping only the board. Buffered records
    /// not yet committed are lost, as on a real reset.
    pub fn into_board(self) -> B {
        self.board
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LOG_DATA_DIR;
    use crate::device_config::MemKeyValueStore;
    use crate::hal::{BatteryStatus, Response};
    use crate::records::LogEntry;
    use crate::scheduler::DEFAULT_WAKEUP_SCHEDULE;
    use crate::storage::{DataStoreReader, MemFileSystem};
    use crate::test_support::MockBoard;
    use alloc::string::String;
    use alloc::vec::Vec;

    type TestNode = Node<MemFileSystem, MemKeyValueStore, MockBoard>;

    fn backend() -> BackendConfig {
        BackendConfig {
            access_token: String::from("TOKEN"),
            device_name: String::from("node-test"),
        }
    }

    fn firmware() -> FirmwareInfo {
        FirmwareInfo {
            version: 7,
            features: 0,
        }
    }

    fn node_with(kv: MemKeyValueStore, board: MockBoard) -> TestNode {
        Node::new(MemFileSystem::default(), kv, board, backend(), firmware(), true).unwrap()
    }

    fn stored_codes(node: &mut TestNode) -> Vec<u16> {
        let mut reader = DataStoreReader::<LogEntry>::new(LOG_DATA_DIR);
        let mut codes = Vec::new();
        while reader.next_file(node.fs_mut()).unwrap() {
            while let Some(e) = reader.next_entry(node.fs_mut()).unwrap() {
                codes.push(e.code);
            }
        }
        codes
    }

    #[test]
    fn test_requires_access_token() {
        let result = Node::new(
            MemFileSystem::default(),
            MemKeyValueStore::default(),
            MockBoard::default(),
            BackendConfig::default(),
            firmware(),
            false,
        );
        assert!(matches!(result, Err(NodeError::MissingIdentity)));
    }

    #[test]
    fn test_first_boot_is_unexpected_reboot() {
        let mut node = node_with(MemKeyValueStore::default(), MockBoard::default());
        let boot = node.start();
        assert!(!boot.clean_reboot);
        assert_eq!(boot.self_test, None);

        let codes = stored_codes(&mut node);
        assert_eq!(codes[0], LogCode::Boot as u16);
        assert!(codes.contains(&(LogCode::UnexpectedReboot as u16)));
    }

    #[test]
    fn test_clean_reboot_flag_consumed() {
        let mut cfg = DeviceConfig::new(MemKeyValueStore::default());
        cfg.set_clean_reboot(true);
        cfg.commit().unwrap();

        let mut node = node_with(cfg.store().clone(), MockBoard::default());
        assert!(node.start().clean_reboot);
        assert!(!node.config().clean_reboot());
        assert!(stored_codes(&mut node).contains(&(LogCode::Restart as u16)));

        let mut reloaded = DeviceConfig::new(node.config().store().clone());
        reloaded.load().unwrap();
        assert!(!reloaded.clean_reboot(), "cleared flag persisted");
    }

    #[test]
    fn test_ota_self_test_failure_rolls_back_and_restarts() {
        let mut cfg = DeviceConfig::new(MemKeyValueStore::default());
        cfg.set_ota_flashed(true);
        cfg.commit().unwrap();

        let mut board = MockBoard::default();
        board.shared_attributes = Ok(Response {
            status: 500,
            body: Vec::new(),
        });
        board.rollback_available = true;

        let mut node = node_with(cfg.store().clone(), board);
        let boot = node.start();
        assert_eq!(boot.self_test, Some(SelfTestOutcome::RolledBack));
        assert_eq!(node.board().platform.restarts, 1);
        assert!(!node.config().ota_flashed());

        let codes = stored_codes(&mut node);
        assert!(codes.contains(&(LogCode::OtaSelfTestFailed as u16)));
        assert!(codes.contains(&(LogCode::OtaRollingBack as u16)), "logged before restart");
    }

    #[test]
    fn test_ota_self_test_pass() {
        let mut cfg = DeviceConfig::new(MemKeyValueStore::default());
        cfg.set_ota_flashed(true);
        cfg.commit().unwrap();

        let mut node = node_with(cfg.store().clone(), MockBoard::default());
        assert_eq!(node.start().self_test, Some(SelfTestOutcome::Passed));
        assert!(stored_codes(&mut node).contains(&(LogCode::OtaSelfTestPassed as u16)));
    }

    #[test]
    fn test_cycle_reads_sensors_on_schedule() {
        let mut node = node_with(MemKeyValueStore::default(), MockBoard::default());
        node.start();

        let report = node.run_cycle().unwrap();
        assert!(report.sleep.reasons.contains(WakeupReason::ReadSensors));
        assert!(report.sensors_read);
        assert!(report.call_home.is_none());
        assert_eq!(node.scheduler().clock_mins(), 5);

        let files = node.fs_mut().list(WATER_SENSOR_DATA_DIR).unwrap();
        assert_eq!(files.len(), 1, "reading committed at the end of the cycle");
    }

    #[test]
    fn test_call_home_every_fifth_cycle() {
        let mut board = MockBoard::default();
        board.all_sensors = true;
        let mut node = node_with(MemKeyValueStore::default(), board);
        node.start();

        let mut call_homes = Vec::new();
        for cycle in 1..=5 {
            let report = node.run_cycle().unwrap();
            if let Some(result) = report.call_home {
                assert!(result.is_ok());
                call_homes.push(cycle);
            }
        }
        assert_eq!(call_homes, [5]);

        // 25 minute call home coincides with the 5 minute read
        for dir in [WATER_SENSOR_DATA_DIR, WEATHER_DATA_DIR, SOIL_MOISTURE_DATA_DIR, AUX_SENSOR_DATA_DIR] {
            assert!(node.fs_mut().list(dir).unwrap().is_empty(), "{} drained", dir);
        }
    }

    #[test]
    fn test_low_battery_uses_critical_schedule() {
        let mut cfg = DeviceConfig::new(MemKeyValueStore::default());
        let mut schedule = DEFAULT_WAKEUP_SCHEDULE;
        schedule[0].interval_mins = 60;
        cfg.set_wakeup_schedule(schedule);
        cfg.commit().unwrap();

        let mut board = MockBoard::default();
        board.platform.battery = Some(BatteryStatus {
            millivolts: 3_300,
            percent: BATTERY_LEVEL_CRITICAL,
        });
        let mut node = node_with(cfg.store().clone(), board);
        node.start();

        assert_eq!(node.active_schedule(), BATTERY_CRITICAL_WAKEUP_SCHEDULE);
        node.board_mut().platform.battery = Some(BatteryStatus {
            millivolts: 3_900,
            percent: 75,
        });
        assert_eq!(node.active_schedule(), schedule);
    }

    #[test]
    fn test_invalid_rtc_skips_sensor_read() {
        let mut board = MockBoard::default();
        board.platform.timestamp = 1_000;
        let mut node = node_with(MemKeyValueStore::default(), board);
        node.start();

        let report = node.run_cycle().unwrap();
        assert!(!report.rtc_valid);
        assert!(!report.sensors_read);
        assert!(node.fs_mut().list(WATER_SENSOR_DATA_DIR).unwrap().is_empty());
        assert!(stored_codes(&mut node).contains(&(LogCode::RtcCheckFailed as u16)));
    }

    #[test]
    fn test_empty_schedule_is_an_error() {
        let mut cfg = DeviceConfig::new(MemKeyValueStore::default());
        let mut schedule = DEFAULT_WAKEUP_SCHEDULE;
        for entry in &mut schedule {
            entry.interval_mins = 0;
        }
        cfg.set_wakeup_schedule(schedule);
        cfg.commit().unwrap();

        let mut node = node_with(cfg.store().clone(), MockBoard::default());
        node.start();
        assert_eq!(node.run_cycle().unwrap_err(), NodeError::EmptySchedule);
    }

    #[test]
    fn test_failed_call_home_keeps_data() {
        let mut board = MockBoard::default();
        board.connect_failures = usize::MAX;
        let mut node = node_with(MemKeyValueStore::default(), board);
        node.start();

        let mut failures = 0;
        for _ in 0..5 {
            if let Some(Err(_)) = node.run_cycle().unwrap().call_home {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
        assert_eq!(node.board().telemetry_requests(), 0);
        assert!(!node.fs_mut().list(WATER_SENSOR_DATA_DIR).unwrap().is_empty());
    }
}
