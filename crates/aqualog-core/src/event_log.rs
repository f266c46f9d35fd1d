//! Persistent event log.
//!
//! Diagnostic events are structured (code + two metadata words) and stored
//! in their own [`DataStore`], so they follow the same buffering, CRC and
//! upload rules as sensor telemetry.

use log::{info, warn};

use crate::config::{LOG_DATA_DIR, LOG_ENTRIES_PER_SUBMIT_REQ};
use crate::records::LogEntry;
use crate::storage::{DataStore, FileSystem, StoreError};

/// Event codes. Values are part of the stored and uploaded format.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCode {
    /// meta1: firmware version
    Boot = 1,
    /// Reboot after a clean, requested restart
    Restart = 2,
    CallingHome = 3,
    TimeSync = 4,
    /// meta1: records submitted, meta2: crc failures
    SensorDataSubmitted = 5,
    /// meta1: total requests, meta2: failed requests
    SensorDataSubmissionErrors = 6,
    LogSubmitted = 7,
    SensorDataCrcErrors = 9,
    LogDataCrcErrors = 10,
    ConfigDataCrcErrors = 11,
    /// meta1: seconds awake since the last wake-up
    Sleep = 12,
    /// meta1: wake reason bits
    Wakeup = 13,
    NtpTimeSyncFailed = 14,
    /// meta1: millivolts, meta2: percent
    Battery = 15,
    IntEnvSensor1 = 16,
    IntEnvSensor2 = 17,
    BatteryGsm = 18,
    RemoteControlParseFailed = 19,
    RemoteControlInvalidFormat = 20,
    /// meta1: requested firmware version
    OtaRequested = 21,
    OtaNoFwVersion = 22,
    OtaFwSameVersion = 23,
    OtaFwUrlNotSet = 24,
    OtaMd5NotSet = 25,
    OtaFailed = 26,
    OtaSelfTestPassed = 27,
    OtaSelfTestFailed = 28,
    OtaRollingBack = 29,
    OtaRollbackNotPossible = 30,
    CallingHomeEnd = 31,
    /// meta1: used KiB, meta2: total KiB
    FsSpace = 32,
    WeatherDataSubmitted = 33,
    WeatherDataSubmissionErrors = 34,
    WeatherDataCrcErrors = 35,
    SoilDataSubmitted = 36,
    SoilDataSubmissionErrors = 37,
    SoilDataCrcErrors = 38,
    AuxDataSubmitted = 39,
    AuxDataSubmissionErrors = 40,
    AuxDataCrcErrors = 41,
    UnexpectedReboot = 42,
    /// meta1: RTC timestamp that failed the check
    RtcCheckFailed = 43,
    LogSubmissionErrors = 44,
    /// meta1: records dropped from RAM buffers
    StoreRecordsDropped = 45,
    ClientAttributesFailed = 46,
    /// meta1: remote control data id
    RemoteControlApplied = 47,
    /// meta1: rejected value, meta2: wake reason bits
    RemoteControlIntervalRejected = 48,
    GsmConnectFailed = 100,
    /// meta1: RSSI in dBm, as i32 bits
    GsmRssi = 101,
    GsmNoSimCard = 102,
}

impl LogCode {
    const ALL: [LogCode; 50] = [
        LogCode::Boot,
        LogCode::Restart,
        LogCode::CallingHome,
        LogCode::TimeSync,
        LogCode::SensorDataSubmitted,
        LogCode::SensorDataSubmissionErrors,
        LogCode::LogSubmitted,
        LogCode::SensorDataCrcErrors,
        LogCode::LogDataCrcErrors,
        LogCode::ConfigDataCrcErrors,
        LogCode::Sleep,
        LogCode::Wakeup,
        LogCode::NtpTimeSyncFailed,
        LogCode::Battery,
        LogCode::IntEnvSensor1,
        LogCode::IntEnvSensor2,
        LogCode::BatteryGsm,
        LogCode::RemoteControlParseFailed,
        LogCode::RemoteControlInvalidFormat,
        LogCode::OtaRequested,
        LogCode::OtaNoFwVersion,
        LogCode::OtaFwSameVersion,
        LogCode::OtaFwUrlNotSet,
        LogCode::OtaMd5NotSet,
        LogCode::OtaFailed,
        LogCode::OtaSelfTestPassed,
        LogCode::OtaSelfTestFailed,
        LogCode::OtaRollingBack,
        LogCode::OtaRollbackNotPossible,
        LogCode::CallingHomeEnd,
        LogCode::FsSpace,
        LogCode::WeatherDataSubmitted,
        LogCode::WeatherDataSubmissionErrors,
        LogCode::WeatherDataCrcErrors,
        LogCode::SoilDataSubmitted,
        LogCode::SoilDataSubmissionErrors,
        LogCode::SoilDataCrcErrors,
        LogCode::AuxDataSubmitted,
        LogCode::AuxDataSubmissionErrors,
        LogCode::AuxDataCrcErrors,
        LogCode::UnexpectedReboot,
        LogCode::RtcCheckFailed,
        LogCode::LogSubmissionErrors,
        LogCode::StoreRecordsDropped,
        LogCode::ClientAttributesFailed,
        LogCode::RemoteControlApplied,
        LogCode::RemoteControlIntervalRejected,
        LogCode::GsmConnectFailed,
        LogCode::GsmRssi,
        LogCode::GsmNoSimCard,
    ];

    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| *c as u16 == value)
    }
}

/// Append-only diagnostic event log backed by the `/log` store.
pub struct EventLog {
    store: DataStore<LogEntry>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            store: DataStore::new(LOG_DATA_DIR, LOG_ENTRIES_PER_SUBMIT_REQ),
        }
    }

    /// Records an event. Storage failures are reported on the console only;
    /// the entry stays buffered for the next commit.
    pub fn log<F: FileSystem>(
        &mut self,
        fs: &mut F,
        timestamp: u32,
        code: LogCode,
        meta1: u32,
        meta2: u32,
    ) {
        info!(" [event] {:?} meta1={} meta2={}", code, meta1, meta2);
        let entry = LogEntry::new(timestamp, code as u16, meta1, meta2);
        if let Err(e) = self.store.add(fs, entry) {
            warn!(" Failed to store log entry {:?}: {:?}", code, e);
        }
    }

    pub fn commit<F: FileSystem>(&mut self, fs: &mut F) -> Result<(), StoreError> {
        self.store.commit(fs)
    }

    pub fn store(&self) -> &DataStore<LogEntry> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut DataStore<LogEntry> {
        &mut self.store
    }
}
