//! Persistent device configuration.
//!
//! A single self-protecting blob in key-value storage holds the wake-up
//! schedule, reboot/OTA bookkeeping flags and the last applied remote control
//! data. The blob is only trusted when its CRC32 matches; otherwise defaults
//! are written back.
//!
//! Blob layout:
//! - version: 1 byte
//! - crc32: 4 bytes (u32 LE, computed over the whole blob with this field zeroed)
//! - body: postcard encoded [`DeviceConfigData`]

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::config::{DEVICE_CONFIG_KEY, DEVICE_CONFIG_NAMESPACE};
use crate::crc::crc32_with_zeroed_field;
use crate::error::{ErrorDetail, detail, detail_of};
use crate::scheduler::{DEFAULT_WAKEUP_SCHEDULE, WakeupReason, WakeupSchedule};

pub const DEVICE_CONFIG_VERSION: u8 = 1;
const HEADER_SIZE: usize = 5;
const CRC_OFFSET: usize = 1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KvError {
    #[error("Key-value storage error: {0}")]
    Backend(ErrorDetail),
}

/// NVS-like key-value storage.
pub trait KeyValueStore {
    fn get(&mut self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Stores `value`, returning the number of bytes written.
    fn put(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<usize, KvError>;
}

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default, Clone)]
pub struct MemKeyValueStore {
    entries: BTreeMap<(String, String), Vec<u8>>,
    /// Caps the bytes accepted by `put`, to simulate short writes
    pub write_limit: Option<usize>,
    pub fail_writes: bool,
}

impl MemKeyValueStore {
    pub fn raw_mut(&mut self, namespace: &str, key: &str) -> Option<&mut Vec<u8>> {
        self.entries
            .get_mut(&(String::from(namespace), String::from(key)))
    }
}

impl KeyValueStore for MemKeyValueStore {
    fn get(&mut self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self
            .entries
            .get(&(String::from(namespace), String::from(key)))
            .cloned())
    }

    fn put(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<usize, KvError> {
        if self.fail_writes {
            return Err(KvError::Backend(detail("write rejected")));
        }
        let len = self.write_limit.unwrap_or(value.len()).min(value.len());
        self.entries.insert(
            (String::from(namespace), String::from(key)),
            value[..len].to_vec(),
        );
        Ok(len)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{0}")]
    Storage(#[from] KvError),
    #[error("Config blob not found")]
    NotFound,
    #[error("Unsupported config version {0}")]
    UnsupportedVersion(u8),
    #[error("Config CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },
    #[error("Config decode failed: {0}")]
    Decode(ErrorDetail),
    #[error("Config encode failed: {0}")]
    Encode(ErrorDetail),
    #[error("Config short write: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },
}

/// Remote control document as last applied.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteControlData {
    /// Monotonic id assigned by the backend
    pub data_id: u32,
    /// Requested sensor read interval, 0 when not set
    pub read_sensors_int_mins: u32,
    /// Requested call-home interval, 0 when not set
    pub call_home_int_mins: u32,
    pub reboot: bool,
    pub ota: bool,
    pub fw_version: Option<u32>,
    pub fw_url: String,
    pub fw_md5: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfigData {
    /// Set right before a requested restart, cleared at boot
    pub clean_reboot: bool,
    /// Set after a new image was flashed, cleared at its first boot
    pub ota_flashed: bool,
    pub wakeup_schedule: WakeupSchedule,
    pub remote_control: RemoteControlData,
}

impl Default for DeviceConfigData {
    fn default() -> Self {
        Self {
            clean_reboot: false,
            ota_flashed: false,
            wakeup_schedule: DEFAULT_WAKEUP_SCHEDULE,
            remote_control: RemoteControlData::default(),
        }
    }
}

impl DeviceConfigData {
    /// Encodes the versioned, CRC protected blob.
    pub fn to_blob(&self) -> Result<Vec<u8>, ConfigError> {
        let body = postcard::to_allocvec(self).map_err(|e| ConfigError::Encode(detail_of(e)))?;

        let mut blob = Vec::with_capacity(HEADER_SIZE + body.len());
        blob.push(DEVICE_CONFIG_VERSION);
        blob.extend_from_slice(&[0u8; 4]);
        blob.extend_from_slice(&body);

        let crc = crc32_with_zeroed_field(&blob, CRC_OFFSET);
        blob[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(blob)
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self, ConfigError> {
        if blob.len() < HEADER_SIZE {
            return Err(ConfigError::Decode(detail("blob shorter than header")));
        }
        if blob[0] != DEVICE_CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(blob[0]));
        }

        let stored = u32::from_le_bytes([blob[1], blob[2], blob[3], blob[4]]);
        let computed = crc32_with_zeroed_field(blob, CRC_OFFSET);
        if stored != computed {
            return Err(ConfigError::CrcMismatch { stored, computed });
        }

        postcard::from_bytes(&blob[HEADER_SIZE..]).map_err(|e| ConfigError::Decode(detail_of(e)))
    }
}

/// Owner of the persisted [`DeviceConfigData`].
///
/// Mutators only change the in-RAM copy; call [`commit`](Self::commit) after
/// a logical group of changes to make them durable.
pub struct DeviceConfig<K: KeyValueStore> {
    kv: K,
    current: DeviceConfigData,
    crc_errors: u32,
}

impl<K: KeyValueStore> DeviceConfig<K> {
    pub fn new(kv: K) -> Self {
        Self {
            kv,
            current: DeviceConfigData::default(),
            crc_errors: 0,
        }
    }

    /// Loads the stored config, rewriting defaults if it is missing or corrupt.
    ///
    /// Fails only when the freshly written defaults cannot be read back; the
    /// defaults stay in effect in RAM either way.
    pub fn init(&mut self) -> Result<(), ConfigError> {
        match self.load() {
            Ok(()) => return Ok(()),
            Err(e) => warn!(" Device config not loaded ({}), writing defaults", e),
        }

        self.current = DeviceConfigData::default();
        if let Err(e) = self.commit() {
            error!(" Failed to write default device config: {}", e);
        }

        self.load().inspect_err(|e| {
            error!(" Default device config does not read back: {}", e);
        })
    }

    /// Replaces the in-RAM config with the stored one, if it is valid.
    pub fn load(&mut self) -> Result<(), ConfigError> {
        let blob = self
            .kv
            .get(DEVICE_CONFIG_NAMESPACE, DEVICE_CONFIG_KEY)?
            .ok_or(ConfigError::NotFound)?;

        match DeviceConfigData::from_blob(&blob) {
            Ok(data) => {
                self.current = data;
                info!(" Device config loaded");
                Ok(())
            }
            Err(e) => {
                if matches!(e, ConfigError::CrcMismatch { .. }) {
                    self.crc_errors += 1;
                }
                error!(" Device config rejected: {}", e);
                Err(e)
            }
        }
    }

    pub fn commit(&mut self) -> Result<(), ConfigError> {
        let blob = self.current.to_blob()?;
        let written = self
            .kv
            .put(DEVICE_CONFIG_NAMESPACE, DEVICE_CONFIG_KEY, &blob)?;

        if written != blob.len() {
            return Err(ConfigError::ShortWrite {
                expected: blob.len(),
                written,
            });
        }
        Ok(())
    }

    pub fn data(&self) -> &DeviceConfigData {
        &self.current
    }

    /// CRC failures seen by `load` since construction.
    pub fn crc_errors(&self) -> u32 {
        self.crc_errors
    }

    pub fn clean_reboot(&self) -> bool {
        self.current.clean_reboot
    }

    pub fn set_clean_reboot(&mut self, value: bool) {
        self.current.clean_reboot = value;
    }

    pub fn ota_flashed(&self) -> bool {
        self.current.ota_flashed
    }

    pub fn set_ota_flashed(&mut self, value: bool) {
        self.current.ota_flashed = value;
    }

    pub fn wakeup_schedule(&self) -> &WakeupSchedule {
        &self.current.wakeup_schedule
    }

    pub fn set_wakeup_schedule(&mut self, schedule: WakeupSchedule) {
        self.current.wakeup_schedule = schedule;
    }

    /// Interval in minutes configured for `reason`.
    pub fn get_wakeup_schedule_reason_int(&self, reason: WakeupReason) -> Option<u32> {
        self.current
            .wakeup_schedule
            .iter()
            .find(|e| e.reason == reason)
            .map(|e| e.interval_mins)
    }

    /// Updates the interval of `reason`. Returns false if it has no entry.
    pub fn set_wakeup_schedule_reason_int(&mut self, reason: WakeupReason, interval_mins: u32) -> bool {
        match self
            .current
            .wakeup_schedule
            .iter_mut()
            .find(|e| e.reason == reason)
        {
            Some(entry) => {
                entry.interval_mins = interval_mins;
                true
            }
            None => false,
        }
    }

    pub fn remote_control_data(&self) -> &RemoteControlData {
        &self.current.remote_control
    }

    pub fn set_remote_control_data(&mut self, data: RemoteControlData) {
        self.current.remote_control = data;
    }

    pub fn store(&self) -> &K {
        &self.kv
    }

    pub fn store_mut(&mut self) -> &mut K {
        &mut self.kv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::WakeupScheduleEntry;

    fn blob(cfg: &mut DeviceConfig<MemKeyValueStore>) -> &mut Vec<u8> {
        cfg.store_mut()
            .raw_mut(DEVICE_CONFIG_NAMESPACE, DEVICE_CONFIG_KEY)
            .unwrap()
    }

    #[test]
    fn test_init_writes_defaults_when_empty() {
        let mut cfg = DeviceConfig::new(MemKeyValueStore::default());
        cfg.init().unwrap();
        assert_eq!(cfg.data(), &DeviceConfigData::default());
        assert!(blob(&mut cfg).len() > HEADER_SIZE);
    }

    #[test]
    fn test_commit_then_load() {
        let mut cfg = DeviceConfig::new(MemKeyValueStore::default());
        cfg.init().unwrap();
        cfg.set_clean_reboot(true);
        cfg.set_wakeup_schedule_reason_int(WakeupReason::CallHome, 60);
        cfg.set_remote_control_data(RemoteControlData {
            data_id: 7,
            fw_url: String::from("http://fw.example/v2.bin"),
            ..Default::default()
        });
        cfg.commit().unwrap();

        let kv = cfg.store().clone();
        let mut reloaded = DeviceConfig::new(kv);
        reloaded.load().unwrap();
        assert!(reloaded.clean_reboot());
        assert_eq!(reloaded.remote_control_data().data_id, 7);
        assert_eq!(
            reloaded.get_wakeup_schedule_reason_int(WakeupReason::CallHome),
            Some(60)
        );
    }

    #[test]
    fn test_reason_int_returns_interval_not_reason() {
        let mut cfg = DeviceConfig::new(MemKeyValueStore::default());
        cfg.set_wakeup_schedule([
            WakeupScheduleEntry {
                reason: WakeupReason::ReadSensors,
                interval_mins: 2,
            },
            WakeupScheduleEntry {
                reason: WakeupReason::CallHome,
                interval_mins: 7,
            },
        ]);
        assert_eq!(
            cfg.get_wakeup_schedule_reason_int(WakeupReason::CallHome),
            Some(7),
            "must be the interval (7), not the reason flag (2)"
        );
        assert_eq!(
            cfg.get_wakeup_schedule_reason_int(WakeupReason::ReadSensors),
            Some(2)
        );
    }

    #[test]
    fn test_self_heal_after_corruption() {
        let mut cfg = DeviceConfig::new(MemKeyValueStore::default());
        cfg.init().unwrap();
        cfg.set_clean_reboot(true);
        cfg.commit().unwrap();

        let last = blob(&mut cfg).len() - 1;
        blob(&mut cfg)[last] ^= 0xFF;

        let kv = cfg.store().clone();
        let mut cfg = DeviceConfig::new(kv);
        cfg.init().unwrap();
        assert_eq!(cfg.data(), &DeviceConfigData::default());
        assert_eq!(cfg.crc_errors(), 1);

        let stored = blob(&mut cfg).clone();
        assert!(DeviceConfigData::from_blob(&stored).is_ok(), "defaults re-committed with a valid crc");
    }

    #[test]
    fn test_load_failure_keeps_ram_state() {
        let mut cfg = DeviceConfig::new(MemKeyValueStore::default());
        cfg.init().unwrap();
        cfg.set_clean_reboot(true);
        blob(&mut cfg)[2] ^= 0x10;

        assert!(matches!(cfg.load(), Err(ConfigError::CrcMismatch { .. })));
        assert!(cfg.clean_reboot(), "in-RAM config untouched by a failed load");
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut data = DeviceConfigData::default().to_blob().unwrap();
        data[0] = 99;
        assert_eq!(
            DeviceConfigData::from_blob(&data),
            Err(ConfigError::UnsupportedVersion(99))
        );
    }

    #[test]
    fn test_short_write_is_error() {
        let mut cfg = DeviceConfig::new(MemKeyValueStore::default());
        cfg.store_mut().write_limit = Some(3);
        assert!(matches!(cfg.commit(), Err(ConfigError::ShortWrite { written: 3, .. })));
    }

    #[test]
    fn test_init_fails_when_storage_broken() {
        let mut kv = MemKeyValueStore::default();
        kv.fail_writes = true;
        let mut cfg = DeviceConfig::new(kv);
        assert!(cfg.init().is_err());
        assert_eq!(cfg.data(), &DeviceConfigData::default(), "defaults still in effect");
    }
}
