//! Remote control: server-pushed configuration with a monotonic id.
//!
//! The backend publishes a shared-attribute document. A document is applied
//! only if its `data_id` is newer than the stored one. Applying persists the
//! document first, then updates each interval independently, then reports
//! the OTA and reboot requests back to the caller, which acts on them at a
//! safe point of the call-home cycle.

use alloc::string::String;
use log::{info, warn};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror_no_std::Error;

use crate::device_config::{ConfigError, DeviceConfig, KeyValueStore, RemoteControlData};
use crate::error::{ErrorDetail, detail_of};
use crate::hal::LinkError;
use crate::scheduler::{WakeupReason, interval_valid};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteControlError {
    /// The document could not be fetched at all
    #[error("Remote control fetch failed: {0}")]
    Transport(LinkError),
    #[error("Remote control request rejected with HTTP {0}")]
    Status(u16),
    #[error("Remote control JSON invalid: {0}")]
    Parse(ErrorDetail),
    #[error("Remote control document has no data_id")]
    MissingDataId,
    #[error("Remote control data not persisted: {0}")]
    Persist(ConfigError),
}

impl RemoteControlError {
    /// Whether the link itself is unusable and the call-home cycle should stop.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Status(_))
    }
}

/// An interval as sent by the backend, before range checks.
///
/// Any JSON value is accepted here so a bad interval is rejected on its own
/// instead of failing the whole document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedInterval {
    Minutes(i64),
    /// Not a whole number: fractions, strings, booleans and the like
    Malformed,
}

impl RequestedInterval {
    fn from_json(value: &Value) -> Self {
        let Value::Number(n) = value else {
            return Self::Malformed;
        };
        if let Some(mins) = n.as_i64() {
            return Self::Minutes(mins);
        }
        match n.as_f64() {
            // 10.0 is still ten minutes
            Some(f) if (f as i64) as f64 == f => Self::Minutes(f as i64),
            _ => Self::Malformed,
        }
    }

    /// The value if it is a usable number of minutes for `reason`.
    pub fn valid_for(self, reason: WakeupReason) -> Option<u32> {
        let Self::Minutes(mins) = self else {
            return None;
        };
        u32::try_from(mins).ok().filter(|&m| interval_valid(reason, m))
    }

    /// Event log rendering: the value clamped into `u32`, `u32::MAX` if malformed.
    pub fn log_value(self) -> u32 {
        match self {
            Self::Minutes(mins) => u32::try_from(mins.max(0)).unwrap_or(u32::MAX),
            Self::Malformed => u32::MAX,
        }
    }
}

impl<'de> Deserialize<'de> for RequestedInterval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(|value| Self::from_json(&value))
    }
}

/// Shared attributes as published by the backend. Every key is optional on
/// the wire; a missing `data_id` makes the document invalid.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RemoteControlDocument {
    pub data_id: Option<u32>,
    /// Sensor read interval, minutes
    pub ws_int: Option<RequestedInterval>,
    /// Call-home interval, minutes
    pub ch_int: Option<RequestedInterval>,
    #[serde(alias = "do_rebt")]
    pub do_reboot: Option<bool>,
    pub do_ota: Option<bool>,
    pub fw_v: Option<u32>,
    pub fw_url: Option<String>,
    pub fw_md5: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    Shared { shared: RemoteControlDocument },
    Bare(RemoteControlDocument),
}

/// Parses a response body, with or without the `{"shared": ...}` wrapper.
pub fn parse(body: &[u8]) -> Result<RemoteControlDocument, RemoteControlError> {
    let envelope: Envelope =
        serde_json::from_slice(body).map_err(|e| RemoteControlError::Parse(detail_of(e)))?;

    Ok(match envelope {
        Envelope::Shared { shared } => shared,
        Envelope::Bare(doc) => doc,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalChange {
    NotRequested,
    Applied(u32),
    Rejected(RequestedInterval),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedChanges {
    pub data_id: u32,
    pub read_sensors_int: IntervalChange,
    pub call_home_int: IntervalChange,
    pub reboot_requested: bool,
    pub ota_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteControlOutcome {
    /// The document's id is not newer than the stored one
    Stale { received: u32, stored: u32 },
    Applied(AppliedChanges),
}

/// Applies `doc` to the device configuration if it is newer.
///
/// The new data is committed before anything acts on it. If that commit
/// fails the in-RAM config is restored and nothing is applied.
pub fn apply<K: KeyValueStore>(
    config: &mut DeviceConfig<K>,
    doc: &RemoteControlDocument,
) -> Result<RemoteControlOutcome, RemoteControlError> {
    let received = doc.data_id.ok_or(RemoteControlError::MissingDataId)?;
    let stored = config.remote_control_data().data_id;

    if received <= stored {
        info!(" Remote control data {} is not newer than {}", received, stored);
        return Ok(RemoteControlOutcome::Stale { received, stored });
    }

    let previous = config.remote_control_data().clone();
    config.set_remote_control_data(RemoteControlData {
        data_id: received,
        read_sensors_int_mins: persisted_mins(doc.ws_int),
        call_home_int_mins: persisted_mins(doc.ch_int),
        reboot: doc.do_reboot.unwrap_or(false),
        ota: doc.do_ota.unwrap_or(false),
        fw_version: doc.fw_v,
        fw_url: doc.fw_url.clone().unwrap_or_default(),
        fw_md5: doc.fw_md5.clone().unwrap_or_default(),
    });
    if let Err(e) = config.commit() {
        config.set_remote_control_data(previous);
        return Err(RemoteControlError::Persist(e));
    }
    info!(" Remote control data {} persisted", received);

    let read_sensors_int = apply_interval(config, WakeupReason::ReadSensors, doc.ws_int);
    let call_home_int = apply_interval(config, WakeupReason::CallHome, doc.ch_int);

    let changed = [read_sensors_int, call_home_int]
        .iter()
        .any(|c| matches!(c, IntervalChange::Applied(_)));
    if changed {
        if let Err(e) = config.commit() {
            // The id is already durable, so the schedule only lives in RAM until the next commit
            warn!(" Failed to persist updated schedule: {}", e);
        }
    }

    Ok(RemoteControlOutcome::Applied(AppliedChanges {
        data_id: received,
        read_sensors_int,
        call_home_int,
        reboot_requested: doc.do_reboot.unwrap_or(false),
        ota_requested: doc.do_ota.unwrap_or(false),
    }))
}

/// Interval as stored with the document, 0 when absent or not a `u32`.
fn persisted_mins(requested: Option<RequestedInterval>) -> u32 {
    match requested {
        Some(RequestedInterval::Minutes(mins)) => u32::try_from(mins).unwrap_or(0),
        _ => 0,
    }
}

fn apply_interval<K: KeyValueStore>(
    config: &mut DeviceConfig<K>,
    reason: WakeupReason,
    requested: Option<RequestedInterval>,
) -> IntervalChange {
    let Some(requested) = requested else {
        return IntervalChange::NotRequested;
    };

    let Some(mins) = requested.valid_for(reason) else {
        warn!(" Rejecting {:?} interval of {:?}", reason, requested);
        return IntervalChange::Rejected(requested);
    };

    if config.set_wakeup_schedule_reason_int(reason, mins) {
        info!(" {:?} interval set to {} min", reason, mins);
        IntervalChange::Applied(mins)
    } else {
        warn!(" No schedule entry for {:?}", reason);
        IntervalChange::Rejected(requested)
    }
}
