//! Over-the-air update coordination.
//!
//! Flashing itself is done by a [`FirmwareUpdater`]. This module decides
//! whether a remote request is acceptable, records that a new image was
//! flashed and, on the first boot of that image, runs a connectivity self
//! test that rolls back to the previous image when it fails.

use log::{error, info, warn};
use thiserror_no_std::Error;

use crate::call_home::connect_persist;
use crate::config::BackendConfig;
use crate::device_config::{ConfigError, DeviceConfig, KeyValueStore, RemoteControlData};
use crate::event_log::LogCode;
use crate::hal::{Board, FirmwareError, FirmwareUpdater, Method};
use crate::payload::shared_attributes_path;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OtaError {
    #[error("{0}")]
    Flash(#[from] FirmwareError),
    #[error("OTA state not persisted: {0}")]
    Persist(#[from] ConfigError),
}

/// Reasons a remote OTA request is not acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaRejection {
    NotRequested,
    NoFwVersion,
    SameVersion,
    UrlNotSet,
    Md5NotSet,
}

impl OtaRejection {
    pub fn log_code(self) -> Option<LogCode> {
        match self {
            Self::NotRequested => None,
            Self::NoFwVersion => Some(LogCode::OtaNoFwVersion),
            Self::SameVersion => Some(LogCode::OtaFwSameVersion),
            Self::UrlNotSet => Some(LogCode::OtaFwUrlNotSet),
            Self::Md5NotSet => Some(LogCode::OtaMd5NotSet),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaRequest<'a> {
    pub version: u32,
    pub url: &'a str,
    pub md5: &'a str,
}

pub fn validate_request(
    data: &RemoteControlData,
    running_version: u32,
) -> Result<OtaRequest<'_>, OtaRejection> {
    if !data.ota {
        return Err(OtaRejection::NotRequested);
    }
    let version = data.fw_version.ok_or(OtaRejection::NoFwVersion)?;
    if version == running_version {
        return Err(OtaRejection::SameVersion);
    }
    if data.fw_url.trim().is_empty() {
        return Err(OtaRejection::UrlNotSet);
    }
    if data.fw_md5.trim().is_empty() {
        return Err(OtaRejection::Md5NotSet);
    }

    Ok(OtaRequest {
        version,
        url: &data.fw_url,
        md5: &data.fw_md5,
    })
}

/// Flashes the requested image and marks it for a first-boot self test.
///
/// The caller reboots into the new image at a safe point.
pub fn start_update<U: FirmwareUpdater, K: KeyValueStore>(
    updater: &mut U,
    config: &mut DeviceConfig<K>,
    request: &OtaRequest<'_>,
) -> Result<(), OtaError> {
    info!(" Flashing firmware v{} from {}", request.version, request.url);
    updater.flash(request.url, request.md5)?;

    config.set_ota_flashed(true);
    config.commit()?;
    info!(" Firmware v{} staged", request.version);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfTestOutcome {
    Passed,
    /// The previous image was made bootable, the caller must restart
    RolledBack,
    RollbackNotPossible,
    RollbackFailed,
}

impl SelfTestOutcome {
    pub fn passed(self) -> bool {
        self == Self::Passed
    }
}

/// First boot of a freshly flashed image: prove the backend is reachable.
///
/// Clears the `ota_flashed` flag first so a rolled back image does not run
/// the test again.
pub fn first_boot_self_test<B: Board, K: KeyValueStore>(
    board: &mut B,
    config: &mut DeviceConfig<K>,
    backend: &BackendConfig,
) -> SelfTestOutcome {
    config.set_ota_flashed(false);
    if let Err(e) = config.commit() {
        warn!(" Could not clear OTA flag: {}", e);
    }

    let passed = board.power_on().is_ok()
        && connect_persist(board).is_ok()
        && matches!(
            board.request(Method::Get, &shared_attributes_path(&backend.access_token), &[]),
            Ok(ref resp) if resp.is_success()
        );
    board.power_off();

    if passed {
        info!(" OTA self test passed");
        return SelfTestOutcome::Passed;
    }

    error!(" OTA self test failed");
    if !board.can_rollback() {
        error!(" No previous image to roll back to");
        return SelfTestOutcome::RollbackNotPossible;
    }

    match board.rollback() {
        Ok(()) => {
            warn!(" Rolled back to the previous firmware");
            SelfTestOutcome::RolledBack
        }
        Err(e) => {
            error!(" Rollback failed: {}", e);
            SelfTestOutcome::RollbackFailed
        }
    }
}
