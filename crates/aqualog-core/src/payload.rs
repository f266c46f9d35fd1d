//! ThingsBoard device API payloads and paths.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use serde::Serialize;
use thiserror_no_std::Error;

use crate::config::PAYLOAD_BUFFER_SIZE;
use crate::error::{ErrorDetail, detail_of};
use crate::storage::Record;

/// Shared attribute keys requested from the backend.
pub const SHARED_ATTRIBUTE_KEYS: &str =
    "data_id,ch_int,fw_v,fw_url,fw_md5,ws_int,do_ota,do_reboot";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PayloadError {
    #[error("Payload of {size} bytes exceeds {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("JSON encoding failed: {0}")]
    Json(ErrorDetail),
}

pub fn telemetry_path(token: &str) -> String {
    format!("/api/v1/{}/telemetry", token)
}

pub fn client_attributes_path(token: &str) -> String {
    format!("/api/v1/{}/attributes", token)
}

pub fn shared_attributes_path(token: &str) -> String {
    format!("/api/v1/{}/attributes?sharedKeys={}", token, SHARED_ATTRIBUTE_KEYS)
}

#[derive(Serialize)]
struct TelemetryItem<'a, R> {
    /// Milliseconds since epoch
    ts: u64,
    values: &'a R,
}

/// Builds `[{"ts": <ms>, "values": {...}}, ...]` for one chunk file.
pub fn build_telemetry<R: Record + Serialize>(records: &[R]) -> Result<Vec<u8>, PayloadError> {
    let items: Vec<TelemetryItem<'_, R>> = records
        .iter()
        .map(|r| TelemetryItem {
            ts: u64::from(r.timestamp()) * 1000,
            values: r,
        })
        .collect();

    let body = serde_json::to_vec(&items).map_err(|e| PayloadError::Json(detail_of(e)))?;
    check_size(body)
}

/// Attributes the device reports about itself.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ClientAttributes {
    pub cur_fw_v: u32,
    pub cur_ws_int: u32,
    pub cur_ch_int: u32,
    pub uptime_s: u64,
    pub features: u32,
}

pub fn build_client_attributes(attrs: &ClientAttributes) -> Result<Vec<u8>, PayloadError> {
    let body = serde_json::to_vec(attrs).map_err(|e| PayloadError::Json(detail_of(e)))?;
    check_size(body)
}

fn check_size(body: Vec<u8>) -> Result<Vec<u8>, PayloadError> {
    if body.len() > PAYLOAD_BUFFER_SIZE {
        return Err(PayloadError::TooLarge {
            size: body.len(),
            max: PAYLOAD_BUFFER_SIZE,
        });
    }
    Ok(body)
}
