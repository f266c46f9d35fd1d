//! Hardware-independent core library for the aqualog telemetry node
//!
//! This crate contains the platform-agnostic logic of a battery powered
//! water/weather/soil telemetry device: CRC protected chunked record stores,
//! the persistent device configuration, the wake-up scheduler and the
//! call-home pipeline that drains stored telemetry to the backend.
//!
//! Hardware (modem, HTTP transport, flash filesystem, key-value storage,
//! sensors) is reached through the traits in [`hal`], [`storage`] and
//! [`device_config`], so the same code runs on the device, in the desktop
//! simulator and in tests.
//!
//! It is `#![no_std]` with `extern crate alloc`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod call_home;
pub mod config;
pub mod crc;
pub mod device_config;
pub mod error;
pub mod event_log;
pub mod hal;
pub mod node;
pub mod ota;
pub mod payload;
pub mod records;
pub mod remote_control;
pub mod scheduler;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;
