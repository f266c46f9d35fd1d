//! Desktop simulator for the aqualog telemetry node.
//!
//! Runs the real `aqualog-core` node against a host directory for flash, a
//! file per key for NVS and a simulated board with a flaky cellular link and
//! an in-process backend. Time is virtual, so days of operation run in
//! seconds.
//!
//! # Settings
//!
//! Read from the environment, or a `.env` file in the working directory.
//!
//! | Variable                      | Default                 |
//! |-------------------------------|-------------------------|
//! | `AQUALOG_DATA_DIR`            | `./aqualog-data`        |
//! | `AQUALOG_ACCESS_TOKEN`        | `SIMULATOR`             |
//! | `AQUALOG_DEVICE_NAME`         | `aqualog-sim`           |
//! | `AQUALOG_CYCLES`              | `60`                    |
//! | `AQUALOG_MINS_AS_SECS`        | `false`                 |
//! | `AQUALOG_LINK_FAILURE_RATE`   | `0.1`                   |
//! | `AQUALOG_SHARED_ATTRIBUTES`   | `{"shared":{}}`         |
//! | `AQUALOG_FS_CAPACITY_KB`      | `1024`                  |
//! | `AQUALOG_SEED`                | `1`                     |

mod board;
mod fs;
mod kv;

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use log::{error, info, warn};

use aqualog_core::config::{BackendConfig, FirmwareInfo, features};
use aqualog_core::node::{CycleReport, Node};

use board::SimBoard;
use fs::DirFileSystem;
use kv::FileKvStore;

/// Firmware version reported by the simulator.
const FIRMWARE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

struct Settings {
    data_dir: PathBuf,
    backend: BackendConfig,
    cycles: u32,
    mins_as_secs: bool,
    link_failure_rate: f64,
    shared_attributes: String,
    fs_capacity_bytes: u64,
    seed: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("Ignoring unparsable {}={}", key, value);
            default
        }),
        Err(_) => default,
    }
}

impl Settings {
    fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(env_or("AQUALOG_DATA_DIR", String::from("./aqualog-data"))),
            backend: BackendConfig {
                access_token: env_or("AQUALOG_ACCESS_TOKEN", String::from("SIMULATOR")),
                device_name: env_or("AQUALOG_DEVICE_NAME", String::from("aqualog-sim")),
            },
            cycles: env_or("AQUALOG_CYCLES", 60),
            mins_as_secs: env_or("AQUALOG_MINS_AS_SECS", false),
            link_failure_rate: env_or("AQUALOG_LINK_FAILURE_RATE", 0.1),
            shared_attributes: env_or(
                "AQUALOG_SHARED_ATTRIBUTES",
                String::from(r#"{"shared":{}}"#),
            ),
            fs_capacity_bytes: env_or("AQUALOG_FS_CAPACITY_KB", 1024u64) * 1024,
            seed: env_or("AQUALOG_SEED", 1),
        }
    }
}

// ---------------------------------------------------------------------------
// Node construction
// ---------------------------------------------------------------------------

type SimNode = Node<DirFileSystem, FileKvStore, SimBoard>;

fn boot(settings: &Settings, board: SimBoard) -> Result<SimNode, String> {
    let fs = DirFileSystem::new(settings.data_dir.join("flash"), settings.fs_capacity_bytes)
        .map_err(|e| format!("flash directory: {}", e))?;
    let kv = FileKvStore::new(settings.data_dir.join("nvs"))
        .map_err(|e| format!("nvs directory: {}", e))?;
    let firmware = FirmwareInfo {
        version: FIRMWARE_VERSION,
        features: features::WATER_SENSORS
            | features::WEATHER_STATION
            | features::SOIL_MOISTURE
            | features::AUX_ENV_SENSOR,
    };

    let mut node = Node::new(
        fs,
        kv,
        board,
        settings.backend.clone(),
        firmware,
        settings.mins_as_secs,
    )
    .map_err(|e| e.to_string())?;

    let report = node.start();
    info!(
        "Boot: clean={} config_crc_errors={} self_test={:?}",
        report.clean_reboot, report.config_crc_errors, report.self_test
    );
    Ok(node)
}

fn log_cycle(cycle: u32, report: &CycleReport) {
    info!(
        "Cycle {}: slept {} ms, reasons {:#04b}, sensors_read={}",
        cycle,
        report.sleep.slept_ms,
        report.sleep.reasons.bits(),
        report.sensors_read
    );

    match &report.call_home {
        Some(Ok(call_home)) => {
            let totals = call_home.totals();
            info!(
                "  call home: {}/{} records accepted, {} crc failures, {}/{} requests failed",
                totals.successful_entries,
                totals.total_entries,
                totals.crc_failures,
                totals.failed_requests,
                totals.total_requests
            );
        }
        Some(Err(e)) => warn!("  call home failed: {}", e),
        None => {}
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let settings = Settings::from_env();
    info!("Starting aqualog simulator in {}", settings.data_dir.display());
    info!(
        "{} cycles, link failure rate {:.2}",
        settings.cycles, settings.link_failure_rate
    );

    let board = SimBoard::new(
        settings.link_failure_rate,
        settings.shared_attributes.clone(),
        settings.seed,
    );
    let mut node = match boot(&settings, board) {
        Ok(node) => node,
        Err(e) => {
            error!("Could not start node: {}", e);
            std::process::exit(1);
        }
    };

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------
    let mut cycle = 0;
    while cycle < settings.cycles {
        if node.board_mut().take_restart() {
            info!("Simulating reboot");
            let mut board = node.into_board();
            board.reboot();
            node = match boot(&settings, board) {
                Ok(node) => node,
                Err(e) => {
                    error!("Could not restart node: {}", e);
                    std::process::exit(1);
                }
            };
            continue;
        }

        cycle += 1;
        match node.run_cycle() {
            Ok(report) => log_cycle(cycle, &report),
            Err(e) => {
                error!("Cycle {} aborted: {}", cycle, e);
                break;
            }
        }
    }

    let stats = node.board().backend_stats();
    info!(
        "Backend received {} telemetry posts ({} bytes), {} attribute posts, {} attribute reads, {} dropped",
        stats.telemetry_posts,
        stats.telemetry_bytes,
        stats.attribute_posts,
        stats.attribute_reads,
        stats.rejected
    );
    info!("Simulator exiting");
}
