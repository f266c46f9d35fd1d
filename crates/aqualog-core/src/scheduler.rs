//! Wake-up scheduling.
//!
//! The device sleeps between events described by a small schedule table of
//! (reason, interval) pairs. [`calc_next_wakeup`] finds the nearest event on
//! a logical minute clock and every reason that falls on the same minute.
//! [`Scheduler`] owns that clock and drives the actual sleep.

use core::ops::{BitOr, BitOrAssign, RangeInclusive};

use embassy_time::Duration;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{
    CALL_HOME_INT_MINS_MAX, CALL_HOME_INT_MINS_MIN, READ_SENSORS_INT_MINS_MAX,
    READ_SENSORS_INT_MINS_MIN,
};
use crate::hal::Platform;

/// Why the device woke up. Values are bit flags.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WakeupReason {
    ReadSensors = 1 << 0,
    CallHome = 1 << 1,
}

/// Set of [`WakeupReason`]s that are due at the same instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WakeupReasons(u8);

impl WakeupReasons {
    pub const NONE: Self = Self(0);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, reason: WakeupReason) -> bool {
        self.0 & reason as u8 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<WakeupReason> for WakeupReasons {
    fn from(reason: WakeupReason) -> Self {
        Self(reason as u8)
    }
}

impl BitOr<WakeupReason> for WakeupReasons {
    type Output = Self;

    fn bitor(self, rhs: WakeupReason) -> Self {
        Self(self.0 | rhs as u8)
    }
}

impl BitOr for WakeupReason {
    type Output = WakeupReasons;

    fn bitor(self, rhs: WakeupReason) -> WakeupReasons {
        WakeupReasons::from(self) | rhs
    }
}

impl BitOrAssign<WakeupReason> for WakeupReasons {
    fn bitor_assign(&mut self, rhs: WakeupReason) {
        self.0 |= rhs as u8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeupScheduleEntry {
    pub reason: WakeupReason,
    pub interval_mins: u32,
}

/// One entry per distinct reason.
pub const WAKEUP_SCHEDULE_LEN: usize = 2;

pub type WakeupSchedule = [WakeupScheduleEntry; WAKEUP_SCHEDULE_LEN];

pub const DEFAULT_WAKEUP_SCHEDULE: WakeupSchedule = [
    WakeupScheduleEntry {
        reason: WakeupReason::ReadSensors,
        interval_mins: 5,
    },
    WakeupScheduleEntry {
        reason: WakeupReason::CallHome,
        interval_mins: 25,
    },
];

/// Schedule used while the battery is at or below the critical level.
pub const BATTERY_CRITICAL_WAKEUP_SCHEDULE: WakeupSchedule = DEFAULT_WAKEUP_SCHEDULE;

/// Valid interval range for a reason, in minutes.
pub fn interval_range(reason: WakeupReason) -> RangeInclusive<u32> {
    match reason {
        WakeupReason::ReadSensors => READ_SENSORS_INT_MINS_MIN..=READ_SENSORS_INT_MINS_MAX,
        WakeupReason::CallHome => CALL_HOME_INT_MINS_MIN..=CALL_HOME_INT_MINS_MAX,
    }
}

pub fn interval_valid(reason: WakeupReason, interval_mins: u32) -> bool {
    interval_range(reason).contains(&interval_mins)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextWakeup {
    pub sleep_mins: u32,
    pub reasons: WakeupReasons,
}

/// Computes the next wake-up from logical minute `t`.
///
/// Each entry fires at every multiple of its interval. The result is the
/// distance to the nearest multiple strictly after `t`, together with every
/// reason whose interval divides that instant. Entries with a zero interval
/// never fire. Returns `None` if nothing ever fires.
pub fn calc_next_wakeup(t: u32, schedule: &[WakeupScheduleEntry]) -> Option<NextWakeup> {
    let t = u64::from(t);

    let sleep_mins = schedule
        .iter()
        .filter(|e| e.interval_mins > 0)
        .map(|e| {
            let interval = u64::from(e.interval_mins);
            ((t / interval) + 1) * interval - t
        })
        .min()?;

    let wake_at = t + sleep_mins;
    let mut reasons = WakeupReasons::NONE;
    for entry in schedule.iter().filter(|e| e.interval_mins > 0) {
        if wake_at % u64::from(entry.interval_mins) == 0 {
            reasons |= entry.reason;
        }
    }

    Some(NextWakeup {
        sleep_mins: u32::try_from(sleep_mins).ok()?,
        reasons,
    })
}

/// Outcome of one [`Scheduler::sleep`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepReport {
    pub scheduled_ms: u64,
    pub awake_ms: u64,
    /// Zero when the device overran its sleep window
    pub slept_ms: u64,
    pub reasons: WakeupReasons,
}

/// Sleep/wake loop driver with its own logical clock.
///
/// The clock advances by the scheduled minutes every cycle regardless of
/// how long the device was awake, so slow cycles never shift the schedule.
/// Time spent awake is taken out of the next sleep instead.
pub struct Scheduler {
    /// Logical minutes since boot
    clock_mins: u32,
    /// Uptime at the last wake-up
    last_wake_ms: u64,
    /// Treat schedule minutes as seconds, for bench testing
    mins_as_secs: bool,
    reasons: WakeupReasons,
}

impl Scheduler {
    pub fn new(mins_as_secs: bool) -> Self {
        Self {
            clock_mins: 0,
            last_wake_ms: 0,
            mins_as_secs,
            reasons: WakeupReasons::NONE,
        }
    }

    pub fn clock_mins(&self) -> u32 {
        self.clock_mins
    }

    /// Milliseconds since the last wake-up (or boot).
    pub fn awake_ms<P: Platform>(&self, platform: &P) -> u64 {
        platform.uptime_ms().saturating_sub(self.last_wake_ms)
    }

    /// Sleeps until the next scheduled event.
    ///
    /// Returns `None` if the schedule has no active entry.
    pub fn sleep<P: Platform>(
        &mut self,
        platform: &mut P,
        schedule: &[WakeupScheduleEntry],
    ) -> Option<SleepReport> {
        let next = calc_next_wakeup(self.clock_mins, schedule)?;

        let unit_ms: u64 = if self.mins_as_secs { 1_000 } else { 60_000 };
        let scheduled_ms = u64::from(next.sleep_mins) * unit_ms;
        let awake_ms = self.awake_ms(platform);

        let slept_ms = if awake_ms >= scheduled_ms {
            warn!(
                " Awake {} ms, past the {} ms sleep window. Skipping sleep.",
                awake_ms, scheduled_ms
            );
            0
        } else {
            let ms = scheduled_ms - awake_ms;
            info!(" Sleeping {} ms (next reasons {:#04b})", ms, next.reasons.bits());
            platform.light_sleep(Duration::from_millis(ms));
            ms
        };

        self.clock_mins = self.clock_mins.wrapping_add(next.sleep_mins);
        self.reasons = next.reasons;
        self.last_wake_ms = platform.uptime_ms();
        debug!(" Woke at logical minute {}", self.clock_mins);

        Some(SleepReport {
            scheduled_ms,
            awake_ms,
            slept_ms,
            reasons: next.reasons,
        })
    }

    pub fn wakeup_reasons(&self) -> WakeupReasons {
        self.reasons
    }

    pub fn wakeup_reason_is(&self, reason: WakeupReason) -> bool {
        self.reasons.contains(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakePlatform;

    const A: WakeupReason = WakeupReason::ReadSensors;
    const B: WakeupReason = WakeupReason::CallHome;

    fn schedule(a: u32, b: u32) -> [WakeupScheduleEntry; 2] {
        [
            WakeupScheduleEntry {
                reason: A,
                interval_mins: a,
            },
            WakeupScheduleEntry {
                reason: B,
                interval_mins: b,
            },
        ]
    }

    #[test]
    fn test_first_wakeup_from_zero() {
        let next = calc_next_wakeup(0, &schedule(2, 7)).unwrap();
        assert_eq!(next.sleep_mins, 2);
        assert_eq!(next.reasons, WakeupReasons::from(A));
    }

    #[test]
    fn test_coinciding_reasons() {
        // 12 + 2 = 14 is a multiple of both intervals
        let next = calc_next_wakeup(12, &schedule(2, 7)).unwrap();
        assert_eq!(next.sleep_mins, 2);
        assert_eq!(next.reasons, A | B, "both reasons fire at minute 14");
    }

    #[test]
    fn test_exact_multiple_moves_forward() {
        let next = calc_next_wakeup(14, &schedule(2, 7)).unwrap();
        assert_eq!(next.sleep_mins, 2, "next event is strictly after t");
        assert!(!next.reasons.contains(B));
    }

    #[test]
    fn test_second_reason_wins_when_nearer() {
        let next = calc_next_wakeup(6, &schedule(5, 7)).unwrap();
        assert_eq!(next.sleep_mins, 1);
        assert_eq!(next.reasons, WakeupReasons::from(B));
    }

    #[test]
    fn test_zero_interval_skipped() {
        let next = calc_next_wakeup(3, &schedule(0, 4)).unwrap();
        assert_eq!(next.sleep_mins, 1);
        assert_eq!(next.reasons, WakeupReasons::from(B));
        assert!(calc_next_wakeup(3, &schedule(0, 0)).is_none());
    }

    #[test]
    fn test_large_clock_does_not_overflow() {
        let next = calc_next_wakeup(u32::MAX - 1, &schedule(4320, 1440)).unwrap();
        assert!(next.sleep_mins <= 1440);
    }

    #[test]
    fn test_interval_ranges() {
        assert!(interval_valid(A, 1));
        assert!(interval_valid(A, 1440));
        assert!(!interval_valid(A, 1441));
        assert!(!interval_valid(A, 0));
        assert!(interval_valid(B, 4320));
        assert!(!interval_valid(B, 4321));
    }

    #[test]
    fn test_sleep_subtracts_awake_time() {
        let mut platform = FakePlatform::default();
        let mut scheduler = Scheduler::new(false);
        platform.uptime_ms = 30_000;

        let report = scheduler.sleep(&mut platform, &schedule(2, 7)).unwrap();
        assert_eq!(report.scheduled_ms, 120_000);
        assert_eq!(report.slept_ms, 90_000);
        assert_eq!(platform.slept, [90_000]);
        assert_eq!(scheduler.clock_mins(), 2);
        assert!(scheduler.wakeup_reason_is(A));
        assert!(!scheduler.wakeup_reason_is(B));
    }

    #[test]
    fn test_sleep_skipped_on_overrun() {
        let mut platform = FakePlatform::default();
        let mut scheduler = Scheduler::new(false);
        platform.uptime_ms = 10 * 60_000;

        let report = scheduler.sleep(&mut platform, &schedule(2, 7)).unwrap();
        assert_eq!(report.slept_ms, 0);
        assert!(platform.slept.is_empty(), "no hardware sleep on overrun");
        assert_eq!(scheduler.clock_mins(), 2, "logical clock still advances");
    }

    #[test]
    fn test_mins_as_secs() {
        let mut platform = FakePlatform::default();
        let mut scheduler = Scheduler::new(true);
        let report = scheduler.sleep(&mut platform, &schedule(2, 7)).unwrap();
        assert_eq!(report.scheduled_ms, 2_000);
    }

    #[test]
    fn test_logical_clock_follows_schedule() {
        let mut platform = FakePlatform::default();
        let mut scheduler = Scheduler::new(true);
        let mut call_home_at = alloc::vec::Vec::new();
        for _ in 0..10 {
            scheduler.sleep(&mut platform, &schedule(2, 7)).unwrap();
            if scheduler.wakeup_reason_is(B) {
                call_home_at.push(scheduler.clock_mins());
            }
        }
        assert_eq!(call_home_at, [7, 14]);
    }
}
