//! PPS-aligned `sys→rtc` and `rtc→sys` transfers, plus the "guessed"
//! fallback transfer used when no PPS source is available (§4.3).

use std::time::Duration;

use crate::devio::{I2cBus, PpsDevice};
use crate::error::{Error, Result};
use crate::rtc::{self, BrokenDownTime, PpsStatus};
use crate::systime::{self, Timespec};

fn to_broken_down(epoch_sec: i64) -> BrokenDownTime {
    // Minimal proleptic-Gregorian UTC decomposition of a unix timestamp,
    // equivalent to `gmtime_r` for the date ranges this appliance supports.
    let days = epoch_sec.div_euclid(86_400);
    let secs_of_day = epoch_sec.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    let weekday = ((days % 7 + 11) % 7) as u32; // 1970-01-01 was a Thursday (wday 4)

    BrokenDownTime {
        year: year - 1900,
        month: month - 1,
        day,
        weekday,
        hour: (secs_of_day / 3600) as u32,
        minute: ((secs_of_day / 60) % 60) as u32,
        second: (secs_of_day % 60) as u32,
    }
}

// Howard Hinnant's `civil_from_days`, adapted to return (year, 1-based
// month, 1-based day) from a day count relative to the unix epoch.
fn civil_from_days(z: i64) -> (i32, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y as i32, m, d)
}

fn days_from_civil(y: i32, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y as i64 - 1 } else { y as i64 };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let mp = if m > 2 { m - 3 } else { m + 9 } as u64;
    let doy = (153 * mp + 2) / 5 + d as u64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i64 - 719_468
}

/// Converts a broken-down UTC time to a unix epoch timestamp.
pub fn to_epoch(t: &BrokenDownTime) -> i64 {
    let days = days_from_civil(t.year + 1900, t.month + 1, t.day);
    days * 86_400 + t.hour as i64 * 3600 + t.minute as i64 * 60 + t.second as i64
}

/// System time to RTC time (`-s`): lands the write so the RTC's seconds
/// register advances on the wall-clock second boundary immediately after
/// the call returns.
pub fn systohc(i2c: &I2cBus) -> Result<()> {
    let pps_was_enabled = rtc::pps_query(i2c)? == PpsStatus::Enabled;

    let now = systime::now()?;
    let target_sec = now.sec + if now.nsec >= 900_000_000 { 1 } else { 0 };
    let target = Timespec::new(target_sec, 999_500_000);
    let write_sec = target.sec + 1;

    systime::sleep_absolute(target)?;

    if pps_was_enabled {
        rtc::pps_disable(i2c)?;
    }

    let result = (|| -> Result<()> {
        let after = systime::now()?;
        if after.sec != target.sec + 1 || target.nsec < 999_000_000 {
            return Err(Error::Timing("sys->rtc missed the half-ms write window".into()));
        }
        let datim = to_broken_down(write_sec);
        rtc::write_time(i2c, &datim)?;
        Ok(())
    })();

    if pps_was_enabled {
        rtc::pps_enable(i2c)?;
    }

    result
}

/// RTC time to system time using a PPS edge to align the write (`-r` when
/// PPS is available). Assumes the PPS edge precedes the RTC's internal
/// second tick by a few hundred ms (per the DS3231 datasheet) and deposits
/// the system clock right on the next RTC second boundary.
pub fn hctosys_pps(i2c: &I2cBus, pps: &PpsDevice) -> Result<()> {
    let edge = pps.fetch()?;
    let rtc_time = rtc::read_time(i2c)?;
    let rtc_epoch = to_epoch(&rtc_time);

    let mut wake_sec = edge.sec;
    let mut wake_nsec = edge.nsec + 999_500_000;
    if wake_nsec >= 1_000_000_000 {
        wake_nsec -= 1_000_000_000;
        wake_sec += 1;
    }
    systime::sleep_absolute(Timespec::new(wake_sec, wake_nsec))?;

    systime::set_now(Timespec::new(rtc_epoch + 1, 0))
}

/// RTC time to system time without PPS (`-r` fallback): polls the RTC every
/// 50ms until it rolls over to a new second, then sets the system clock to
/// that value. Expected error is <= 50ms. This loop has no bound: an RTC
/// whose seconds register is stuck spins forever, as in the original tool
/// (§9 open question) — not silently changed here.
pub fn hctosys_guessed(i2c: &I2cBus) -> Result<()> {
    let t0 = to_epoch(&rtc::read_time(i2c)?);
    let t1 = loop {
        let t = to_epoch(&rtc::read_time(i2c)?);
        if t != t0 {
            break t;
        }
        systime::sleep_relative(Duration::from_millis(50))?;
    };
    systime::set_now(Timespec::new(t1, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_round_trip() {
        let cases = [0i64, 1_000_000_000, 1_710_505_296i64, 4_102_444_799];
        for &e in &cases {
            let bdt = to_broken_down(e);
            assert_eq!(to_epoch(&bdt), e);
        }
    }

    #[test]
    fn known_date_decomposition() {
        // 2024-03-15 12:34:56 UTC, a Friday.
        let epoch = days_from_civil(2024, 3, 15) * 86_400 + 12 * 3600 + 34 * 60 + 56;
        let bdt = to_broken_down(epoch);
        assert_eq!(bdt.year, 124);
        assert_eq!(bdt.month, 2);
        assert_eq!(bdt.day, 15);
        assert_eq!(bdt.weekday, 5);
        assert_eq!(bdt.hour, 12);
        assert_eq!(bdt.minute, 34);
        assert_eq!(bdt.second, 56);
    }
}
