//! Thin wrappers over `CLOCK_REALTIME` get/set and absolute nanosleep, plus
//! the real-time scheduling bump the PPS-critical transfers require (§9).

use crate::error::{Error, Result};

/// A `CLOCK_REALTIME` timestamp as (seconds, nanoseconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i32,
}

impl Timespec {
    pub const fn new(sec: i64, nsec: i32) -> Self {
        Timespec { sec, nsec }
    }

    fn to_libc(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.sec as libc::time_t,
            tv_nsec: self.nsec as libc::c_long,
        }
    }

    fn from_libc(ts: libc::timespec) -> Self {
        Timespec { sec: ts.tv_sec as i64, nsec: ts.tv_nsec as i32 }
    }
}

/// Reads `CLOCK_REALTIME`.
pub fn now() -> Result<Timespec> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    if rc != 0 {
        return Err(Error::Device(std::io::Error::last_os_error().to_string()));
    }
    Ok(Timespec::from_libc(ts))
}

/// Sets `CLOCK_REALTIME` to `ts`.
pub fn set_now(ts: Timespec) -> Result<()> {
    let libc_ts = ts.to_libc();
    let rc = unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &libc_ts) };
    if rc != 0 {
        return Err(Error::Device(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}

/// Sleeps until `CLOCK_REALTIME` reaches the absolute deadline `ts`.
pub fn sleep_absolute(ts: Timespec) -> Result<()> {
    let libc_ts = ts.to_libc();
    let rc = unsafe {
        libc::clock_nanosleep(
            libc::CLOCK_REALTIME,
            libc::TIMER_ABSTIME,
            &libc_ts,
            std::ptr::null_mut(),
        )
    };
    if rc != 0 {
        return Err(Error::Device(format!("clock_nanosleep failed: {rc}")));
    }
    Ok(())
}

/// Sleeps `dur` relative to now on `CLOCK_REALTIME`.
pub fn sleep_relative(dur: std::time::Duration) -> Result<()> {
    let ts = libc::timespec {
        tv_sec: dur.as_secs() as libc::time_t,
        tv_nsec: dur.subsec_nanos() as libc::c_long,
    };
    let rc = unsafe { libc::clock_nanosleep(libc::CLOCK_REALTIME, 0, &ts, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(Error::Device(format!("clock_nanosleep failed: {rc}")));
    }
    Ok(())
}

/// Raises the calling thread to `SCHED_RR` at the maximum priority, as the
/// PPS-critical-path transfers require to survive preemption during the
/// deadline sleep (§4.3, §9).
pub fn raise_realtime_priority() -> Result<()> {
    let max = unsafe { libc::sched_get_priority_max(libc::SCHED_RR) };
    let param = libc::sched_param { sched_priority: max };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
    if rc != 0 {
        return Err(Error::Device("can't set realtime priority".into()));
    }
    Ok(())
}
