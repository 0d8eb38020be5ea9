//! SysV-SHM NTP reference-clock publisher: a count/valid double-handshake
//! with full memory barriers, byte-compatible with the well-known NTP SHM
//! reference-clock ABI (§3, §4.5).

use std::sync::atomic::{AtomicI32, Ordering};

use nix::unistd::{setgid, Group};

use crate::devio::{I2cBus, PpsDevice};
use crate::error::{Error, Result};
use crate::rtc;
use crate::timexfer;

/// The fixed-layout NTP SHM segment. Field order and width are the ABI —
/// not negotiable for idiomatic-Rust reasons. `count` and `valid` are
/// atomics so the compiler cannot reorder or elide the stores across the
/// two full fences bracketing the payload write (§9): do not substitute
/// acquire/release without re-verifying the NTP SHM reader's assumptions.
#[repr(C)]
pub struct ShmSegment {
    pub mode: i32,
    pub count: AtomicI32,
    pub clock_ts_sec: i64,
    pub clock_ts_usec: i32,
    pub recv_ts_sec: i64,
    pub recv_ts_usec: i32,
    pub leap: i32,
    pub precision: i32,
    pub nsamples: i32,
    pub valid: AtomicI32,
    pub clock_ts_nsec: u32,
    pub recv_ts_nsec: u32,
    pub reserved: [i32; 8],
}

const NTP_SHM_BASE_KEY: i32 = 0x4e54_5030;

/// Attaches (creating if necessary) the SysV segment for `id` (0..=9),
/// mode 0660. `shmget`/`shmat`/`shmdt` have no `nix` wrapper, so they go
/// through `libc` directly.
fn attach_segment(id: i32) -> Result<*mut ShmSegment> {
    let key = NTP_SHM_BASE_KEY + id;
    let size = std::mem::size_of::<ShmSegment>();
    let shmid = unsafe { libc::shmget(key as libc::key_t, size, libc::IPC_CREAT | 0o660) };
    if shmid == -1 {
        return Err(Error::Device("shmget failed".into()));
    }
    let addr = unsafe { libc::shmat(shmid, std::ptr::null::<libc::c_void>(), 0) };
    if addr as isize == -1 {
        return Err(Error::Device("shmat failed".into()));
    }
    Ok(addr as *mut ShmSegment)
}

/// Long-running publisher: drops group privilege to `_chrony`, attaches
/// the SHM segment, opens PPS and the DS3231, then republishes a
/// PPS-aligned RTC timestamp on every PPS edge until an error occurs.
pub struct ShmPublisher {
    segment: *mut ShmSegment,
    pps: PpsDevice,
    i2c: I2cBus,
    prev_sequence: u32,
}

// SAFETY: the raw pointer only ever refers to the attached SysV segment,
// which this process exclusively writes; it is never sent across threads.
unsafe impl Send for ShmPublisher {}

impl ShmPublisher {
    /// Initializes the publisher: group drop, segment attach/zero, static
    /// field setup, device opens, and one PPS sample to establish the
    /// initial sequence number.
    pub fn start(i2c_bus: i32, pps_id: i32, shm_id: i32) -> Result<Self> {
        if let Some(group) = Group::from_name("_chrony").map_err(Error::from)? {
            setgid(group.gid).map_err(Error::from)?;
        } else {
            return Err(Error::Device("group _chrony not found".into()));
        }

        let segment = attach_segment(shm_id)?;
        unsafe {
            std::ptr::write_bytes(segment, 0, 1);
            (*segment).mode = 1;
            (*segment).precision = -20;
            (*segment).nsamples = 3;
        }

        let pps = PpsDevice::open(pps_id)?;
        let i2c = rtc::open(i2c_bus)?;

        let initial = pps.fetch()?;

        Ok(ShmPublisher { segment, pps, i2c, prev_sequence: initial.sequence })
    }

    /// Runs the publish loop. Returns on the first error, after marking the
    /// segment invalid and detaching it — the publisher has no in-band
    /// cancellation; it is expected to run under a supervisor.
    pub fn run(&mut self) -> Result<()> {
        let result = self.publish_loop();
        self.teardown();
        result
    }

    fn publish_loop(&mut self) -> Result<()> {
        log::info!("SHM publisher started");
        loop {
            let sample = self.pps.fetch()?;
            if self.prev_sequence.wrapping_add(1) != sample.sequence {
                log::error!(
                    "PPS sequence gap: expected {}, got {}",
                    self.prev_sequence.wrapping_add(1),
                    sample.sequence
                );
                return Err(Error::Protocol("PPS sequence gap in SHM publisher".into()));
            }
            self.prev_sequence = sample.sequence;

            let rtc_time = rtc::read_time(&self.i2c)?;
            let now = timexfer::to_epoch(&rtc_time);

            let seg = unsafe { &*self.segment };
            seg.count.fetch_add(1, Ordering::SeqCst);
            seg.valid.store(0, Ordering::SeqCst);
            std::sync::atomic::fence(Ordering::SeqCst);

            unsafe {
                (*self.segment).clock_ts_sec = now;
                (*self.segment).clock_ts_usec = 0;
                (*self.segment).clock_ts_nsec = 0;
                (*self.segment).recv_ts_sec = sample.sec;
                (*self.segment).recv_ts_usec = (sample.nsec / 1000) as i32;
                (*self.segment).recv_ts_nsec = sample.nsec as u32;
            }

            std::sync::atomic::fence(Ordering::SeqCst);
            seg.count.fetch_add(1, Ordering::SeqCst);
            seg.valid.store(1, Ordering::SeqCst);
        }
    }

    fn teardown(&mut self) {
        log::info!("SHM publisher shutting down");
        unsafe {
            (*self.segment).valid.store(0, Ordering::SeqCst);
            std::sync::atomic::fence(Ordering::SeqCst);
            libc::shmdt(self.segment as *const libc::c_void);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_layout_matches_ntp_shm_abi_field_count() {
        // mode, count, 4 timestamp fields (sec/usec pairs), leap, precision,
        // nsamples, valid, 2 nsec fields, 8 reserved ints.
        let expected_ints = 1 + 1 + 1 + 1 + 1 + 1 + 1 + 1 + 1 + 8;
        assert!(expected_ints >= 17);
        assert_eq!(
            std::mem::align_of::<ShmSegment>(),
            std::mem::align_of::<i64>()
        );
    }
}
