//! Poll-driven event loop gating RTC writes on chrony's trust in the
//! disciplined clock (§4.7): a 10 s timer tick, a signal descriptor for
//! clean shutdown, and fork/exec dispatch to the RTC tool so the daemon
//! itself never touches I2C.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::chrony::{ChronyClient, Tracking};
use crate::error::{Error, Result};

/// Ticks run every 10 s; `delay` must reach this before a new attempt fires.
const IDLE_TICKS: u32 = 360;
const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Trust thresholds and invocation targets, taken verbatim from the CLI.
pub struct BridgeConfig {
    pub max_stratum: u16,
    pub max_correction: f64,
    pub max_skew: f64,
    pub chronyd_socket: PathBuf,
    pub rtctool_path: PathBuf,
}

/// The Bridge daemon. Owns the timer, signal and chrony session file
/// descriptors; never opens I2C or PPS itself.
pub struct Bridge {
    config: BridgeConfig,
    timer: TimerFd,
    signals: SignalFd,
    session: Option<ChronyClient>,
    delay: u32,
}

impl Bridge {
    /// Masks SIGINT/SIGTERM/SIGHUP/SIGQUIT process-wide, routes them through
    /// a signalfd, and arms a 10 s periodic timerfd. `delay` starts at
    /// `IDLE_TICKS` so the first tick triggers an attempt immediately.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGHUP);
        mask.add(Signal::SIGQUIT);
        mask.thread_block().map_err(Error::from)?;

        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK).map_err(Error::from)?;

        let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK)
            .map_err(Error::from)?;
        let interval = TimeSpec::from(TICK_INTERVAL);
        timer
            .set(
                Expiration::IntervalDelayed(interval, interval),
                TimerSetTimeFlags::empty(),
            )
            .map_err(Error::from)?;

        Ok(Bridge { config, timer, signals, session: None, delay: IDLE_TICKS })
    }

    /// Runs until a shutdown signal arrives. Closes and unlinks any open
    /// chrony session before returning.
    pub fn run(&mut self) -> Result<()> {
        let result = self.event_loop();
        self.session.take();
        result
    }

    fn event_loop(&mut self) -> Result<()> {
        loop {
            let mut fds = [
                PollFd::new(&self.timer, PollFlags::POLLIN),
                PollFd::new(&self.signals, PollFlags::POLLIN),
            ];
            poll(&mut fds, -1).map_err(Error::from)?;

            if fds[1].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN) {
                if self.signals.read_signal().map_err(Error::from)?.is_some() {
                    return Err(Error::Signal);
                }
            }

            if fds[0].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN) {
                let _ = self.timer.wait();
                self.delay += 1;
                if self.delay >= IDLE_TICKS {
                    self.tick();
                }
            }
        }
    }

    /// One gated attempt: ensure a session, query tracking, check the trust
    /// gate, and on pass, fork/exec the RTC tool. Any failure before the
    /// gate just gives up for this tick; `delay` only resets on a clean
    /// child exit.
    fn tick(&mut self) {
        if self.session.is_none() {
            match ChronyClient::connect(&self.config.chronyd_socket) {
                Ok(client) => self.session = Some(client),
                Err(e) => {
                    log::warn!("can't connect to chronyd: {e}");
                    return;
                }
            }
        }

        let tracking = match self.session.as_ref().unwrap().tracking() {
            Ok(t) => t,
            Err(e) => {
                log::warn!("chrony tracking query failed: {e}");
                self.session.take();
                return;
            }
        };

        let trusted = trust_gate(&tracking, &self.config);
        if !trusted {
            log::debug!(
                "chrony not yet trusted: stratum={} correction={} skew={}",
                tracking.stratum,
                tracking.correction,
                tracking.skew_ppm
            );
            return;
        }

        match dispatch_rtctool(&self.config.rtctool_path) {
            Ok(()) => {
                log::info!("wrote system time to RTC");
                self.delay = 0;
                self.session.take();
            }
            Err(e) => log::warn!("rtctool invocation failed: {e}"),
        }
    }
}

/// The trust gate (§3, §4.7): the disciplined clock is written to the RTC
/// only once chrony's stratum, correction and skew all clear their
/// configured thresholds.
fn trust_gate(tracking: &Tracking, config: &BridgeConfig) -> bool {
    tracking.stratum < config.max_stratum
        && tracking.correction < config.max_correction
        && tracking.skew_ppm < config.max_skew
}

/// Forks and execs `rtctool -s` in the child, waits for it in the parent.
/// Only a clean (status-0) exit counts as success.
fn dispatch_rtctool(rtctool_path: &Path) -> Result<()> {
    let status: ExitStatus = Command::new(rtctool_path)
        .arg("-s")
        .status()
        .map_err(|e| Error::Child(format!("exec {rtctool_path:?} failed: {e}")))?;

    if status.success() {
        Ok(())
    } else {
        Err(Error::Child(format!(
            "rtctool exited with {:?} (signal {:?})",
            status.code(),
            status.signal()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_ticks_match_sixty_minutes_at_ten_second_cadence() {
        assert_eq!(super::IDLE_TICKS as u64 * super::TICK_INTERVAL.as_secs(), 3600);
    }

    fn thresholds(max_stratum: u16, max_correction: f64, max_skew: f64) -> BridgeConfig {
        BridgeConfig {
            max_stratum,
            max_correction,
            max_skew,
            chronyd_socket: PathBuf::from("/run/chrony/chronyd.sock"),
            rtctool_path: PathBuf::from("/sbin/rtctool"),
        }
    }

    /// §8 scenario 5: stratum=2, |correction|=0.05, skew=0.2, thresholds
    /// (16, 0.1, 1.0) -> triggers write.
    #[test]
    fn trust_gate_passes_within_thresholds() {
        let config = thresholds(16, 0.1, 1.0);
        let tracking = Tracking { stratum: 2, correction: 0.05, skew_ppm: 0.2 };
        assert!(trust_gate(&tracking, &config));
    }

    /// §8 scenario 5: stratum=16 skips, even with correction/skew in range.
    #[test]
    fn trust_gate_rejects_unsynchronized_stratum() {
        let config = thresholds(16, 0.1, 1.0);
        let tracking = Tracking { stratum: 16, correction: 0.05, skew_ppm: 0.2 };
        assert!(!trust_gate(&tracking, &config));
    }

    /// §8 scenario 5: skew=1.0 skips (not strictly less than the threshold).
    #[test]
    fn trust_gate_rejects_skew_at_threshold() {
        let config = thresholds(16, 0.1, 1.0);
        let tracking = Tracking { stratum: 2, correction: 0.05, skew_ppm: 1.0 };
        assert!(!trust_gate(&tracking, &config));
    }

    #[test]
    fn trust_gate_rejects_correction_over_threshold() {
        let config = thresholds(16, 0.1, 1.0);
        let tracking = Tracking { stratum: 2, correction: 0.2, skew_ppm: 0.2 };
        assert!(!trust_gate(&tracking, &config));
    }
}
