//! Closed-loop binary search over the signed 8-bit DS3231 aging register,
//! converging the value that centers 1-second PPS intervals at 10^9 ns
//! (§4.4).

use crate::devio::PpsSource;
use crate::error::{Error, Result};
use crate::rtc::AgingSink;

/// Default iteration count per measurement round.
pub const DEFAULT_ITERATIONS: u32 = 256;

/// Estimates the aging value that centers PPS intervals at exactly one
/// second. `iterations` successive PPS intervals are accumulated per
/// halving of `delta` (which starts at 64 and halves to 0, terminating the
/// search in exactly 8 rounds). `progress(current_tick, total_ticks)` is
/// called once per PPS wait; returning `false` cancels the estimation.
/// Generic over [`AgingSink`]/[`PpsSource`] so it can be driven by a
/// simulated oscillator in tests as well as the real DS3231/`/dev/ppsN`.
pub fn estimate_aging<A: AgingSink, P: PpsSource>(
    aging: &A,
    pps: &P,
    iterations: u32,
    mut progress: impl FnMut(u32, u32) -> bool,
) -> Result<i8> {
    let total_ticks = (iterations + 1) * 7;
    let mut current_tick = 0u32;
    let mut value: i32 = 0;
    let mut delta: i32 = 64;

    loop {
        aging.set_aging(value as i8)?;

        if delta == 0 {
            break;
        }

        let mut prev = pps.fetch()?;
        current_tick += 1;
        if !progress(current_tick, total_ticks) {
            return Err(Error::Validation("aging estimation cancelled".into()));
        }

        let mut sum: u64 = 0;
        for _ in 0..iterations {
            let sample = pps.fetch()?;
            current_tick += 1;
            if !progress(current_tick, total_ticks) {
                return Err(Error::Validation("aging estimation cancelled".into()));
            }

            if prev.sequence.wrapping_add(1) != sample.sequence {
                return Err(Error::Protocol("PPS sequence gap during aging estimation".into()));
            }

            let (dsec, dnsec) = interval(prev, sample)?;
            if dsec > 1 {
                return Err(Error::Protocol("PPS interval exceeded 1 second".into()));
            }
            if dsec == 1 && dnsec > 100_000_000 {
                return Err(Error::Protocol("PPS interval exceeded 1.1 seconds".into()));
            }
            if dsec == 0 && dnsec < 900_000_000 {
                return Err(Error::Protocol("PPS interval collapsed below 0.9 seconds".into()));
            }

            sum += if dsec != 0 { 1_000_000_000 } else { 0 };
            sum += dnsec as u64;

            prev = sample;
        }

        let mean = sum / iterations as u64;
        if mean > 1_000_000_000 {
            value -= delta;
        } else {
            value += delta;
        }
        delta >>= 1;
    }

    Ok(value as i8)
}

/// Computes `(b - a)` as (whole seconds, nanoseconds), rejecting any
/// non-monotonic pair.
fn interval(a: crate::devio::PpsSample, b: crate::devio::PpsSample) -> Result<(i64, i64)> {
    if b.sec < a.sec || (b.sec == a.sec && b.nsec < a.nsec) {
        return Err(Error::Protocol("PPS timestamps went backwards".into()));
    }
    let mut dsec = b.sec - a.sec;
    let dnsec = if b.nsec < a.nsec {
        dsec -= 1;
        (b.nsec as i64) + 1_000_000_000 - (a.nsec as i64)
    } else {
        (b.nsec as i64) - (a.nsec as i64)
    };
    Ok((dsec, dnsec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devio::PpsSample;
    use std::cell::Cell;

    /// A deterministic oscillator whose PPS period drifts linearly with the
    /// aging register, used to drive `estimate_aging` end to end without
    /// real I2C/PPS hardware. `drift_ppm` is the oscillator's free-running
    /// frequency offset at aging value 0 (positive = runs fast); each unit
    /// of aging corrects the frequency by -10 ppm (§3: "positive slows"),
    /// which lengthens the period by 10_000 ns per unit.
    struct SimulatedOscillator {
        aging_value: Cell<i8>,
        sequence: Cell<u32>,
        sec: Cell<i64>,
        nsec: Cell<i32>,
        drift_ppm: i64,
    }

    impl SimulatedOscillator {
        fn new(drift_ppm: i64) -> Self {
            SimulatedOscillator {
                aging_value: Cell::new(0),
                sequence: Cell::new(0),
                sec: Cell::new(0),
                nsec: Cell::new(0),
                drift_ppm,
            }
        }

        fn period_ns(&self) -> i64 {
            1_000_000_000 - 1000 * self.drift_ppm + 10_000 * self.aging_value.get() as i64
        }
    }

    impl AgingSink for SimulatedOscillator {
        fn set_aging(&self, value: i8) -> Result<()> {
            self.aging_value.set(value);
            Ok(())
        }
    }

    impl PpsSource for SimulatedOscillator {
        fn fetch(&self) -> Result<PpsSample> {
            let seq = self.sequence.get().wrapping_add(1);
            self.sequence.set(seq);

            let total_nsec = self.nsec.get() as i64 + self.period_ns();
            let sec = self.sec.get() + total_nsec.div_euclid(1_000_000_000);
            let nsec = total_nsec.rem_euclid(1_000_000_000) as i32;
            self.sec.set(sec);
            self.nsec.set(nsec);

            Ok(PpsSample { sequence: seq, sec, nsec })
        }
    }

    #[test]
    fn converges_on_simulated_oscillator_drift() {
        // drift_ppm=37 ppm fast: equilibrium aging is drift/10 = 3.7,
        // rounding to 4; the integer binary search lands within +/-1 of
        // that (§8's documented tolerance).
        let osc = SimulatedOscillator::new(37);
        let value = estimate_aging(&osc, &osc, 4, |_, _| true).unwrap();
        assert!((value as i32 - 4).abs() <= 1, "converged value={value}");
    }

    #[test]
    fn progress_callback_returning_false_cancels() {
        let osc = SimulatedOscillator::new(0);
        let result = estimate_aging(&osc, &osc, 4, |tick, _| tick < 2);
        assert!(result.is_err());
    }

    #[test]
    fn binary_search_halves_to_zero_in_eight_rounds() {
        // delta takes the values 64,32,16,8,4,2,1 (seven measured rounds)
        // before the eighth loop pass sees delta==0 and exits.
        let mut delta: i32 = 64;
        let mut measured_rounds = 0;
        let mut total_passes = 0;
        loop {
            total_passes += 1;
            if delta == 0 {
                break;
            }
            measured_rounds += 1;
            delta >>= 1;
        }
        assert_eq!(measured_rounds, 7);
        assert_eq!(total_passes, 8);
    }

    #[test]
    fn interval_handles_nanosecond_borrow() {
        let a = PpsSample { sequence: 1, sec: 10, nsec: 900_000_000 };
        let b = PpsSample { sequence: 2, sec: 11, nsec: 100_000_000 };
        let (dsec, dnsec) = interval(a, b).unwrap();
        assert_eq!(dsec, 0);
        assert_eq!(dnsec, 200_000_000);
    }

    #[test]
    fn interval_rejects_backwards_time() {
        let a = PpsSample { sequence: 1, sec: 10, nsec: 0 };
        let b = PpsSample { sequence: 2, sec: 9, nsec: 0 };
        assert!(interval(a, b).is_err());
    }
}
