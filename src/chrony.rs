//! UDP-over-Unix-datagram client for the chrony control protocol (§4.6,
//! §6): issues the "tracking" request, decodes the custom 32-bit float, and
//! returns (stratum, |correction|, skew).

use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

const PROTO_VERSION: u8 = 6;
const PKT_TYPE_CMD_REQUEST: u8 = 1;
const PKT_TYPE_CMD_REPLY: u8 = 2;
const REQ_TRACKING: u16 = 33;
const RPY_TRACKING: u16 = 5;

// Both the request and `offsetof(REPLY, EOR)` are 104 bytes: the wire size
// this client sends and expects back, per §6. Field offsets below follow
// standard C struct alignment of the two wire structs in
// `original_source/chrony2rtc.c`.
const WIRE_LEN: usize = 104;

const REQ_OFF_VERSION: usize = 0;
const REQ_OFF_PKT_TYPE: usize = 1;
const REQ_OFF_COMMAND: usize = 4;
const REQ_OFF_SEQUENCE: usize = 8;

const RPY_OFF_VERSION: usize = 0;
const RPY_OFF_PKT_TYPE: usize = 1;
const RPY_OFF_COMMAND: usize = 4;
const RPY_OFF_REPLY: usize = 6;
const RPY_OFF_STATUS: usize = 8;
const RPY_OFF_SEQUENCE: usize = 16;
const RPY_OFF_STRATUM: usize = 52;
const RPY_OFF_CURRENT_CORRECTION: usize = 68;
const RPY_OFF_SKEW_PPM: usize = 88;

fn build_request() -> [u8; WIRE_LEN] {
    let mut req = [0u8; WIRE_LEN];
    req[REQ_OFF_VERSION] = PROTO_VERSION;
    req[REQ_OFF_PKT_TYPE] = PKT_TYPE_CMD_REQUEST;
    req[REQ_OFF_COMMAND..REQ_OFF_COMMAND + 2].copy_from_slice(&REQ_TRACKING.to_be_bytes());
    req[REQ_OFF_SEQUENCE..REQ_OFF_SEQUENCE + 4].copy_from_slice(&1u32.to_be_bytes());
    req
}

/// Decodes chrony's custom 32-bit float: top 7 bits sign-extended exponent,
/// low 25 bits sign-extended coefficient, value = coef * 2^(exp - 25).
pub fn decode_float(raw: u32) -> f64 {
    let x = raw;
    let mut exp = (x >> 25) as i32;
    if exp & 0x40 != 0 {
        exp -= 1 << 7;
    }
    exp -= 25;

    let mut coef = (x & 0x01ff_ffff) as i32;
    if coef & 0x0100_0000 != 0 {
        coef -= 1 << 25;
    }

    coef as f64 * 2f64.powi(exp)
}

/// Encodes a value as chrony's custom 32-bit float. Only used by tests to
/// exercise the round-trip property; the client only ever decodes values
/// received from chronyd.
pub fn encode_float(value: f64) -> u32 {
    if value == 0.0 {
        return 0;
    }
    let mut exp = 0i32;
    let mut coef = value;
    while coef.abs() >= (1i64 << 24) as f64 {
        coef /= 2.0;
        exp += 1;
    }
    while coef.abs() < (1i64 << 23) as f64 && coef != 0.0 {
        coef *= 2.0;
        exp -= 1;
    }
    let coef = coef.round() as i32;
    let exp_field = (exp + 25) & 0x7f;
    let coef_field = (coef as u32) & 0x01ff_ffff;
    ((exp_field as u32) << 25) | coef_field
}

/// Tracking statistics of interest: NTP stratum, absolute current
/// correction (seconds), and clock skew (ppm).
#[derive(Debug, Clone, Copy)]
pub struct Tracking {
    pub stratum: u16,
    pub correction: f64,
    pub skew_ppm: f64,
}

/// A connected chrony control-protocol client. The bound client path is
/// unlinked on [`disconnect`](Self::disconnect) or [`Drop`].
pub struct ChronyClient {
    socket: UnixDatagram,
    bound_path: PathBuf,
}

impl ChronyClient {
    /// Binds a unique per-PID datagram socket (created under umask 0 so
    /// chronyd can reply) and connects it to `chronyd_socket`.
    pub fn connect(chronyd_socket: &std::path::Path) -> Result<Self> {
        let bound_path = PathBuf::from(format!("/run/chrony/rtcclient.{}.sock", std::process::id()));

        let socket = UnixDatagram::unbound()
            .map_err(|e| Error::Device(format!("socket() failed: {e}")))?;

        let old_umask = unsafe { libc::umask(0) };
        let bind_result = socket.bind(&bound_path);
        unsafe { libc::umask(old_umask) };
        bind_result.map_err(|e| Error::Device(format!("bind({bound_path:?}) failed: {e}")))?;

        socket
            .connect(chronyd_socket)
            .map_err(|e| Error::Device(format!("connect({chronyd_socket:?}) failed: {e}")))?;

        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .map_err(|e| Error::Device(e.to_string()))?;

        Ok(ChronyClient { socket, bound_path })
    }

    /// Issues the tracking request and decodes the reply.
    pub fn tracking(&self) -> Result<Tracking> {
        let req = build_request();
        let sent = self
            .socket
            .send(&req)
            .map_err(|e| Error::Protocol(format!("send failed: {e}")))?;
        if sent != WIRE_LEN {
            return Err(Error::Protocol("short send to chronyd".into()));
        }

        let mut buf = [0u8; WIRE_LEN];
        let received = self
            .socket
            .recv(&mut buf)
            .map_err(|e| Error::Protocol(format!("recv failed or timed out: {e}")))?;
        if received != WIRE_LEN {
            return Err(Error::Protocol("short read from chronyd".into()));
        }

        if buf[RPY_OFF_VERSION] != PROTO_VERSION
            || buf[RPY_OFF_PKT_TYPE] != PKT_TYPE_CMD_REPLY
            || u16::from_be_bytes([buf[RPY_OFF_COMMAND], buf[RPY_OFF_COMMAND + 1]]) != REQ_TRACKING
            || u32::from_be_bytes([
                buf[RPY_OFF_SEQUENCE],
                buf[RPY_OFF_SEQUENCE + 1],
                buf[RPY_OFF_SEQUENCE + 2],
                buf[RPY_OFF_SEQUENCE + 3],
            ]) != 1
            || u16::from_be_bytes([buf[RPY_OFF_STATUS], buf[RPY_OFF_STATUS + 1]]) != 0
            || u16::from_be_bytes([buf[RPY_OFF_REPLY], buf[RPY_OFF_REPLY + 1]]) != RPY_TRACKING
        {
            return Err(Error::Protocol("chrony reply field mismatch".into()));
        }

        let stratum = u16::from_be_bytes([buf[RPY_OFF_STRATUM], buf[RPY_OFF_STRATUM + 1]]);
        let correction_raw = u32::from_be_bytes([
            buf[RPY_OFF_CURRENT_CORRECTION],
            buf[RPY_OFF_CURRENT_CORRECTION + 1],
            buf[RPY_OFF_CURRENT_CORRECTION + 2],
            buf[RPY_OFF_CURRENT_CORRECTION + 3],
        ]);
        let skew_raw = u32::from_be_bytes([
            buf[RPY_OFF_SKEW_PPM],
            buf[RPY_OFF_SKEW_PPM + 1],
            buf[RPY_OFF_SKEW_PPM + 2],
            buf[RPY_OFF_SKEW_PPM + 3],
        ]);

        Ok(Tracking {
            stratum,
            correction: decode_float(correction_raw).abs(),
            skew_ppm: decode_float(skew_raw),
        })
    }

    /// Closes the socket and unlinks its bound path.
    pub fn disconnect(self) {
        drop(self);
    }
}

impl Drop for ChronyClient {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.bound_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_raw_one() {
        // raw big-endian 0x00000001 -> 2^-25
        let v = decode_float(0x0000_0001);
        assert!((v - 2f64.powi(-25)).abs() < 1e-12);
    }

    #[test]
    fn decode_raw_zero_coefficient() {
        assert_eq!(decode_float(0x0200_0000), 0.0);
        assert_eq!(decode_float(0xfe00_0000), 0.0);
    }

    #[test]
    fn round_trip_within_relative_precision() {
        let cases = [1.0, -1.0, 0.5, -0.333_333, 123.456, -0.000_001, 1e6, -1e-6];
        for &x in &cases {
            let encoded = encode_float(x);
            let decoded = decode_float(encoded);
            let rel_err = ((decoded - x) / x).abs();
            assert!(rel_err < 2f64.powi(-24), "x={x} decoded={decoded} rel_err={rel_err}");
        }
    }
}
