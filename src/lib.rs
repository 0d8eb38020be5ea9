//! DS3231 + PPS time-sync appliance library: I2C/PPS device I/O, the
//! DS3231 register map, PPS-aligned time transfers, aging calibration, the
//! NTP SHM publisher, the chrony control-protocol client, and the bridge
//! event loop that ties the last two together.

pub mod bridge;
pub mod calib;
pub mod chrony;
pub mod devio;
pub mod error;
pub mod rtc;
pub mod shm;
pub mod systime;
pub mod timexfer;

pub use error::{Error, Result};
