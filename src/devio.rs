//! Thin synchronous wrappers over the I2C/SMBus ioctl ABI and the kernel PPS
//! ABI. No retries happen here: any `open`/`ioctl` failure collapses to a
//! single [`Error::Device`]; retry policy belongs to the caller.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use crate::error::{Error, Result};

const I2C_SLAVE: u16 = 0x0703;
const I2C_FUNCS: u16 = 0x0705;
const I2C_SMBUS: u16 = 0x0720;

const I2C_FUNC_SMBUS_READ_BYTE: u64 = 0x0002_0000;
const I2C_FUNC_SMBUS_WRITE_BYTE: u64 = 0x0004_0000;
const I2C_FUNC_SMBUS_READ_BYTE_DATA: u64 = 0x0008_0000;
const I2C_FUNC_SMBUS_WRITE_BYTE_DATA: u64 = 0x0010_0000;

const I2C_SMBUS_READ: u8 = 1;
const I2C_SMBUS_WRITE: u8 = 0;
const I2C_SMBUS_BYTE_DATA: u32 = 2;
const I2C_SMBUS_I2C_BLOCK_DATA: u32 = 8;

const I2C_SMBUS_BLOCK_MAX: usize = 32;

// Mirrors `union i2c_smbus_data` from <linux/i2c-dev.h>: a byte, a word, or
// a length-prefixed block, overlaid in one fixed-size buffer.
#[repr(C)]
struct I2cSmbusData {
    block: [u8; I2C_SMBUS_BLOCK_MAX + 2],
}

// Mirrors `struct i2c_smbus_ioctl_data`.
#[repr(C)]
struct I2cSmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut I2cSmbusData,
}

nix::ioctl_read_bad!(i2c_funcs, I2C_FUNCS, u64);
nix::ioctl_write_int_bad!(i2c_slave, I2C_SLAVE);
nix::ioctl_readwrite_bad!(i2c_smbus, I2C_SMBUS, I2cSmbusIoctlData);

/// An open I2C bus with a bound 7-bit slave address.
pub struct I2cBus {
    file: File,
}

impl I2cBus {
    /// Opens `/dev/i2c-<bus>`, falling back to `/dev/i2c/<bus>`, verifies
    /// the SMBus byte/byte-data capability bits and binds `slave_addr`.
    pub fn open(bus: i32, slave_addr: u8) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/dev/i2c-{bus}"))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(format!("/dev/i2c/{bus}"))
            })
            .map_err(|e| Error::Device(format!("can't open i2c bus {bus}: {e}")))?;

        let fd = file.as_raw_fd();
        let mut funcs: u64 = 0;
        unsafe { i2c_funcs(fd, &mut funcs) }
            .map_err(|e| Error::Device(format!("I2C_FUNCS failed: {e}")))?;

        let required = I2C_FUNC_SMBUS_READ_BYTE
            | I2C_FUNC_SMBUS_READ_BYTE_DATA
            | I2C_FUNC_SMBUS_WRITE_BYTE
            | I2C_FUNC_SMBUS_WRITE_BYTE_DATA;
        if funcs & required != required {
            log::error!("i2c-{bus} lacks required SMBus functions (funcs=0x{funcs:x})");
            return Err(Error::Device("i2c adapter lacks required SMBus functions".into()));
        }
        unsafe { i2c_slave(fd, slave_addr as libc::c_int) }
            .map_err(|e| Error::Device(format!("I2C_SLAVE failed: {e}")))?;

        log::debug!("opened i2c-{bus}, bound slave 0x{slave_addr:02x}");
        Ok(I2cBus { file })
    }

    fn smbus(&self, read_write: u8, command: u8, size: u32, data: &mut I2cSmbusData) -> Result<()> {
        let mut ctl = I2cSmbusIoctlData {
            read_write,
            command,
            size,
            data: data as *mut I2cSmbusData,
        };
        unsafe { i2c_smbus(self.file.as_raw_fd(), &mut ctl) }
            .map_err(|e| Error::Device(format!("I2C_SMBUS ioctl failed: {e}")))?;
        Ok(())
    }

    /// SMBus read-byte-data: reads a single byte from `reg`.
    pub fn read_byte(&self, reg: u8) -> Result<u8> {
        let mut data = I2cSmbusData { block: [0; I2C_SMBUS_BLOCK_MAX + 2] };
        self.smbus(I2C_SMBUS_READ, reg, I2C_SMBUS_BYTE_DATA, &mut data)?;
        Ok(data.block[0])
    }

    /// SMBus write-byte-data: writes a single byte to `reg`.
    pub fn write_byte(&self, reg: u8, value: u8) -> Result<()> {
        let mut data = I2cSmbusData { block: [0; I2C_SMBUS_BLOCK_MAX + 2] };
        data.block[0] = value;
        self.smbus(I2C_SMBUS_WRITE, reg, I2C_SMBUS_BYTE_DATA, &mut data)
    }

    /// SMBus block read: reads `dest.len()` bytes starting at `reg`.
    pub fn read_block(&self, reg: u8, dest: &mut [u8]) -> Result<()> {
        if dest.len() > I2C_SMBUS_BLOCK_MAX {
            return Err(Error::Device("smbus block read too long".into()));
        }
        let mut data = I2cSmbusData { block: [0; I2C_SMBUS_BLOCK_MAX + 2] };
        data.block[0] = dest.len() as u8;
        self.smbus(I2C_SMBUS_READ, reg, I2C_SMBUS_I2C_BLOCK_DATA, &mut data)?;
        dest.copy_from_slice(&data.block[1..=dest.len()]);
        Ok(())
    }

    /// SMBus block write: writes `src` starting at `reg`.
    pub fn write_block(&self, reg: u8, src: &[u8]) -> Result<()> {
        if src.len() > I2C_SMBUS_BLOCK_MAX {
            return Err(Error::Device("smbus block write too long".into()));
        }
        let mut data = I2cSmbusData { block: [0; I2C_SMBUS_BLOCK_MAX + 2] };
        data.block[0] = src.len() as u8;
        data.block[1..=src.len()].copy_from_slice(src);
        self.smbus(I2C_SMBUS_WRITE, reg, I2C_SMBUS_I2C_BLOCK_DATA, &mut data)
    }
}

// Mirrors the relevant bits of <linux/pps.h>.
const PPS_CAPTUREASSERT: i32 = 0x01;
const PPS_OFFSETASSERT: i32 = 0x10;
const PPS_CANWAIT: i32 = 0x100;
const PPS_TIME_INVALID: i32 = 0x01;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PpsKtime {
    sec: i64,
    nsec: i32,
    flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PpsKparams {
    api_version: i32,
    mode: i32,
    assert_off_tu: PpsKtime,
    clear_off_tu: PpsKtime,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PpsKinfo {
    assert_sequence: u32,
    clear_sequence: u32,
    assert_tu: PpsKtime,
    clear_tu: PpsKtime,
    current_mode: i32,
}

#[repr(C)]
struct PpsFdata {
    info: PpsKinfo,
    timeout: PpsKtime,
}

const PPS_IOC_MAGIC: u8 = b'p';

nix::ioctl_read!(pps_getcap, PPS_IOC_MAGIC, 0x01, i32);
nix::ioctl_readwrite!(pps_fetch, PPS_IOC_MAGIC, 0x05, PpsFdata);
nix::ioctl_readwrite!(pps_getparams, PPS_IOC_MAGIC, 0xa1, PpsKparams);
nix::ioctl_readwrite!(pps_setparams, PPS_IOC_MAGIC, 0xa2, PpsKparams);

/// A captured PPS assert event: kernel sequence number and the
/// `CLOCK_REALTIME` timestamp of the rising edge.
#[derive(Debug, Clone, Copy)]
pub struct PpsSample {
    pub sequence: u32,
    pub sec: i64,
    pub nsec: i32,
}

/// An open PPS source device with capture-assert enabled.
pub struct PpsDevice {
    file: File,
}

impl PpsDevice {
    /// Opens `/dev/pps<id>`, verifies capture-assert and can-wait
    /// capability, enables assert capture, and zeroes the assert offset if
    /// the device supports offset correction.
    pub fn open(id: i32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/dev/pps{id}"))
            .map_err(|e| Error::Device(format!("can't open /dev/pps{id}: {e}")))?;
        let fd = file.as_raw_fd();

        let mut caps: i32 = 0;
        unsafe { pps_getcap(fd, &mut caps) }
            .map_err(|e| Error::Device(format!("PPS_GETCAP failed: {e}")))?;
        if caps & PPS_CAPTUREASSERT == 0 || caps & PPS_CANWAIT == 0 {
            return Err(Error::Device("pps device lacks capture-assert/can-wait".into()));
        }

        let mut params = PpsKparams::default();
        unsafe { pps_getparams(fd, &mut params) }
            .map_err(|e| Error::Device(format!("PPS_GETPARAMS failed: {e}")))?;
        params.mode |= PPS_CAPTUREASSERT;
        if caps & PPS_OFFSETASSERT != 0 {
            params.mode |= PPS_OFFSETASSERT;
            params.assert_off_tu = PpsKtime::default();
        }
        unsafe { pps_setparams(fd, &mut params) }
            .map_err(|e| Error::Device(format!("PPS_SETPARAMS failed: {e}")))?;

        Ok(PpsDevice { file })
    }

    /// Blocks for up to 1.5 s for the next assert edge and returns its
    /// sequence number and timestamp.
    pub fn fetch(&self) -> Result<PpsSample> {
        let timeout = Duration::from_millis(1500);
        let mut data = PpsFdata {
            info: PpsKinfo::default(),
            timeout: PpsKtime {
                sec: timeout.as_secs() as i64,
                nsec: timeout.subsec_nanos() as i32,
                flags: !(PPS_TIME_INVALID as u32),
            },
        };
        unsafe { pps_fetch(self.file.as_raw_fd(), &mut data) }
            .map_err(|e| Error::Device(format!("PPS_FETCH failed: {e}")))?;
        Ok(PpsSample {
            sequence: data.info.assert_sequence,
            sec: data.info.assert_tu.sec,
            nsec: data.info.assert_tu.nsec,
        })
    }
}

/// Abstraction over a source of PPS assert edges. Lets
/// [`crate::calib::estimate_aging`] be driven by a simulated oscillator in
/// tests instead of a real `/dev/ppsN` device.
pub trait PpsSource {
    fn fetch(&self) -> Result<PpsSample>;
}

impl PpsSource for PpsDevice {
    fn fetch(&self) -> Result<PpsSample> {
        PpsDevice::fetch(self)
    }
}
