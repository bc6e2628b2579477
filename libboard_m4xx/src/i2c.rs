//! i2c-dev-backed chip register access.
//!
//! Register interfaces on the I2C expanders and auxiliary clock parts use
//! either one- or two-byte register addresses; a few parts sit behind
//! ten-bit device addresses.

use std::ffi::CString;
use std::path::Path;
use std::sync::Mutex;

use crate::regs::ChipInterface;
use crate::{Error, Result};

const I2C_SLAVE: libc::c_ulong = 0x0703;
const I2C_TENBIT: libc::c_ulong = 0x0704;

/// Width of the register address on the wire.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RegAddrSize {
    One,
    Two,
}

/// One chip on an i2c-dev bus.
#[derive(Debug)]
pub struct I2cChip {
    fd: libc::c_int,
    reg_addr_size: RegAddrSize,
    bus: Mutex<()>,
}

impl I2cChip {
    pub fn new<P: AsRef<Path>>(
        path: P,
        dev_addr: u16,
        ten_bit: bool,
        reg_addr_size: RegAddrSize,
    ) -> Result<I2cChip> {
        let path = path.as_ref();
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| Error::DeviceNotFound(path.display().to_string()))?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(match unsafe { *libc::__errno_location() } {
                libc::ENOENT => Error::DeviceNotFound(path.display().to_string()),
                errno => Error::Io(format!("open {}: errno {}", path.display(), errno)),
            });
        }
        unsafe {
            if libc::ioctl(fd, I2C_TENBIT, if ten_bit { 1 } else { 0 } as libc::c_long) < 0 {
                libc::close(fd);
                return Err(Error::Io(format!(
                    "{}: cannot set ten-bit addressing",
                    path.display()
                )));
            }
            if libc::ioctl(fd, I2C_SLAVE, dev_addr as libc::c_long) < 0 {
                libc::close(fd);
                return Err(Error::Io(format!(
                    "{}: cannot select device 0x{:x}",
                    path.display(),
                    dev_addr
                )));
            }
        }
        Ok(I2cChip {
            fd,
            reg_addr_size,
            bus: Mutex::new(()),
        })
    }

    fn reg_addr_bytes(&self, addr: u16) -> ([u8; 2], usize) {
        match self.reg_addr_size {
            RegAddrSize::One => ([addr as u8, 0], 1),
            RegAddrSize::Two => ([(addr >> 8) as u8, addr as u8], 2),
        }
    }

    fn write_all(&self, buf: &[u8]) -> Result<()> {
        let ret = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if ret != buf.len() as isize {
            return Err(Error::Io("I2C write failed".into()));
        }
        Ok(())
    }
}

impl ChipInterface for I2cChip {
    fn peek8(&self, addr: u16) -> Result<u8> {
        let _bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        let (reg, len) = self.reg_addr_bytes(addr);
        self.write_all(&reg[..len])?;
        let mut value = [0u8; 1];
        let ret = unsafe { libc::read(self.fd, value.as_mut_ptr() as *mut libc::c_void, 1) };
        if ret != 1 {
            return Err(Error::Io("I2C read failed".into()));
        }
        Ok(value[0])
    }

    fn poke8(&self, addr: u16, value: u8) -> Result<()> {
        let _bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        let (reg, len) = self.reg_addr_bytes(addr);
        let mut buf = [0u8; 3];
        buf[..len].copy_from_slice(&reg[..len]);
        buf[len] = value;
        self.write_all(&buf[..len + 1])
    }
}

impl Drop for I2cChip {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_bus_is_reported() {
        match I2cChip::new("/dev/i2c-m4xx-none", 0x68, false, RegAddrSize::Two) {
            Err(Error::DeviceNotFound(_)) => (),
            other => panic!("expected DeviceNotFound, got {:?}", other),
        }
    }
}
