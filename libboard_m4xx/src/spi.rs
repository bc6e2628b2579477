//! spidev-backed chip register access.
//!
//! The clock chips on the motherboard speak a uniform 3-byte transaction:
//! a read/write flag in the MSB, a 15-bit register address and one data
//! byte (see the clocking section of the hardware manual).

use std::ffi::CString;
use std::path::Path;
use std::sync::Mutex;

use crate::regs::ChipInterface;
use crate::{Error, Result};

const SPI_IOC_MESSAGE_1: libc::c_ulong = 0x4020_6b00;
const SPI_IOC_WR_MODE: libc::c_ulong = 0x4001_6b01;
const SPI_IOC_WR_MAX_SPEED_HZ: libc::c_ulong = 0x4004_6b04;

#[repr(C)]
#[derive(Default)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

/// One clock chip on a spidev bus.
#[derive(Debug)]
pub struct SpiChip {
    fd: libc::c_int,
    speed_hz: u32,
    // spidev transfers are not reentrant per fd
    bus: Mutex<()>,
}

impl SpiChip {
    pub fn new<P: AsRef<Path>>(path: P, speed_hz: u32, mode: u8) -> Result<SpiChip> {
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
        let chip = SpiChip {
            fd,
            speed_hz,
            bus: Mutex::new(()),
        };
        unsafe {
            if libc::ioctl(fd, SPI_IOC_WR_MODE, &mode) < 0 {
                return Err(Error::Io(format!("{}: cannot set SPI mode", path.display())));
            }
            if libc::ioctl(fd, SPI_IOC_WR_MAX_SPEED_HZ, &speed_hz) < 0 {
                return Err(Error::Io(format!("{}: cannot set SPI speed", path.display())));
            }
        }
        Ok(chip)
    }

    fn transfer(&self, tx: &[u8; 3], rx: &mut [u8; 3]) -> Result<()> {
        let _bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        let xfer = SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: 3,
            speed_hz: self.speed_hz,
            bits_per_word: 8,
            ..Default::default()
        };
        let ret = unsafe { libc::ioctl(self.fd, SPI_IOC_MESSAGE_1, &xfer) };
        if ret < 0 {
            return Err(Error::Io("SPI transfer failed".into()));
        }
        Ok(())
    }
}

impl ChipInterface for SpiChip {
    fn peek8(&self, addr: u16) -> Result<u8> {
        let tx = [0x80 | ((addr >> 8) as u8 & 0x7f), addr as u8, 0x00];
        let mut rx = [0u8; 3];
        self.transfer(&tx, &mut rx)?;
        Ok(rx[2])
    }

    fn poke8(&self, addr: u16, value: u8) -> Result<()> {
        let tx = [(addr >> 8) as u8 & 0x7f, addr as u8, value];
        let mut rx = [0u8; 3];
        self.transfer(&tx, &mut rx)
    }
}

impl Drop for SpiChip {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
