//! 32-bit register banks over memory-mapped I/O.
//!
//! Every peripheral block in this crate talks to its registers through
//! [`RegisterInterface`], so the blocks do not care whether the words end up
//! in a UIO mapping or in a test fixture.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Mutex;

use log::debug;

use crate::{Error, Result};

/// Uniform 32-bit peek/poke access to a register window.
pub trait RegisterInterface: Send + Sync {
    fn peek32(&self, addr: u32) -> Result<u32>;
    fn poke32(&self, addr: u32, value: u32) -> Result<()>;
}

/// 8-bit register access to a clock chip behind SPI or I2C.
///
/// Register addresses are at most 15 bits wide; each transaction is atomic
/// at the chip level.
pub trait ChipInterface: Send {
    fn peek8(&self, addr: u16) -> Result<u8>;
    fn poke8(&self, addr: u16, value: u8) -> Result<()>;
}

#[derive(Debug)]
struct Mapping {
    base: *mut u8,
    fd: libc::c_int,
}

// The raw pointer never leaves the bank and all access to it goes through
// volatile reads/writes guarded by the state mutex.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

#[derive(Debug)]
struct BankState {
    opens: usize,
    mapping: Option<Mapping>,
}

/// A memory-mapped register bank on a UIO or /dev/mem-style device node.
///
/// The underlying device is opened lazily on the first [`MmioBank::open`]
/// scope and closed when the last scope is dropped; nested scopes share one
/// mapping. Reads and writes outside an open scope fail.
#[derive(Debug)]
pub struct MmioBank {
    path: PathBuf,
    size: usize,
    writable: bool,
    state: Mutex<BankState>,
}

impl MmioBank {
    pub fn new<P: AsRef<Path>>(path: P, size: usize, writable: bool) -> Result<MmioBank> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(Error::DeviceNotFound(path.display().to_string()));
        }
        Ok(MmioBank {
            path,
            size,
            writable,
            state: Mutex::new(BankState {
                opens: 0,
                mapping: None,
            }),
        })
    }

    /// Opens the bank for the lifetime of the returned scope.
    pub fn open(&self) -> Result<BankScope> {
        let mut state = self.lock_state();
        if state.opens == 0 {
            state.mapping = Some(self.map()?);
            debug!("mapped {} ({} bytes)", self.path.display(), self.size);
        }
        state.opens += 1;
        Ok(BankScope { bank: self })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<BankState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn map(&self) -> Result<Mapping> {
        let c_path = CString::new(self.path.to_string_lossy().as_bytes())
            .map_err(|_| Error::DeviceNotFound(self.path.display().to_string()))?;
        let flags = if self.writable {
            libc::O_RDWR | libc::O_SYNC
        } else {
            libc::O_RDONLY | libc::O_SYNC
        };
        let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
        if fd < 0 {
            return Err(match unsafe { *libc::__errno_location() } {
                libc::ENOENT => Error::DeviceNotFound(self.path.display().to_string()),
                errno => Error::Io(format!("open {}: errno {}", self.path.display(), errno)),
            });
        }
        let prot = if self.writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                self.size,
                prot,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            unsafe { libc::close(fd) };
            return Err(Error::Io(format!("mmap {} failed", self.path.display())));
        }
        Ok(Mapping {
            base: base as *mut u8,
            fd,
        })
    }

    fn close_one(&self) {
        let mut state = self.lock_state();
        state.opens -= 1;
        if state.opens == 0 {
            if let Some(mapping) = state.mapping.take() {
                unsafe {
                    libc::munmap(mapping.base as *mut libc::c_void, self.size);
                    libc::close(mapping.fd);
                }
                debug!("unmapped {}", self.path.display());
            }
        }
    }

    fn check_addr(&self, addr: u32) -> Result<()> {
        if addr as usize + 4 > self.size || addr % 4 != 0 {
            return Err(Error::OutOfBounds(addr));
        }
        Ok(())
    }
}

impl RegisterInterface for MmioBank {
    fn peek32(&self, addr: u32) -> Result<u32> {
        self.check_addr(addr)?;
        let state = self.lock_state();
        let mapping = state
            .mapping
            .as_ref()
            .ok_or_else(|| Error::Io(format!("{} is not open", self.path.display())))?;
        let value =
            unsafe { ptr::read_volatile(mapping.base.offset(addr as isize) as *const u32) };
        Ok(value)
    }

    fn poke32(&self, addr: u32, value: u32) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.check_addr(addr)?;
        let state = self.lock_state();
        let mapping = state
            .mapping
            .as_ref()
            .ok_or_else(|| Error::Io(format!("{} is not open", self.path.display())))?;
        unsafe { ptr::write_volatile(mapping.base.offset(addr as isize) as *mut u32, value) };
        Ok(())
    }
}

/// RAII scope returned by [`MmioBank::open`].
pub struct BankScope<'a> {
    bank: &'a MmioBank,
}

impl<'a> Drop for BankScope<'a> {
    fn drop(&mut self) {
        self.bank.close_one();
    }
}
