//! Board support for the M4xx motherboard family: register banks, GPIO,
//! clock-chip drivers and the FPGA peripheral blocks the peripheral manager
//! drives.

use std::time::{Duration, Instant};
use std::{fmt, io, result, thread};

pub mod eth_dispatch;
pub mod gpio;
pub mod i2c;
pub mod mboard;
pub mod net;
pub mod regs;
pub mod rpll;
pub mod spi;
pub mod spll;
pub mod xport_adapter;

/// Board-level error.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// No device node matched the expected identifier at construction.
    DeviceNotFound(String),
    /// The register bank is read-only.
    ReadOnly,
    /// Register address outside the mapped window.
    OutOfBounds(u32),
    InvalidArgument(String),
    /// A PLL or MMCM did not report lock within its bounded wait.
    LockTimeout(&'static str),
    /// A busy bit did not clear within its bounded wait.
    BusyTimeout(&'static str),
    /// ARP yielded no entry for the requested peer.
    PeerNotReady(String),
    Io(String),
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::DeviceNotFound(what) => write!(f, "device not found: {}", what),
            Error::ReadOnly => write!(f, "register bank is read-only"),
            Error::OutOfBounds(addr) => write!(f, "register address 0x{:08X} out of bounds", addr),
            Error::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            Error::LockTimeout(what) => write!(f, "lock failure: {} did not lock in time", what),
            Error::BusyTimeout(what) => write!(f, "busy timeout: {}", what),
            Error::PeerNotReady(what) => write!(f, "peer not ready: {}", what),
            Error::Io(what) => write!(f, "io error: {}", what),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::NotFound => Error::DeviceNotFound(err.to_string()),
            _ => Error::Io(err.to_string()),
        }
    }
}

/// Polls `cond` at `interval` until it returns true or `timeout` elapses.
///
/// An `Err` from `cond` aborts the wait immediately.
pub fn wait_for<F>(mut cond: F, timeout: Duration, interval: Duration, what: &'static str) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cond()? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::LockTimeout(what));
        }
        thread::sleep(interval);
    }
}

/// Same bounded poll, reported as a busy timeout instead of a lock failure.
pub fn wait_not_busy<F>(
    mut cond: F,
    timeout: Duration,
    interval: Duration,
    what: &'static str,
) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cond()? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::BusyTimeout(what));
        }
        thread::sleep(interval);
    }
}
