//! Free-running 64-bit timekeepers.
//!
//! Each timekeeper counts radio-clock ticks and can be loaded immediately or
//! on the next PPS edge. The FPGA observes writes in program order, so the
//! low/high halves are written before the control word that arms them.

use std::sync::Arc;

use libboard_m4xx::regs::RegisterInterface;
use libboard_m4xx::{Error, Result};
use log::info;

const TK_BASE: u32 = 0x1000;
// Each timekeeper occupies twelve 32-bit registers.
const TK_STRIDE: u32 = 0x30;

const REG_TIME_NOW_LO: u32 = 0x00;
const REG_TIME_NOW_HI: u32 = 0x04;
const REG_TIME_EVENT_LO: u32 = 0x08;
const REG_TIME_EVENT_HI: u32 = 0x0c;
const REG_TIME_CTRL: u32 = 0x10;
const REG_TIME_LAST_PPS_LO: u32 = 0x14;
const REG_TIME_LAST_PPS_HI: u32 = 0x18;
const REG_TIME_BASE_PERIOD_LO: u32 = 0x1c;
const REG_TIME_BASE_PERIOD_HI: u32 = 0x20;

const CTRL_SET_NOW: u32 = 0x1;
const CTRL_SET_NEXT_PPS: u32 = 0x2;

/// Which latched value a read returns.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReadTime {
    Now,
    LastPps,
}

/// When a written time takes effect.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SetTime {
    Now,
    NextPps,
}

pub struct Timekeepers {
    regs: Arc<dyn RegisterInterface>,
    num: u32,
}

impl Timekeepers {
    pub fn new(regs: Arc<dyn RegisterInterface>, num: u32) -> Timekeepers {
        Timekeepers { regs, num }
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    fn base(&self, tk: u32) -> Result<u32> {
        if tk >= self.num {
            return Err(Error::InvalidArgument(format!(
                "timekeeper index {} out of range (have {})",
                tk, self.num
            )));
        }
        Ok(TK_BASE + tk * TK_STRIDE)
    }

    pub fn get_time(&self, tk: u32, which: ReadTime) -> Result<u64> {
        let base = self.base(tk)?;
        let (lo_reg, hi_reg) = match which {
            ReadTime::Now => (REG_TIME_NOW_LO, REG_TIME_NOW_HI),
            ReadTime::LastPps => (REG_TIME_LAST_PPS_LO, REG_TIME_LAST_PPS_HI),
        };
        let lo = self.regs.peek32(base + lo_reg)?;
        let hi = self.regs.peek32(base + hi_reg)?;
        Ok(((hi as u64) << 32) | lo as u64)
    }

    pub fn set_time(&self, tk: u32, ticks: u64, when: SetTime) -> Result<()> {
        let base = self.base(tk)?;
        info!(
            "timekeeper {}: set to {} ticks ({:?})",
            tk, ticks, when
        );
        self.regs.poke32(base + REG_TIME_EVENT_LO, ticks as u32)?;
        self.regs
            .poke32(base + REG_TIME_EVENT_HI, (ticks >> 32) as u32)?;
        self.regs.poke32(
            base + REG_TIME_CTRL,
            match when {
                SetTime::Now => CTRL_SET_NOW,
                SetTime::NextPps => CTRL_SET_NEXT_PPS,
            },
        )
    }

    /// Sets the tick period, in Q32.32 nanoseconds. Takes effect on the next
    /// PPS edge.
    pub fn set_tick_period(&self, tk: u32, period_ns: u64) -> Result<()> {
        let base = self.base(tk)?;
        self.regs
            .poke32(base + REG_TIME_BASE_PERIOD_LO, period_ns as u32)?;
        self.regs
            .poke32(base + REG_TIME_BASE_PERIOD_HI, (period_ns >> 32) as u32)
    }

    /// Q32.32 nanosecond period for a tick rate.
    pub fn period_ns_for_rate(rate: u64) -> u64 {
        ((1_000_000_000u128 << 32) / rate as u128) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    // Emulates the FPGA side: an armed SET_NEXT_PPS load takes effect when
    // the test fires a PPS edge.
    struct FakeTkRegs {
        words: Mutex<HashMap<u32, u32>>,
        writes: Mutex<Vec<(u32, u32)>>,
    }

    impl FakeTkRegs {
        fn new() -> Arc<FakeTkRegs> {
            Arc::new(FakeTkRegs {
                words: Mutex::new(HashMap::new()),
                writes: Mutex::new(Vec::new()),
            })
        }

        fn pulse_pps(&self, tk: u32) {
            let base = TK_BASE + tk * TK_STRIDE;
            let mut words = self.words.lock().unwrap();
            if *words.get(&(base + REG_TIME_CTRL)).unwrap_or(&0) & CTRL_SET_NEXT_PPS != 0 {
                let lo = *words.get(&(base + REG_TIME_EVENT_LO)).unwrap_or(&0);
                let hi = *words.get(&(base + REG_TIME_EVENT_HI)).unwrap_or(&0);
                words.insert(base + REG_TIME_NOW_LO, lo);
                words.insert(base + REG_TIME_NOW_HI, hi);
                words.insert(base + REG_TIME_LAST_PPS_LO, lo);
                words.insert(base + REG_TIME_LAST_PPS_HI, hi);
                words.insert(base + REG_TIME_CTRL, 0);
            }
        }
    }

    impl RegisterInterface for FakeTkRegs {
        fn peek32(&self, addr: u32) -> Result<u32> {
            Ok(*self.words.lock().unwrap().get(&addr).unwrap_or(&0))
        }

        fn poke32(&self, addr: u32, value: u32) -> Result<()> {
            self.words.lock().unwrap().insert(addr, value);
            self.writes.lock().unwrap().push((addr, value));
            Ok(())
        }
    }

    #[test]
    fn set_time_writes_halves_then_control() {
        let regs = FakeTkRegs::new();
        let tks = Timekeepers::new(regs.clone(), 2);
        let ticks = (7u64 << 32) | 0x1234;
        tks.set_time(1, ticks, SetTime::Now).unwrap();
        let base = TK_BASE + TK_STRIDE;
        let writes = regs.writes.lock().unwrap();
        assert_eq!(
            *writes,
            vec![
                (base + REG_TIME_EVENT_LO, 0x1234),
                (base + REG_TIME_EVENT_HI, 7),
                (base + REG_TIME_CTRL, CTRL_SET_NOW),
            ]
        );
    }

    #[test]
    fn next_pps_load_latches_on_pps() {
        let regs = FakeTkRegs::new();
        let tks = Timekeepers::new(regs.clone(), 1);
        let ticks = 1u64 << 40;
        tks.set_time(0, ticks, SetTime::NextPps).unwrap();
        // Not visible before the edge.
        assert_eq!(tks.get_time(0, ReadTime::LastPps).unwrap(), 0);
        regs.pulse_pps(0);
        assert!(tks.get_time(0, ReadTime::Now).unwrap() >= ticks);
        assert_eq!(tks.get_time(0, ReadTime::LastPps).unwrap(), ticks);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let tks = Timekeepers::new(FakeTkRegs::new(), 2);
        assert!(tks.get_time(2, ReadTime::Now).is_err());
        assert!(tks.set_time(2, 0, SetTime::Now).is_err());
        assert!(tks.set_tick_period(2, 0).is_err());
    }

    #[test]
    fn tick_period_is_q32_32() {
        // 122.88 MHz -> 8.138 ns.
        let period = Timekeepers::period_ns_for_rate(122_880_000);
        assert_eq!(period >> 32, 8);
        let regs = FakeTkRegs::new();
        let tks = Timekeepers::new(regs.clone(), 1);
        tks.set_tick_period(0, period).unwrap();
        assert_eq!(
            regs.peek32(TK_BASE + REG_TIME_BASE_PERIOD_HI).unwrap(),
            8
        );
    }
}
