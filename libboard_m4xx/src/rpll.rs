//! Reference-PLL driver.
//!
//! The RPLL takes the selected base reference input and produces the BRC on
//! output 7 plus a user clock for the Ethernet cores. All dividers come from
//! fixed tables keyed on the requested tuple; the register map itself is an
//! opaque commit-on-apply bank.

use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::regs::ChipInterface;
use crate::{wait_for, Error, Result};

const REG_ID_HI: u16 = 0x00;
const REG_ID_LO: u16 = 0x01;
const REG_RESET: u16 = 0x02;
const REG_READBACK_EN: u16 = 0x03;
const REG_IN_SEL: u16 = 0x0c;
const REG_PLL1_R: u16 = 0x10;
const REG_PLL1_N_HI: u16 = 0x11;
const REG_PLL1_N_LO: u16 = 0x12;
const REG_PLL2_R: u16 = 0x14;
const REG_PLL2_N_HI: u16 = 0x15;
const REG_PLL2_N_LO: u16 = 0x16;
const REG_OUT7_MUX: u16 = 0x40;
const REG_OUT7_DIV_HI: u16 = 0x41;
const REG_OUT7_DIV_LO: u16 = 0x42;
const REG_USR_DIV: u16 = 0x44;
const REG_VCO_CAL: u16 = 0x50;
const REG_STATUS: u16 = 0x51;

const IDENT: u16 = 0x0328;

const STATUS_PLL1_LD: u8 = 0x01;
const STATUS_PLL2_LD: u8 = 0x02;

const PLL2_LOCK_TIMEOUT: Duration = Duration::from_millis(5);
const PLL1_LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(1);
const VCO_CAL_WAIT: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RefSel {
    Primary,
    Secondary,
}

/// Where output 7 (the BRC) is taken from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BrcSource {
    Bypass,
    Pll,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ResetKind {
    Hard,
    Soft,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RpllStatus {
    pub pll1_locked: bool,
    pub pll2_locked: bool,
    pub status_indicator: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RpllSettings {
    pub pll1_r: u8,
    pub pll1_n: u16,
    pub pll2_r: u8,
    pub pll2_n: u16,
    pub out7_div: u16,
    pub usr_div: u8,
}

/// Divider plans per supported (ref_rate, brc_rate, usr_clk_rate) tuple.
/// Both PLL domains run at 5 GHz.
pub fn lookup_settings(ref_rate: u64, brc_rate: u64, usr_clk_rate: u64) -> Result<RpllSettings> {
    match (ref_rate, brc_rate, usr_clk_rate) {
        (25_000_000, 25_000_000, 156_250_000) => Ok(RpllSettings {
            pll1_r: 1,
            pll1_n: 200,
            pll2_r: 1,
            pll2_n: 200,
            out7_div: 200,
            usr_div: 32,
        }),
        (10_000_000, 25_000_000, 156_250_000) => Ok(RpllSettings {
            pll1_r: 1,
            pll1_n: 500,
            pll2_r: 1,
            pll2_n: 500,
            out7_div: 200,
            usr_div: 32,
        }),
        _ => Err(Error::InvalidArgument(format!(
            "unsupported RPLL configuration: ref {} Hz, BRC {} Hz, usr {} Hz",
            ref_rate, brc_rate, usr_clk_rate
        ))),
    }
}

type HardResetHook = Box<dyn Fn(bool) -> Result<()> + Send>;

pub struct Rpll {
    chip: Box<dyn ChipInterface>,
    hard_reset: Option<HardResetHook>,
}

impl Rpll {
    pub fn new(chip: Box<dyn ChipInterface>, hard_reset: Option<HardResetHook>) -> Rpll {
        Rpll { chip, hard_reset }
    }

    pub fn init(&self) -> Result<()> {
        self.reset(ResetKind::Soft, true)?;
        thread::sleep(Duration::from_millis(1));
        self.reset(ResetKind::Soft, false)?;
        let ident =
            ((self.chip.peek8(REG_ID_HI)? as u16) << 8) | self.chip.peek8(REG_ID_LO)? as u16;
        if ident != IDENT {
            return Err(Error::DeviceNotFound(format!(
                "RPLL reports ident 0x{:04x}, expected 0x{:04x}",
                ident, IDENT
            )));
        }
        self.enable_4wire_readback()?;
        debug!("RPLL initialized");
        Ok(())
    }

    pub fn reset(&self, kind: ResetKind, value: bool) -> Result<()> {
        match kind {
            ResetKind::Soft => self.chip.poke8(REG_RESET, if value { 0x80 } else { 0x00 }),
            ResetKind::Hard => match &self.hard_reset {
                Some(hook) => hook(value),
                None => Err(Error::InvalidArgument(
                    "RPLL has no hard reset line".into(),
                )),
            },
        }
    }

    /// Routes the status/readback mux so register reads reflect chip state.
    pub fn enable_4wire_readback(&self) -> Result<()> {
        self.chip.poke8(REG_READBACK_EN, 0x01)
    }

    pub fn config(
        &self,
        ref_sel: RefSel,
        ref_rate: u64,
        brc_rate: u64,
        usr_clk_rate: u64,
        brc_src: BrcSource,
    ) -> Result<()> {
        let s = lookup_settings(ref_rate, brc_rate, usr_clk_rate)?;
        info!(
            "configuring RPLL: ref {:?} at {} Hz, BRC {} Hz from {:?}",
            ref_sel, ref_rate, brc_rate, brc_src
        );

        self.chip.poke8(
            REG_IN_SEL,
            match ref_sel {
                RefSel::Primary => 0x00,
                RefSel::Secondary => 0x01,
            },
        )?;
        self.chip.poke8(REG_PLL1_R, s.pll1_r)?;
        self.chip.poke8(REG_PLL1_N_HI, (s.pll1_n >> 8) as u8)?;
        self.chip.poke8(REG_PLL1_N_LO, s.pll1_n as u8)?;
        self.chip.poke8(REG_PLL2_R, s.pll2_r)?;
        self.chip.poke8(REG_PLL2_N_HI, (s.pll2_n >> 8) as u8)?;
        self.chip.poke8(REG_PLL2_N_LO, s.pll2_n as u8)?;
        match brc_src {
            BrcSource::Bypass => {
                self.chip.poke8(REG_OUT7_MUX, 0x01)?;
                self.chip.poke8(REG_OUT7_DIV_HI, 0)?;
                self.chip.poke8(REG_OUT7_DIV_LO, 1)?;
            }
            BrcSource::Pll => {
                self.chip.poke8(REG_OUT7_MUX, 0x00)?;
                self.chip.poke8(REG_OUT7_DIV_HI, (s.out7_div >> 8) as u8)?;
                self.chip.poke8(REG_OUT7_DIV_LO, s.out7_div as u8)?;
            }
        }
        self.chip.poke8(REG_USR_DIV, s.usr_div)?;

        self.chip.poke8(REG_VCO_CAL, 0x01)?;
        thread::sleep(VCO_CAL_WAIT);

        wait_for(
            || Ok(self.get_status()?.pll2_locked),
            PLL2_LOCK_TIMEOUT,
            LOCK_POLL_INTERVAL,
            "RPLL PLL2",
        )?;
        wait_for(
            || Ok(self.get_status()?.pll1_locked),
            PLL1_LOCK_TIMEOUT,
            LOCK_POLL_INTERVAL,
            "RPLL PLL1",
        )?;
        info!("RPLL locked");
        Ok(())
    }

    pub fn get_status(&self) -> Result<RpllStatus> {
        let status = self.chip.peek8(REG_STATUS)?;
        Ok(RpllStatus {
            pll1_locked: status & STATUS_PLL1_LD != 0,
            pll2_locked: status & STATUS_PLL2_LD != 0,
            status_indicator: status >> 4,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    struct FakeChip {
        regs: Mutex<HashMap<u16, u8>>,
        locks_after_cal: bool,
    }

    impl FakeChip {
        fn new(locks_after_cal: bool) -> Arc<FakeChip> {
            let mut regs = HashMap::new();
            regs.insert(REG_ID_HI, (IDENT >> 8) as u8);
            regs.insert(REG_ID_LO, IDENT as u8);
            Arc::new(FakeChip {
                regs: Mutex::new(regs),
                locks_after_cal,
            })
        }
    }

    impl ChipInterface for Arc<FakeChip> {
        fn peek8(&self, addr: u16) -> Result<u8> {
            Ok(*self.regs.lock().unwrap().get(&addr).unwrap_or(&0))
        }

        fn poke8(&self, addr: u16, value: u8) -> Result<()> {
            let mut regs = self.regs.lock().unwrap();
            regs.insert(addr, value);
            if addr == REG_VCO_CAL && self.locks_after_cal {
                regs.insert(REG_STATUS, STATUS_PLL1_LD | STATUS_PLL2_LD);
            }
            Ok(())
        }
    }

    #[test]
    fn config_writes_divider_plan_and_locks() {
        let chip = FakeChip::new(true);
        let rpll = Rpll::new(Box::new(chip.clone()), None);
        rpll.init().unwrap();
        rpll.config(
            RefSel::Primary,
            25_000_000,
            25_000_000,
            156_250_000,
            BrcSource::Pll,
        )
        .unwrap();
        let regs = chip.regs.lock().unwrap();
        assert_eq!(regs[&REG_PLL1_N_HI], 0);
        assert_eq!(regs[&REG_PLL1_N_LO], 200);
        assert_eq!(regs[&REG_OUT7_MUX], 0x00);
        assert_eq!(
            ((regs[&REG_OUT7_DIV_HI] as u16) << 8) | regs[&REG_OUT7_DIV_LO] as u16,
            200
        );
        drop(regs);
        let status = rpll.get_status().unwrap();
        assert!(status.pll1_locked && status.pll2_locked);
    }

    #[test]
    fn bypass_routes_out7_around_the_pll() {
        let chip = FakeChip::new(true);
        let rpll = Rpll::new(Box::new(chip.clone()), None);
        rpll.config(
            RefSel::Primary,
            25_000_000,
            25_000_000,
            156_250_000,
            BrcSource::Bypass,
        )
        .unwrap();
        let regs = chip.regs.lock().unwrap();
        assert_eq!(regs[&REG_OUT7_MUX], 0x01);
        assert_eq!(regs[&REG_OUT7_DIV_LO], 1);
    }

    #[test]
    fn unsupported_tuple_is_rejected() {
        let chip = FakeChip::new(true);
        let rpll = Rpll::new(Box::new(chip.clone()), None);
        match rpll.config(
            RefSel::Primary,
            13_000_000,
            25_000_000,
            156_250_000,
            BrcSource::Pll,
        ) {
            Err(Error::InvalidArgument(_)) => (),
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }

    #[test]
    fn config_fails_within_budget_when_pll2_never_locks() {
        let chip = FakeChip::new(false);
        let rpll = Rpll::new(Box::new(chip.clone()), None);
        let start = Instant::now();
        match rpll.config(
            RefSel::Primary,
            25_000_000,
            25_000_000,
            156_250_000,
            BrcSource::Pll,
        ) {
            Err(Error::LockTimeout(_)) => (),
            other => panic!("expected LockTimeout, got {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
