//! Sample-PLL driver.
//!
//! The SPLL multiplies the BRC up to the converter rate and distributes the
//! PRC to the daughterboards. The divider plan is computed elsewhere; this
//! driver sequences the register writes, runs VCO calibration and waits for
//! lock.

use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::regs::ChipInterface;
use crate::rpll::ResetKind;
use crate::{wait_for, Error, Result};

const REG_RESET: u16 = 0x0000;
const REG_4WIRE_EN: u16 = 0x0002;
const REG_ID_HI: u16 = 0x0003;
const REG_ID_LO: u16 = 0x0004;

// CLKout pair k occupies an 8-register stride.
const REG_CLKOUT_BASE: u16 = 0x0100;
const CLKOUT_STRIDE: u16 = 8;
const CLKOUT_DIV_HI: u16 = 0;
const CLKOUT_DIV_LO: u16 = 1;
const CLKOUT_SYSREF_MUX: u16 = 2;

const REG_PLL1_R_HI: u16 = 0x0200;
const REG_PLL1_R_LO: u16 = 0x0201;
const REG_PLL1_N_HI: u16 = 0x0202;
const REG_PLL1_N_LO: u16 = 0x0203;
const REG_PLL2_R_HI: u16 = 0x0210;
const REG_PLL2_R_LO: u16 = 0x0211;
const REG_PLL2_PRESCALER: u16 = 0x0212;
const REG_PLL2_N_HI: u16 = 0x0213;
const REG_PLL2_N_LO: u16 = 0x0214;
const REG_SYSREF_DIV_HI: u16 = 0x0220;
const REG_SYSREF_DIV_LO: u16 = 0x0221;
const REG_LEGACY_MODE: u16 = 0x0225;
const REG_VCO_CAL: u16 = 0x0230;
const REG_SYSREF_GLOBAL_MUX: u16 = 0x0240;
const REG_STATUS: u16 = 0x0250;

const IDENT: u16 = 0x6004;

const STATUS_PLL1_LD: u8 = 0x01;
const STATUS_PLL2_LD: u8 = 0x02;
const STATUS_SYNC_DONE: u8 = 0x04;

const SYSREF_MUX_NORMAL: u8 = 0x00;
const SYSREF_MUX_PULSER: u8 = 0x01;

const PLL2_LOCK_TIMEOUT: Duration = Duration::from_millis(5);
const PLL1_LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const SYNC_DONE_TIMEOUT: Duration = Duration::from_secs(1);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(1);
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(10);
const VCO_CAL_WAIT: Duration = Duration::from_millis(5);

/// Number of CLKout divider pairs.
pub const NUM_CLKOUT_PAIRS: usize = 7;

/// Full SPLL divider plan, as produced by the clocking policy.
#[derive(Clone, Debug, PartialEq)]
pub struct SpllConfig {
    pub vcxo_freq: u64,
    /// Converter rate on the data-converter CLKout pairs.
    pub output_freq: u64,
    pub vco_freq: u64,
    /// PLL1 reference (the BRC).
    pub brc_freq: u64,
    pub pll1_r_div: u16,
    pub pll1_n_div: u16,
    pub pll2_r_div: u16,
    pub pll2_prescaler: u8,
    pub pll2_n_div: u16,
    pub sysref_div: u16,
    pub clkout_divs: [u16; NUM_CLKOUT_PAIRS],
    /// VCO divider feeding the PRC outputs.
    pub prc_div: u32,
    pub legacy_mode: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SpllStatus {
    pub pll1_locked: bool,
    pub pll2_locked: bool,
}

type HardResetHook = Box<dyn Fn(bool) -> Result<()> + Send>;

pub struct Spll {
    chip: Box<dyn ChipInterface>,
    hard_reset: Option<HardResetHook>,
}

impl Spll {
    pub fn new(chip: Box<dyn ChipInterface>, hard_reset: Option<HardResetHook>) -> Spll {
        Spll { chip, hard_reset }
    }

    pub fn init(&self) -> Result<()> {
        self.reset(ResetKind::Soft, true)?;
        thread::sleep(Duration::from_millis(1));
        self.reset(ResetKind::Soft, false)?;
        // Reads return garbage until the readback path is enabled.
        self.enable_4wire_readback()?;
        let ident =
            ((self.chip.peek8(REG_ID_HI)? as u16) << 8) | self.chip.peek8(REG_ID_LO)? as u16;
        if ident != IDENT {
            return Err(Error::DeviceNotFound(format!(
                "SPLL reports ident 0x{:04x}, expected 0x{:04x}",
                ident, IDENT
            )));
        }
        debug!("SPLL initialized");
        Ok(())
    }

    pub fn reset(&self, kind: ResetKind, value: bool) -> Result<()> {
        match kind {
            ResetKind::Soft => self.chip.poke8(REG_RESET, if value { 0x80 } else { 0x00 }),
            ResetKind::Hard => match &self.hard_reset {
                Some(hook) => hook(value),
                None => Err(Error::InvalidArgument("SPLL has no hard reset line".into())),
            },
        }
    }

    pub fn enable_4wire_readback(&self) -> Result<()> {
        self.chip.poke8(REG_4WIRE_EN, 0x01)
    }

    pub fn config(&self, cfg: &SpllConfig) -> Result<()> {
        info!(
            "configuring SPLL: VCXO {} Hz, VCO {} Hz, output {} Hz, BRC {} Hz",
            cfg.vcxo_freq, cfg.vco_freq, cfg.output_freq, cfg.brc_freq
        );

        // CLKout block.
        for (k, div) in cfg.clkout_divs.iter().enumerate() {
            let base = REG_CLKOUT_BASE + k as u16 * CLKOUT_STRIDE;
            self.chip.poke8(base + CLKOUT_DIV_HI, (div >> 8) as u8)?;
            self.chip.poke8(base + CLKOUT_DIV_LO, *div as u8)?;
            self.chip.poke8(base + CLKOUT_SYSREF_MUX, SYSREF_MUX_NORMAL)?;
        }

        // PLL block.
        self.chip.poke8(REG_PLL1_R_HI, (cfg.pll1_r_div >> 8) as u8)?;
        self.chip.poke8(REG_PLL1_R_LO, cfg.pll1_r_div as u8)?;
        self.chip.poke8(REG_PLL1_N_HI, (cfg.pll1_n_div >> 8) as u8)?;
        self.chip.poke8(REG_PLL1_N_LO, cfg.pll1_n_div as u8)?;
        self.chip.poke8(REG_PLL2_R_HI, (cfg.pll2_r_div >> 8) as u8)?;
        self.chip.poke8(REG_PLL2_R_LO, cfg.pll2_r_div as u8)?;
        self.chip.poke8(REG_PLL2_PRESCALER, cfg.pll2_prescaler)?;
        self.chip.poke8(REG_PLL2_N_HI, (cfg.pll2_n_div >> 8) as u8)?;
        self.chip.poke8(REG_PLL2_N_LO, cfg.pll2_n_div as u8)?;
        self.chip.poke8(REG_SYSREF_DIV_HI, (cfg.sysref_div >> 8) as u8)?;
        self.chip.poke8(REG_SYSREF_DIV_LO, cfg.sysref_div as u8)?;
        self.chip
            .poke8(REG_LEGACY_MODE, if cfg.legacy_mode { 0x01 } else { 0x00 })?;

        self.chip.poke8(REG_VCO_CAL, 0x01)?;
        thread::sleep(VCO_CAL_WAIT);

        wait_for(
            || Ok(self.get_status()?.pll2_locked),
            PLL2_LOCK_TIMEOUT,
            LOCK_POLL_INTERVAL,
            "SPLL PLL2",
        )?;
        wait_for(
            || Ok(self.get_status()?.pll1_locked),
            PLL1_LOCK_TIMEOUT,
            LOCK_POLL_INTERVAL,
            "SPLL PLL1",
        )?;
        info!("SPLL locked");
        Ok(())
    }

    /// Synchronizes the PLL1 R divider to an externally supplied pulse.
    ///
    /// SYSREF is temporarily routed through the pulser; `trigger` is expected
    /// to fire the board-level sync pulse while that routing is in place.
    pub fn pll1_r_divider_sync(&self, trigger: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.chip.poke8(REG_SYSREF_GLOBAL_MUX, SYSREF_MUX_PULSER)?;
        let armed = (|| {
            trigger()?;
            wait_for(
                || Ok(self.chip.peek8(REG_STATUS)? & STATUS_SYNC_DONE != 0),
                SYNC_DONE_TIMEOUT,
                SYNC_POLL_INTERVAL,
                "SPLL R divider sync",
            )
        })();
        // Restore normal SYSREF routing whether or not the sync completed.
        self.chip.poke8(REG_SYSREF_GLOBAL_MUX, SYSREF_MUX_NORMAL)?;
        armed?;
        info!("SPLL PLL1 R divider synchronized");
        Ok(())
    }

    pub fn get_status(&self) -> Result<SpllStatus> {
        let status = self.chip.peek8(REG_STATUS)?;
        Ok(SpllStatus {
            pll1_locked: status & STATUS_PLL1_LD != 0,
            pll2_locked: status & STATUS_PLL2_LD != 0,
        })
    }
}
