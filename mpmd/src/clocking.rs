//! Clock manager.
//!
//! Owns the RPLL and SPLL drivers, the CPLD clock controls and the FPGA
//! MMCM, and turns a computed clock plan into hardware state. A plan is
//! installed atomically: if any PLL misses lock the previous plan is put
//! back and the error is reported.

use std::sync::Arc;
use std::time::Duration;

use libboard_m4xx::gpio::{Direction, GpioBank};
use libboard_m4xx::mboard::{MboardRegs, NUM_MMCM_OUTPUTS};
use libboard_m4xx::regs::RegisterInterface;
use libboard_m4xx::rpll::{BrcSource, RefSel, Rpll};
use libboard_m4xx::spll::{Spll, SpllConfig};
use libboard_m4xx::{wait_for, Error, Result};
use log::{info, warn};

use crate::clock_policy::ClockPlan;

const REG_CPLD_RESET: u32 = 0x0000;
const REG_CPLD_CLOCK_EN: u32 = 0x0004;
const REG_CPLD_BRC_SEL: u32 = 0x0008;

const CPLD_RESET_CPLD: u32 = 1 << 0;
const CPLD_RESET_SPLL: u32 = 1 << 1;
const CPLD_RESET_RPLL: u32 = 1 << 2;

const MMCM_LOCK_TIMEOUT: Duration = Duration::from_millis(100);
const MMCM_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Reference inputs selectable on this motherboard, with their expected
/// input rates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RefSource {
    Internal,
    External,
    Gpsdo,
    NsyncAux,
    Sfp(u8),
}

impl RefSource {
    pub fn from_name(name: &str) -> Result<RefSource> {
        match name {
            "internal" => Ok(RefSource::Internal),
            "external" => Ok(RefSource::External),
            "gpsdo" => Ok(RefSource::Gpsdo),
            "nsync_aux" => Ok(RefSource::NsyncAux),
            "sfp0" => Ok(RefSource::Sfp(0)),
            "sfp1" => Ok(RefSource::Sfp(1)),
            _ => Err(Error::InvalidArgument(format!(
                "unknown clock source `{}`",
                name
            ))),
        }
    }

    pub fn name(&self) -> String {
        match self {
            RefSource::Internal => "internal".to_string(),
            RefSource::External => "external".to_string(),
            RefSource::Gpsdo => "gpsdo".to_string(),
            RefSource::NsyncAux => "nsync_aux".to_string(),
            RefSource::Sfp(n) => format!("sfp{}", n),
        }
    }

    /// Expected input rate of this reference.
    pub fn rate(&self) -> u64 {
        match self {
            RefSource::Internal => 25_000_000,
            RefSource::NsyncAux => 25_000_000,
            RefSource::External | RefSource::Gpsdo | RefSource::Sfp(_) => 10_000_000,
        }
    }

    fn rpll_input(&self) -> RefSel {
        match self {
            RefSource::Internal => RefSel::Primary,
            _ => RefSel::Secondary,
        }
    }
}

/// PPS inputs usable for timekeeper alignment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PpsSource {
    Internal,
    External,
    Gpsdo,
}

impl PpsSource {
    pub fn from_name(name: &str) -> Result<PpsSource> {
        match name {
            "internal" => Ok(PpsSource::Internal),
            "external" => Ok(PpsSource::External),
            "gpsdo" => Ok(PpsSource::Gpsdo),
            _ => Err(Error::InvalidArgument(format!(
                "unknown time source `{}`",
                name
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PpsSource::Internal => "internal",
            PpsSource::External => "external",
            PpsSource::Gpsdo => "gpsdo",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClockChip {
    Cpld,
    Spll,
    Rpll,
}

/// Position of the GaAs switch feeding the SPLL reference input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BrcSelect {
    Rpll,
    ClockAux,
}

// PPS-select codes per (reference rate, PPS source).
fn pps_select_bits(ref_rate: u64, pps_source: PpsSource) -> Result<u8> {
    match (ref_rate, pps_source) {
        (10_000_000, PpsSource::Internal) => Ok(0x0),
        (10_000_000, PpsSource::External) => Ok(0x1),
        (10_000_000, PpsSource::Gpsdo) => Ok(0x2),
        (25_000_000, PpsSource::Internal) => Ok(0x4),
        (25_000_000, PpsSource::External) => Ok(0x5),
        _ => Err(Error::InvalidArgument(format!(
            "no PPS select code for {} Hz reference with {} PPS",
            ref_rate,
            pps_source.name()
        ))),
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

pub struct ClockManager {
    rpll: Rpll,
    spll: Spll,
    mb: Arc<MboardRegs>,
    cpld: Arc<dyn RegisterInterface>,
    brc_select: GpioBank,
    ref_source: RefSource,
    current_plan: Option<ClockPlan>,
}

impl ClockManager {
    pub fn new(
        rpll: Rpll,
        spll: Spll,
        mb: Arc<MboardRegs>,
        cpld: Arc<dyn RegisterInterface>,
    ) -> ClockManager {
        let brc_select = GpioBank::new(
            cpld.clone(),
            REG_CPLD_BRC_SEL,
            &[("brc_select", 0, Direction::Output)],
        );
        ClockManager {
            rpll,
            spll,
            mb,
            cpld,
            brc_select,
            ref_source: RefSource::Internal,
            current_plan: None,
        }
    }

    pub fn init(&self) -> Result<()> {
        self.cpld.poke32(REG_CPLD_CLOCK_EN, 1)?;
        self.rpll.init()?;
        self.spll.init()
    }

    pub fn ref_source(&self) -> RefSource {
        self.ref_source
    }

    pub fn current_plan(&self) -> Option<&ClockPlan> {
        self.current_plan.as_ref()
    }

    /// Asserts or releases one of the clock-chip resets. Does not re-run
    /// bring-up.
    pub fn reset_clock(&self, value: bool, which: ClockChip) -> Result<()> {
        let mask = match which {
            ClockChip::Cpld => CPLD_RESET_CPLD,
            ClockChip::Spll => CPLD_RESET_SPLL,
            ClockChip::Rpll => CPLD_RESET_RPLL,
        };
        let current = self.cpld.peek32(REG_CPLD_RESET)?;
        let updated = if value { current | mask } else { current & !mask };
        self.cpld.poke32(REG_CPLD_RESET, updated)
    }

    pub fn config_rpll(
        &self,
        ref_src: RefSel,
        ref_rate: u64,
        internal_brc_rate: u64,
        usr_clk_rate: u64,
    ) -> Result<()> {
        let brc_src = if ref_src == RefSel::Primary && ref_rate == internal_brc_rate {
            BrcSource::Bypass
        } else {
            BrcSource::Pll
        };
        self.rpll
            .config(ref_src, ref_rate, internal_brc_rate, usr_clk_rate, brc_src)
    }

    pub fn config_spll(&self, cfg: &SpllConfig) -> Result<()> {
        self.spll.config(cfg)
    }

    pub fn select_brc_source(&self, select: BrcSelect) -> Result<()> {
        self.brc_select
            .set("brc_select", select == BrcSelect::ClockAux)
    }

    /// Selects the base reference and reprograms the RPLL accordingly.
    pub fn set_ref_source(&mut self, source: RefSource) -> Result<()> {
        info!("switching reference source to {}", source.name());
        self.select_brc_source(match source {
            RefSource::NsyncAux => BrcSelect::ClockAux,
            _ => BrcSelect::Rpll,
        })?;
        self.config_rpll(source.rpll_input(), source.rate(), 25_000_000, 156_250_000)?;
        self.ref_source = source;
        Ok(())
    }

    /// Aligns the SPLL PLL1 R divider to the selected PPS.
    pub fn sync_spll_clocks(&self, pps_source: PpsSource, ref_rate: u64) -> Result<()> {
        let bits = pps_select_bits(ref_rate, pps_source)?;
        let mb = self.mb.clone();
        self.spll
            .pll1_r_divider_sync(&mut || mb.pulse_pll_sync_trigger(bits))
    }

    /// Programs PPS forwarding into the radio clock domain.
    ///
    /// The forwarded edge must land on a common BRC/PRC edge no later than
    /// `delay` seconds (0 < delay <= 1) after the PPS.
    pub fn configure_pps_forwarding(
        &self,
        tk: u32,
        enable: bool,
        radio_clock_rate: u64,
        delay: f64,
    ) -> Result<()> {
        if !enable {
            return self.mb.set_pps_forwarding(tk, false, 0);
        }
        if !(delay > 0.0 && delay <= 1.0) {
            return Err(Error::InvalidArgument(format!(
                "PPS forwarding delay {} outside (0, 1]",
                delay
            )));
        }
        let plan = self.current_plan.as_ref().ok_or_else(|| {
            Error::InvalidArgument("no clock plan installed".to_string())
        })?;
        let align_hz = gcd(plan.spll.brc_freq, plan.prc_rate);
        let edges = (delay * align_hz as f64).floor() as u64;
        if edges == 0 {
            return Err(Error::InvalidArgument(format!(
                "no aligned BRC/PRC edge within {} s of the PPS",
                delay
            )));
        }
        let cycles = edges * radio_clock_rate / align_hz;
        info!(
            "PPS forwarding on timekeeper {}: {} radio cycles after PPS",
            tk, cycles
        );
        self.mb.set_pps_forwarding(tk, true, cycles as u32)
    }

    pub fn get_ref_locked(&self) -> Result<bool> {
        let rpll = self.rpll.get_status()?;
        let spll = self.spll.get_status()?;
        Ok(rpll.pll1_locked && rpll.pll2_locked && spll.pll1_locked && spll.pll2_locked)
    }

    fn apply(&self, plan: &ClockPlan) -> Result<()> {
        // Quiesce the downstream clocks while the tree retunes.
        self.mb.set_data_clk_gate(false)?;
        self.mb.set_prc_gate(false)?;
        self.mb.set_mmcm_reset(true)?;

        self.config_spll(&plan.spll)?;

        if !plan.mmcm.use_defaults {
            let mut divs = [0u32; NUM_MMCM_OUTPUTS];
            for (slot, name) in [
                "r0_clk",
                "r1_clk",
                "data_clk",
                "data_clk_2x",
                "rfdc_clk",
                "rfdc_clk_2x",
            ]
            .iter()
            .enumerate()
            {
                divs[slot] = plan.mmcm.output_divs.get(*name).copied().unwrap_or(0);
            }
            self.mb.write_mmcm_dividers(plan.mmcm.fb_div, &divs)?;
        }

        self.mb.set_mmcm_reset(false)?;
        self.mb.set_prc_gate(true)?;
        wait_for(
            || self.mb.mmcm_locked(),
            MMCM_LOCK_TIMEOUT,
            MMCM_POLL_INTERVAL,
            "MMCM",
        )?;
        self.mb.set_data_clk_gate(true)?;
        Ok(())
    }

    /// Installs `plan`. On failure the previous plan is re-applied and the
    /// original error is returned.
    pub fn reconfigure(&mut self, plan: ClockPlan) -> Result<()> {
        match self.apply(&plan) {
            Ok(()) => {
                info!(
                    "clock plan installed: converter {} Hz, PRC {} Hz",
                    plan.spll.output_freq, plan.prc_rate
                );
                self.current_plan = Some(plan);
                Ok(())
            }
            Err(error) => {
                warn!("clock plan rejected: {}", error);
                if let Some(previous) = self.current_plan.clone() {
                    if let Err(revert_error) = self.apply(&previous) {
                        warn!("could not reinstate previous plan: {}", revert_error);
                    }
                }
                Err(error)
            }
        }
    }
}
