//! Motherboard register window: identity, clocking control and the PPS
//! plumbing shared by the clock manager and the timekeepers.

use std::sync::Arc;

use log::debug;

use crate::regs::RegisterInterface;
use crate::{Error, Result};

const REG_COMPAT_NUM: u32 = 0x0000;
const REG_DATESTAMP: u32 = 0x0004;
const REG_GIT_HASH: u32 = 0x0008;
const REG_SCRATCH: u32 = 0x000c;
const REG_DEVICE_ID: u32 = 0x0010;
const REG_RFNOC_INFO: u32 = 0x0014;
const REG_NUM_TIMEKEEPERS: u32 = 0x0018;
const REG_CLOCK_CTRL: u32 = 0x001c;
const REG_CLOCK_STATUS: u32 = 0x0020;
const REG_PLL_SYNC_CTRL: u32 = 0x0024;
const REG_MMCM_FB_DIV: u32 = 0x0030;
const REG_MMCM_DIV_BASE: u32 = 0x0034;
const REG_PPS_FWD_BASE: u32 = 0x0060;

const CLOCK_CTRL_MMCM_RESET: u32 = 1 << 0;
const CLOCK_CTRL_PRC_GATE: u32 = 1 << 1;
const CLOCK_CTRL_DATA_CLK_GATE: u32 = 1 << 2;

const CLOCK_STATUS_MMCM_LOCKED: u32 = 1 << 0;

const PLL_SYNC_TRIGGER: u32 = 1 << 8;

const PPS_FWD_ENABLE: u32 = 1 << 31;

/// Number of MMCM output divider registers.
pub const NUM_MMCM_OUTPUTS: usize = 6;

pub struct MboardRegs {
    regs: Arc<dyn RegisterInterface>,
}

impl MboardRegs {
    pub fn new(regs: Arc<dyn RegisterInterface>) -> MboardRegs {
        MboardRegs { regs }
    }

    /// Verifies the scratch register is read/writable before anything else
    /// trusts the window.
    pub fn selftest(&self) -> Result<()> {
        for pattern in &[0x1234_5678u32, 0xdead_beef, 0x0000_0000] {
            self.regs.poke32(REG_SCRATCH, *pattern)?;
            let readback = self.regs.peek32(REG_SCRATCH)?;
            if readback != *pattern {
                return Err(Error::Io(format!(
                    "scratch readback mismatch: wrote 0x{:08x}, read 0x{:08x}",
                    pattern, readback
                )));
            }
        }
        debug!("scratch selftest passed");
        Ok(())
    }

    pub fn get_compat_number(&self) -> Result<(u16, u16)> {
        let compat = self.regs.peek32(REG_COMPAT_NUM)?;
        Ok(((compat >> 16) as u16, compat as u16))
    }

    /// FPGA build date, ISO 8601.
    ///
    /// Datestamp packing: bits [31:20] year-2000, [19:16] month, [15:11] day,
    /// [10:6] hour, [5:0] minute.
    pub fn get_build_timestamp(&self) -> Result<String> {
        let raw = self.regs.peek32(REG_DATESTAMP)?;
        if raw == 0 {
            return Ok(String::new());
        }
        Ok(format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:00Z",
            2000 + (raw >> 20),
            (raw >> 16) & 0xf,
            (raw >> 11) & 0x1f,
            (raw >> 6) & 0x1f,
            raw & 0x3f
        ))
    }

    /// Short git hash of the FPGA image plus its dirty flag.
    pub fn get_git_hash(&self) -> Result<(String, bool)> {
        let raw = self.regs.peek32(REG_GIT_HASH)?;
        let dirty = raw >> 28 == 0xf;
        Ok((format!("{:07x}", raw & 0x0fff_ffff), dirty))
    }

    pub fn get_device_id(&self) -> Result<u16> {
        Ok(self.regs.peek32(REG_DEVICE_ID)? as u16)
    }

    pub fn set_device_id(&self, device_id: u16) -> Result<()> {
        self.regs.poke32(REG_DEVICE_ID, device_id as u32)
    }

    pub fn get_proto_ver(&self) -> Result<u16> {
        Ok(self.regs.peek32(REG_RFNOC_INFO)? as u16)
    }

    pub fn get_chdr_width(&self) -> Result<u16> {
        Ok((self.regs.peek32(REG_RFNOC_INFO)? >> 16) as u16)
    }

    pub fn get_num_timekeepers(&self) -> Result<u32> {
        self.regs.peek32(REG_NUM_TIMEKEEPERS)
    }

    fn modify_clock_ctrl(&self, mask: u32, value: bool) -> Result<()> {
        let current = self.regs.peek32(REG_CLOCK_CTRL)?;
        let updated = if value { current | mask } else { current & !mask };
        self.regs.poke32(REG_CLOCK_CTRL, updated)
    }

    pub fn set_mmcm_reset(&self, value: bool) -> Result<()> {
        self.modify_clock_ctrl(CLOCK_CTRL_MMCM_RESET, value)
    }

    pub fn set_prc_gate(&self, enable: bool) -> Result<()> {
        self.modify_clock_ctrl(CLOCK_CTRL_PRC_GATE, enable)
    }

    pub fn set_data_clk_gate(&self, enable: bool) -> Result<()> {
        self.modify_clock_ctrl(CLOCK_CTRL_DATA_CLK_GATE, enable)
    }

    pub fn mmcm_locked(&self) -> Result<bool> {
        Ok(self.regs.peek32(REG_CLOCK_STATUS)? & CLOCK_STATUS_MMCM_LOCKED != 0)
    }

    pub fn write_mmcm_dividers(&self, fb_div: u32, out_divs: &[u32; NUM_MMCM_OUTPUTS]) -> Result<()> {
        self.regs.poke32(REG_MMCM_FB_DIV, fb_div)?;
        for (k, div) in out_divs.iter().enumerate() {
            self.regs.poke32(REG_MMCM_DIV_BASE + 4 * k as u32, *div)?;
        }
        Ok(())
    }

    /// Fires the PLL sync pulse with the given PPS-select bits.
    pub fn pulse_pll_sync_trigger(&self, pps_sel: u8) -> Result<()> {
        self.regs
            .poke32(REG_PLL_SYNC_CTRL, pps_sel as u32 | PLL_SYNC_TRIGGER)?;
        self.regs.poke32(REG_PLL_SYNC_CTRL, pps_sel as u32)
    }

    pub fn set_pps_forwarding(&self, tk: u32, enable: bool, delay_cycles: u32) -> Result<()> {
        let word = if enable {
            PPS_FWD_ENABLE | (delay_cycles & !PPS_FWD_ENABLE)
        } else {
            0
        };
        self.regs.poke32(REG_PPS_FWD_BASE + 4 * tk, word)
    }
}
