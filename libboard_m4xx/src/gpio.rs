//! Named GPIO banks layered on a 32-bit register.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::regs::RegisterInterface;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Direction {
    Input,
    Output,
}

/// A register worth of individually named pins.
///
/// Direction is fixed at construction; setting an input pin fails.
pub struct GpioBank {
    regs: Arc<dyn RegisterInterface>,
    addr: u32,
    pins: BTreeMap<String, (u8, Direction)>,
}

impl GpioBank {
    pub fn new(
        regs: Arc<dyn RegisterInterface>,
        addr: u32,
        pins: &[(&str, u8, Direction)],
    ) -> GpioBank {
        GpioBank {
            regs,
            addr,
            pins: pins
                .iter()
                .map(|(name, index, dir)| (name.to_string(), (*index, *dir)))
                .collect(),
        }
    }

    fn lookup(&self, name: &str) -> Result<(u8, Direction)> {
        self.pins
            .get(name)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown GPIO pin `{}`", name)))
    }

    pub fn set(&self, name: &str, value: bool) -> Result<()> {
        let (index, dir) = self.lookup(name)?;
        if dir != Direction::Output {
            return Err(Error::InvalidArgument(format!(
                "GPIO pin `{}` is an input",
                name
            )));
        }
        let current = self.regs.peek32(self.addr)?;
        let updated = if value {
            current | (1 << index)
        } else {
            current & !(1 << index)
        };
        self.regs.poke32(self.addr, updated)
    }

    pub fn get(&self, name: &str) -> Result<bool> {
        let (index, _) = self.lookup(name)?;
        Ok(self.regs.peek32(self.addr)? & (1 << index) != 0)
    }
}

/// A contiguous run of pins treated as one integer.
pub struct GpioGroup {
    regs: Arc<dyn RegisterInterface>,
    addr: u32,
    offset: u8,
    width: u8,
    input_mask: u32,
}

impl GpioGroup {
    /// `input_mask` selects, within the group, the pins whose direction is
    /// input; `get_all` reads only those.
    pub fn new(
        regs: Arc<dyn RegisterInterface>,
        addr: u32,
        offset: u8,
        width: u8,
        input_mask: u32,
    ) -> GpioGroup {
        debug_assert!(offset + width <= 32);
        GpioGroup {
            regs,
            addr,
            offset,
            width,
            input_mask,
        }
    }

    fn mask(&self) -> u32 {
        if self.width == 32 {
            0xffff_ffff
        } else {
            (1 << self.width) - 1
        }
    }

    pub fn set_all(&self, value: u32) -> Result<()> {
        let mask = self.mask() & !self.input_mask;
        let current = self.regs.peek32(self.addr)?;
        let updated =
            (current & !(mask << self.offset)) | ((value & mask) << self.offset);
        self.regs.poke32(self.addr, updated)
    }

    pub fn get_all(&self) -> Result<u32> {
        let value = self.regs.peek32(self.addr)? >> self.offset;
        Ok(value & self.mask() & self.input_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeRegs {
        words: Mutex<[u32; 4]>,
    }

    impl FakeRegs {
        fn new() -> Arc<FakeRegs> {
            Arc::new(FakeRegs {
                words: Mutex::new([0; 4]),
            })
        }
    }

    impl RegisterInterface for FakeRegs {
        fn peek32(&self, addr: u32) -> Result<u32> {
            Ok(self.words.lock().unwrap()[addr as usize / 4])
        }

        fn poke32(&self, addr: u32, value: u32) -> Result<()> {
            self.words.lock().unwrap()[addr as usize / 4] = value;
            Ok(())
        }
    }

    #[test]
    fn set_and_get_named_pins() {
        let regs = FakeRegs::new();
        let bank = GpioBank::new(
            regs.clone(),
            0x0,
            &[
                ("clk_sel", 0, Direction::Output),
                ("pll_status", 1, Direction::Input),
            ],
        );
        bank.set("clk_sel", true).unwrap();
        assert_eq!(regs.peek32(0).unwrap(), 0b01);
        assert_eq!(bank.get("clk_sel").unwrap(), true);
        bank.set("clk_sel", false).unwrap();
        assert_eq!(bank.get("clk_sel").unwrap(), false);
    }

    #[test]
    fn setting_an_input_pin_fails() {
        let bank = GpioBank::new(FakeRegs::new(), 0x0, &[("sense", 3, Direction::Input)]);
        assert!(bank.set("sense", true).is_err());
        assert!(bank.set("nonexistent", true).is_err());
    }

    #[test]
    fn group_reads_only_inputs() {
        let regs = FakeRegs::new();
        // Bits 4..8; bits 6 and 7 are inputs.
        let group = GpioGroup::new(regs.clone(), 0x4, 4, 4, 0b1100);
        group.set_all(0xf).unwrap();
        // Only the output bits took.
        assert_eq!(regs.peek32(4).unwrap(), 0b0011 << 4);
        regs.poke32(4, 0b1111 << 4).unwrap();
        assert_eq!(group.get_all().unwrap(), 0b1100);
    }
}
