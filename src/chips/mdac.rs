//! 12-bit multiplying DAC, one per coefficient lane.

use crate::Result;
use crate::bus::{Address, Bus};
use crate::sys::{BitOrder, SpiMode, SpiSettings};

pub const DEFAULT_SPI_SETTINGS: SpiSettings =
    SpiSettings::new(4_000_000, BitOrder::MsbFirst, SpiMode::Mode1);

/// Raw code for a scale of zero, before the 2-bit shift.
pub const RAW_ZERO: u16 = 2047;

/// Minimum chip-select-to-data delay required by the chip.
const CS_TO_DATA_NS: u32 = 15;

#[derive(Debug, Clone, Copy)]
pub struct Mdac12 {
    address: Address,
}

impl Mdac12 {
    pub const fn new(address: Address) -> Mdac12 {
        Mdac12 { address }
    }

    /// Convert a scale in [-2, +2] to the 16-bit word the chip expects.
    /// The 12-bit code occupies bits 13..2.
    pub fn float_to_raw(scale: f32) -> u16 {
        let code = (scale * 1024.0 + 2047.0).clamp(0.0, 4095.0) as u16;
        code << 2
    }

    pub fn raw_to_float(raw: u16) -> f32 {
        ((raw >> 2) as f32 - RAW_ZERO as f32) / 1024.0
    }

    pub fn set_scale_raw(&self, bus: &mut Bus, raw: u16) -> Result<()> {
        bus.address(self.address)?;
        bus.delay_ns(CS_TO_DATA_NS);
        bus.transfer16(DEFAULT_SPI_SETTINGS, raw)?;
        bus.deactivate()
    }

    pub fn set_scale(&self, bus: &mut Bus, scale: f32) -> Result<()> {
        self.set_scale_raw(bus, Self::float_to_raw(scale))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_float_to_raw_zero() {
        assert_eq!(Mdac12::float_to_raw(0.0), RAW_ZERO << 2);
    }

    #[test]
    fn test_float_to_raw_clamps() {
        assert_eq!(Mdac12::float_to_raw(-3.0), 0);
        assert_eq!(Mdac12::float_to_raw(3.0), 4095 << 2);
    }

    #[test]
    fn test_float_to_raw_one() {
        assert_eq!(Mdac12::float_to_raw(1.0), (1024 + 2047) << 2);
        assert_eq!(Mdac12::float_to_raw(-1.0), (2047 - 1024) << 2);
    }

    #[test]
    fn test_raw_round_trip() {
        for scale in [-2.0f32, -1.0, -0.5, 0.0, 0.25, 1.0, 1.999] {
            let round_tripped = Mdac12::raw_to_float(Mdac12::float_to_raw(scale));
            assert!((round_tripped - scale).abs() < 1.0 / 1024.0);
        }
    }
}
