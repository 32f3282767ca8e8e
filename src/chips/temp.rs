//! Board temperature sensor, 14-bit signed readout.

use crate::Result;
use crate::bus::{Address, Bus};
use crate::sys::{BitOrder, SpiMode, SpiSettings};

pub const DEFAULT_SPI_SETTINGS: SpiSettings =
    SpiSettings::new(4_000_000, BitOrder::MsbFirst, SpiMode::Mode0);

const CELSIUS_PER_LSB: f32 = 0.03125;

#[derive(Debug, Clone, Copy)]
pub struct Tmp127 {
    address: Address,
}

impl Tmp127 {
    pub const fn new(address: Address) -> Tmp127 {
        Tmp127 { address }
    }

    /// The two low bits of the 16-bit word are always set; an arithmetic
    /// right shift drops them while keeping the sign.
    pub fn raw_to_signed(raw: u16) -> i16 {
        (raw as i16) >> 2
    }

    pub fn raw_to_celsius(raw: u16) -> f32 {
        Self::raw_to_signed(raw) as f32 * CELSIUS_PER_LSB
    }

    pub fn read_temperature(&self, bus: &mut Bus) -> Result<f32> {
        bus.address(self.address)?;
        let raw = bus.transfer16(DEFAULT_SPI_SETTINGS, 0)?;
        bus.deactivate()?;
        Ok(Self::raw_to_celsius(raw))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_positive_temperature() {
        // 25 degC = 800 LSB, low bits set on the wire.
        let raw = (800u16 << 2) | 0b11;
        assert_eq!(Tmp127::raw_to_signed(raw), 800);
        assert_eq!(Tmp127::raw_to_celsius(raw), 25.0);
    }

    #[test]
    fn test_negative_temperature() {
        // -40 degC = -1280 LSB.
        let raw = ((-1280i16 << 2) as u16) | 0b11;
        assert_eq!(Tmp127::raw_to_signed(raw), -1280);
        assert_eq!(Tmp127::raw_to_celsius(raw), -40.0);
    }

    #[test]
    fn test_zero() {
        assert_eq!(Tmp127::raw_to_celsius(0b11), 0.0);
    }
}
