//! Serial-in parallel-out shift register. Shifted data only appears on the
//! outputs after the caller pulses the associated latch trigger function.

use crate::Result;
use crate::bus::{Address, Bus};
use crate::sys::{BitOrder, SpiMode, SpiSettings};

pub const DEFAULT_SPI_SETTINGS: SpiSettings =
    SpiSettings::new(4_000_000, BitOrder::MsbFirst, SpiMode::Mode2);

#[derive(Debug, Clone, Copy)]
pub struct ShiftRegister {
    address: Address,
    settings: SpiSettings,
}

impl ShiftRegister {
    pub const fn new(address: Address) -> ShiftRegister {
        ShiftRegister { address, settings: DEFAULT_SPI_SETTINGS }
    }

    pub const fn with_settings(address: Address, settings: SpiSettings) -> ShiftRegister {
        ShiftRegister { address, settings }
    }

    pub fn write8(&self, bus: &mut Bus, data: u8) -> Result<()> {
        self.write_bytes(bus, &[data])
    }

    pub fn write16(&self, bus: &mut Bus, data: u16) -> Result<()> {
        self.write_bytes(bus, &data.to_be_bytes())
    }

    pub fn write32(&self, bus: &mut Bus, data: u32) -> Result<()> {
        self.write_bytes(bus, &data.to_be_bytes())
    }

    /// Arbitrary-width transfer for chained registers.
    pub fn write_bytes(&self, bus: &mut Bus, data: &[u8]) -> Result<()> {
        bus.address(self.address)?;
        bus.write_bytes(self.settings, data)?;
        bus.deactivate()
    }
}
