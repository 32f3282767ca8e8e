//! 8-channel 12-bit DAC used for integrator initial conditions and
//! multiplier trims. Register writes are 24-bit frames of
//! `(register, u16 value)`; readback shifts the answer out during a
//! follow-up no-op frame.

use crate::Result;
use crate::bus::{Address, Bus};
use crate::sys::{BitOrder, SpiMode, SpiSettings};

pub const DEFAULT_SPI_SETTINGS: SpiSettings =
    SpiSettings::new(4_000_000, BitOrder::MsbFirst, SpiMode::Mode1);

pub const REG_NOOP: u8 = 0;
pub const REG_DEVICE_ID: u8 = 1;
pub const REG_SYNC: u8 = 2;
pub const REG_CONFIG: u8 = 3;
pub const REG_GAIN: u8 = 4;
pub const REG_TRIGGER: u8 = 5;
pub const REG_BROADCAST: u8 = 6;
pub const REG_STATUS: u8 = 7;

pub const fn reg_dac(channel: u8) -> u8 {
    8 + channel
}

/// Read flag ORed into the register address for readback frames.
const READ_FLAG: u8 = 0x80;

/// CONFIG value disabling the internal reference (external 2 V applied).
const CONFIG_EXTERNAL_REF: u16 = 0x0100;
/// GAIN value enabling the x2 output buffer on all channels.
const GAIN_DOUBLE_ALL: u16 = 0x00FF;

pub const RAW_ZERO: u16 = 0x0000;
pub const RAW_TWO_FIVE: u16 = 0xFFF0;

pub const NUM_CHANNELS: u8 = 8;

#[derive(Debug, Clone, Copy)]
pub struct Dac60508 {
    address: Address,
}

impl Dac60508 {
    pub const fn new(address: Address) -> Dac60508 {
        Dac60508 { address }
    }

    /// Convert a value in [0, 2.5] (nominal reference units) to a raw code.
    pub fn float_to_raw(value: f32) -> u16 {
        ((value / 2.5).clamp(0.0, 1.0) * RAW_TWO_FIVE as f32) as u16
    }

    pub fn raw_to_float(raw: u16) -> f32 {
        raw as f32 / RAW_TWO_FIVE as f32 * 2.5
    }

    fn write_register(&self, bus: &mut Bus, register: u8, data: u16) -> Result<()> {
        log::trace!("dac write_register({:#04x}, {:#06x})", register, data);
        bus.address(self.address)?;
        let [hi, lo] = data.to_be_bytes();
        bus.write_bytes(DEFAULT_SPI_SETTINGS, &[register, hi, lo])?;
        bus.deactivate()
    }

    pub fn read_register(&self, bus: &mut Bus, register: u8) -> Result<u16> {
        bus.address(self.address)?;
        bus.write_bytes(DEFAULT_SPI_SETTINGS, &[READ_FLAG | register, 0, 0])?;
        let mut miso = [0u8; 3];
        bus.transfer(DEFAULT_SPI_SETTINGS, &[REG_NOOP, 0, 0], &mut miso)?;
        bus.deactivate()?;
        Ok(u16::from_be_bytes([miso[1], miso[2]]))
    }

    /// Switch to the external reference and double the output gain.
    /// Must run before any channel is written.
    pub fn init(&self, bus: &mut Bus) -> Result<()> {
        self.write_register(bus, REG_CONFIG, CONFIG_EXTERNAL_REF)?;
        self.write_register(bus, REG_GAIN, GAIN_DOUBLE_ALL)
    }

    pub fn set_channel_raw(&self, bus: &mut Bus, channel: u8, raw: u16) -> Result<()> {
        if channel >= NUM_CHANNELS {
            return Err(crate::Error::Config(format!("DAC channel {} out of range", channel)));
        }
        self.write_register(bus, reg_dac(channel), raw)
    }

    pub fn set_channel(&self, bus: &mut Bus, channel: u8, value: f32) -> Result<()> {
        self.set_channel_raw(bus, channel, Self::float_to_raw(value))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_float_to_raw_endpoints() {
        assert_eq!(Dac60508::float_to_raw(0.0), RAW_ZERO);
        assert_eq!(Dac60508::float_to_raw(2.5), RAW_TWO_FIVE);
        // Out-of-range values saturate.
        assert_eq!(Dac60508::float_to_raw(-1.0), RAW_ZERO);
        assert_eq!(Dac60508::float_to_raw(5.0), RAW_TWO_FIVE);
    }

    #[test]
    fn test_raw_round_trip() {
        for value in [0.0f32, 0.5, 1.25, 2.0, 2.5] {
            let round_tripped = Dac60508::raw_to_float(Dac60508::float_to_raw(value));
            assert!((round_tripped - value).abs() < 2.5 / 4096.0);
        }
    }

    #[test]
    fn test_dac_registers() {
        assert_eq!(reg_dac(0), 8);
        assert_eq!(reg_dac(7), 15);
    }
}
