use std::sync::Arc;

use crate::Result;
use crate::daq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiMode {
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiSettings {
    pub clock_hz: u32,
    pub bit_order: BitOrder,
    pub mode: SpiMode,
}

impl SpiSettings {
    pub const fn new(clock_hz: u32, bit_order: BitOrder, mode: SpiMode) -> SpiSettings {
        SpiSettings { clock_hz, bit_order, mode }
    }
}

/// GPIO lines the portable core drives or observes directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pin {
    /// ADC conversion start.
    Cnvst,
    /// Bit-bang readout clock shared by all ADC channels.
    AdcClk,
    /// Per-channel ADC data line, index 0..8.
    AdcMiso(u8),
    ModeIc,
    ModeOp,
    Overload,
    ExtHalt,
}

/// The seam between the portable core and the MCU peripherals.
///
/// Everything above this trait (chip protocols, block drivers, streaming
/// decisions) is portable; a hardware port implements only this trait.
pub trait Driver {
    /// Shift a 16-bit selector into the shared address latch and pulse it.
    /// Until the next call, SPI transfers target the selected chip.
    fn latch_address(&mut self, selector: u16) -> Result<()>;
    /// Assert the asynchronous latch reset, returning the bus to idle.
    fn reset_address(&mut self) -> Result<()>;
    /// One full-duplex SPI transaction against the currently addressed chip.
    /// `mosi` and `miso` must have the same length.
    fn transfer(&mut self, settings: SpiSettings, mosi: &[u8], miso: &mut [u8]) -> Result<()>;

    fn pin_write(&mut self, pin: Pin, level: bool) -> Result<()>;
    fn pin_read(&mut self, pin: Pin) -> Result<bool>;
    /// Put a pin into a floating/high-impedance state.
    fn pin_release(&mut self, pin: Pin) -> Result<()>;

    fn delay_ns(&mut self, ns: u32);
    fn micros(&mut self) -> u64;

    /// Program the timed-run sequencer with IC and OP phase durations.
    fn timer_configure(&mut self, ic_time_ns: u64, op_time_ns: u64) -> Result<()>;
    fn timer_start(&mut self) -> Result<()>;
    fn timer_is_done(&mut self) -> Result<bool>;

    /// Arm the hardware-timed sampling engine. The engine deposits one
    /// `4 * num_channels`-byte vector per sample period into `ring` and
    /// raises the half/complete flags on it.
    fn daq_init(&mut self, config: daq::DaqConfig, ring: Arc<daq::Ring>) -> Result<()>;
    fn daq_enable(&mut self) -> Result<()>;
    fn daq_reset(&mut self) -> Result<()>;
    /// Latched engine faults, checked once at finalize.
    fn daq_fault(&mut self) -> daq::HwFault;
}

pub mod mock;
