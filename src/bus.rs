//! Shared address-latched SPI bus.
//!
//! Every chip in the system sits behind one SPI bus plus an address latch.
//! A 10-bit selector, packed as `(FADDR:6 | BADDR:4)`, picks one function of
//! one module; latching it routes chip select to that chip until the latch is
//! rewritten or reset. Callers arrange mutual exclusion themselves; the bus
//! must be returned to idle after every transaction.

use std::fmt;

use crate::Result;
use crate::sys::{Driver, SpiSettings};

pub const BADDR_MASK: u8 = 0x0F;
pub const FADDR_MASK: u8 = 0x3F;

/// Packed `(FADDR:6 | BADDR:4)` bus selector. BADDR 0 is the reserved null
/// address; FADDR 0 is the module's identity memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(u16);

impl Address {
    pub const NULL: Address = Address(0);

    pub const fn new(baddr: u8, faddr: u8) -> Address {
        Address((((faddr & FADDR_MASK) as u16) << 8) | (baddr & BADDR_MASK) as u16)
    }

    pub const fn baddr(self) -> u8 {
        (self.0 & 0x00FF) as u8
    }

    pub const fn faddr(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn with_faddr(self, faddr: u8) -> Address {
        Address::new(self.baddr(), faddr)
    }

    /// The 16-bit word shifted into the latch, FADDR in the high byte.
    pub const fn selector(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Address({}.{})", self.baddr(), self.faddr())
    }
}

// Fixed module addresses.
pub const CTRL_BADDR: u8 = 1;
pub const BACKPLANE_BADDR: u8 = 2;
pub const CARRIER_BADDR: u8 = 5;

// Block slots within a cluster.
pub const U_BLOCK_SLOT: u8 = 0;
pub const C_BLOCK_SLOT: u8 = 1;
pub const I_BLOCK_SLOT: u8 = 2;
pub const SH_BLOCK_SLOT: u8 = 3;
pub const M0_BLOCK_SLOT: u8 = 4;
pub const M1_BLOCK_SLOT: u8 = 5;

/// The identity memory of every module answers at FADDR 0.
pub const METADATA_FADDR: u8 = 0;

pub const fn block_baddr(cluster_idx: u8, slot: u8) -> u8 {
    (cluster_idx + 1) * 8 + slot
}

pub const fn block_address(cluster_idx: u8, slot: u8) -> Address {
    Address::new(block_baddr(cluster_idx, slot), 0)
}

/// Settle time around every latch transition.
const SETTLE_NS: u32 = 200;

pub struct Bus {
    driver: Box<dyn Driver>,
}

impl Bus {
    /// Takes ownership of the peripheral driver and returns the bus to idle.
    pub fn new(mut driver: Box<dyn Driver>) -> Result<Bus> {
        driver.reset_address()?;
        Ok(Bus { driver })
    }

    /// Latch `addr` so the following SPI transfers target that chip.
    pub fn address(&mut self, addr: Address) -> Result<()> {
        log::trace!("address({:?})", addr);
        self.driver.delay_ns(SETTLE_NS);
        self.driver.latch_address(addr.selector())?;
        self.driver.delay_ns(SETTLE_NS);
        Ok(())
    }

    /// Return the bus to idle. No chip is selected afterwards.
    pub fn deactivate(&mut self) -> Result<()> {
        log::trace!("deactivate()");
        self.driver.reset_address()?;
        self.driver.delay_ns(SETTLE_NS);
        Ok(())
    }

    /// Address a trigger function. The mere act of addressing causes the
    /// action; there is no data phase.
    pub fn trigger(&mut self, addr: Address) -> Result<()> {
        self.address(addr)?;
        self.deactivate()
    }

    pub fn transfer(&mut self, settings: SpiSettings, mosi: &[u8], miso: &mut [u8]) -> Result<()> {
        log::trace!("transfer({:02x?})", mosi);
        self.driver.transfer(settings, mosi, miso)
    }

    /// Write-only transfer; the response bytes are discarded.
    pub fn write_bytes(&mut self, settings: SpiSettings, mosi: &[u8]) -> Result<()> {
        let mut scratch = vec![0u8; mosi.len()];
        self.transfer(settings, mosi, &mut scratch)
    }

    pub fn transfer8(&mut self, settings: SpiSettings, data: u8) -> Result<u8> {
        let mut miso = [0u8; 1];
        self.transfer(settings, &[data], &mut miso)?;
        Ok(miso[0])
    }

    pub fn transfer16(&mut self, settings: SpiSettings, data: u16) -> Result<u16> {
        let mut miso = [0u8; 2];
        self.transfer(settings, &data.to_be_bytes(), &mut miso)?;
        Ok(u16::from_be_bytes(miso))
    }

    pub fn transfer32(&mut self, settings: SpiSettings, data: u32) -> Result<u32> {
        let mut miso = [0u8; 4];
        self.transfer(settings, &data.to_be_bytes(), &mut miso)?;
        Ok(u32::from_be_bytes(miso))
    }

    pub fn delay_ns(&mut self, ns: u32) {
        self.driver.delay_ns(ns)
    }

    pub fn driver_mut(&mut self) -> &mut dyn Driver {
        self.driver.as_mut()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_address_packing() {
        let addr = Address::new(9, 33);
        assert_eq!(addr.baddr(), 9);
        assert_eq!(addr.faddr(), 33);
        assert_eq!(addr.selector(), (33 << 8) | 9);
    }

    #[test]
    fn test_address_masks() {
        // Out-of-range fields wrap into their mask.
        let addr = Address::new(0xFF, 0xFF);
        assert_eq!(addr.baddr(), BADDR_MASK);
        assert_eq!(addr.faddr(), FADDR_MASK);
    }

    #[test]
    fn test_with_faddr() {
        let addr = Address::new(8, 0);
        assert_eq!(addr.with_faddr(7), Address::new(8, 7));
        assert_eq!(addr.with_faddr(7).baddr(), 8);
    }

    #[test]
    fn test_block_baddrs() {
        assert_eq!(block_baddr(0, U_BLOCK_SLOT), 8);
        assert_eq!(block_baddr(0, C_BLOCK_SLOT), 9);
        assert_eq!(block_baddr(0, I_BLOCK_SLOT), 10);
        assert_eq!(block_baddr(0, SH_BLOCK_SLOT), 11);
        assert_eq!(block_baddr(0, M0_BLOCK_SLOT), 12);
        assert_eq!(block_baddr(0, M1_BLOCK_SLOT), 13);
    }

    #[test]
    fn test_null_address() {
        assert_eq!(Address::NULL.selector(), 0);
        assert_eq!(Address::new(0, 0), Address::NULL);
    }
}
