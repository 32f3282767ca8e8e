//! 256-byte identity memory present at FADDR 0 of every module.

use bitflags::bitflags;

use crate::{Error, Result};
use crate::bus::{Address, Bus};
use crate::sys::{BitOrder, SpiMode, SpiSettings};

pub const DEFAULT_SPI_SETTINGS: SpiSettings =
    SpiSettings::new(4_000_000, BitOrder::MsbFirst, SpiMode::Mode0);

pub const MEMORY_SIZE: usize = 256;
/// Writes may not cross a page boundary.
pub const PAGE_SIZE: usize = 16;

const CMD_READ: u8 = 0x03;
const CMD_WRITE: u8 = 0x02;
const CMD_WRITE_DISABLE: u8 = 0x04;
const CMD_READ_STATUS: u8 = 0x05;
const CMD_WRITE_ENABLE: u8 = 0x06;
const CMD_WRITE_STATUS: u8 = 0x01;

/// Internal write cycles finish within a few milliseconds; give up after 20.
const WRITE_TIMEOUT_MS: u32 = 20;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        /// Write in progress.
        const WIP = 1 << 0;
        /// Write enable latch.
        const WEL = 1 << 1;
        /// Block protection bits.
        const BP0 = 1 << 2;
        const BP1 = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IdentityMemory {
    address: Address,
}

impl IdentityMemory {
    pub const fn new(address: Address) -> IdentityMemory {
        IdentityMemory { address }
    }

    pub fn read(&self, bus: &mut Bus, offset: u8, buffer: &mut [u8]) -> Result<()> {
        if offset as usize + buffer.len() > MEMORY_SIZE {
            return Err(Error::Config(format!(
                "identity memory read of {} bytes at {} overflows", buffer.len(), offset)));
        }
        let mut mosi = vec![0u8; 2 + buffer.len()];
        mosi[0] = CMD_READ;
        mosi[1] = offset;
        let mut miso = vec![0u8; mosi.len()];
        bus.address(self.address)?;
        bus.transfer(DEFAULT_SPI_SETTINGS, &mosi, &mut miso)?;
        bus.deactivate()?;
        buffer.copy_from_slice(&miso[2..]);
        Ok(())
    }

    pub fn read_status(&self, bus: &mut Bus) -> Result<Status> {
        let mut miso = [0u8; 2];
        bus.address(self.address)?;
        bus.transfer(DEFAULT_SPI_SETTINGS, &[CMD_READ_STATUS, 0], &mut miso)?;
        bus.deactivate()?;
        Ok(Status::from_bits_retain(miso[1]))
    }

    pub fn write_status(&self, bus: &mut Bus, status: Status) -> Result<()> {
        self.write_enable(bus)?;
        bus.address(self.address)?;
        bus.write_bytes(DEFAULT_SPI_SETTINGS, &[CMD_WRITE_STATUS,
            status.bits() & (Status::BP0 | Status::BP1).bits()])?;
        bus.deactivate()?;
        self.write_disable(bus)?;
        self.await_write_complete(bus)
    }

    /// Page-oriented write with WIP polling after every page.
    pub fn write(&self, bus: &mut Bus, offset: u8, data: &[u8]) -> Result<()> {
        if offset as usize + data.len() > MEMORY_SIZE {
            return Err(Error::Config(format!(
                "identity memory write of {} bytes at {} overflows", data.len(), offset)));
        }
        let mut position = offset as usize;
        let mut remaining = data;
        while !remaining.is_empty() {
            let page_room = PAGE_SIZE - position % PAGE_SIZE;
            let chunk_len = page_room.min(remaining.len());
            let (chunk, rest) = remaining.split_at(chunk_len);

            self.write_enable(bus)?;
            let mut mosi = Vec::with_capacity(2 + chunk.len());
            mosi.push(CMD_WRITE);
            mosi.push(position as u8);
            mosi.extend_from_slice(chunk);
            bus.address(self.address)?;
            bus.write_bytes(DEFAULT_SPI_SETTINGS, &mosi)?;
            bus.deactivate()?;
            self.write_disable(bus)?;
            self.await_write_complete(bus)?;

            position += chunk_len;
            remaining = rest;
        }
        Ok(())
    }

    fn write_enable(&self, bus: &mut Bus) -> Result<()> {
        bus.address(self.address)?;
        bus.write_bytes(DEFAULT_SPI_SETTINGS, &[CMD_WRITE_ENABLE])?;
        bus.deactivate()
    }

    fn write_disable(&self, bus: &mut Bus) -> Result<()> {
        bus.address(self.address)?;
        bus.write_bytes(DEFAULT_SPI_SETTINGS, &[CMD_WRITE_DISABLE])?;
        bus.deactivate()
    }

    fn await_write_complete(&self, bus: &mut Bus) -> Result<()> {
        for _ in 0..WRITE_TIMEOUT_MS {
            bus.delay_ns(1_000_000);
            if !self.read_status(bus)?.contains(Status::WIP) {
                return Ok(());
            }
        }
        Err(Error::Other(format!(
            "identity memory at {:?} stuck in write", self.address).into()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sys::mock::MockDriver;

    fn bus_with_module() -> Bus {
        let driver = MockDriver::new();
        let mut image = [0u8; MEMORY_SIZE];
        for (idx, byte) in image.iter_mut().enumerate() {
            *byte = idx as u8;
        }
        driver.install_module(8, image);
        Bus::new(Box::new(driver)).unwrap()
    }

    #[test]
    fn test_read() {
        let mut bus = bus_with_module();
        let memory = IdentityMemory::new(Address::new(8, 0));
        let mut buffer = [0u8; 4];
        memory.read(&mut bus, 0x10, &mut buffer).unwrap();
        assert_eq!(buffer, [0x10, 0x11, 0x12, 0x13]);
    }

    #[test]
    fn test_read_overflow_rejected() {
        let mut bus = bus_with_module();
        let memory = IdentityMemory::new(Address::new(8, 0));
        let mut buffer = [0u8; 16];
        assert!(memory.read(&mut bus, 250, &mut buffer).is_err());
    }

    #[test]
    fn test_write_spanning_pages() {
        let mut bus = bus_with_module();
        let memory = IdentityMemory::new(Address::new(8, 0));
        let data: Vec<u8> = (0..20).map(|value| 0xA0 + value).collect();
        // Starts mid-page, so the write must split at offsets 16 and 32.
        memory.write(&mut bus, 12, &data).unwrap();
        let mut buffer = [0u8; 20];
        memory.read(&mut bus, 12, &mut buffer).unwrap();
        assert_eq!(&buffer[..], &data[..]);
    }

    #[test]
    fn test_status_read() {
        let mut bus = bus_with_module();
        let memory = IdentityMemory::new(Address::new(8, 0));
        let status = memory.read_status(&mut bus).unwrap();
        assert!(!status.contains(Status::WIP));
    }
}
