//! Scriptable in-memory implementation of [`Driver`].
//!
//! The mock keeps per-module identity memory images and answers the EEPROM
//! wire protocol for any transfer addressed to FADDR 0, records every other
//! transaction for assertions, replays scripted one-shot ADC conversions,
//! and emulates the timed-run sequencer: virtual time advances on every
//! `timer_is_done` poll, and the sampling engine deposits vectors from a
//! configurable source into the shared ring as OP time elapses.
//!
//! A `MockDriver` is a cheap handle onto shared state, so a test can keep a
//! clone for scripting and inspection while the bus owns another.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use crate::Result;
use crate::bus::Address;
use crate::chips::adc;
use crate::chips::eeprom::MEMORY_SIZE;
use crate::daq::{self, DaqConfig, Ring};
use crate::entity::{
    CLASSIFIER_OFFSET, EUI_OFFSET, EntityClassifier, LAYOUT_SIZE_OFFSET,
    LAYOUT_V1, LAYOUT_VERSION_OFFSET,
};
use crate::sys::{Driver, Pin, SpiSettings};

const CMD_READ: u8 = 0x03;
const CMD_WRITE: u8 = 0x02;
const CMD_WRITE_DISABLE: u8 = 0x04;
const CMD_READ_STATUS: u8 = 0x05;
const CMD_WRITE_ENABLE: u8 = 0x06;

pub type SampleSource = Box<dyn FnMut(usize, usize) -> u16>;

#[derive(Debug, Clone)]
pub struct Transaction {
    pub address: Address,
    pub mosi: Vec<u8>,
}

struct TimerSim {
    ic_time_ns: u64,
    op_time_ns: u64,
    running: bool,
    elapsed_ns: u64,
}

struct DaqSim {
    config: DaqConfig,
    ring: Arc<Ring>,
    enabled: bool,
    produced_vectors: usize,
}

struct State {
    latched: Option<Address>,
    time_ns: u64,
    modules: HashMap<u8, [u8; MEMORY_SIZE]>,
    write_enabled: bool,
    transactions: Vec<Transaction>,
    pins: HashMap<Pin, bool>,
    inputs: HashMap<Pin, bool>,
    adc_script: VecDeque<[u16; 8]>,
    adc_default: [u16; 8],
    adc_shift: [u16; 8],
    adc_clk_count: u32,
    timer: Option<TimerSim>,
    poll_advance_ns: Option<u64>,
    daq: Option<DaqSim>,
    sample_source: SampleSource,
    fault: daq::HwFault,
}

impl State {
    fn default_poll_advance(&self) -> u64 {
        let timer = self.timer.as_ref().unwrap();
        let phase_quarter = ((timer.ic_time_ns + timer.op_time_ns) / 4).max(1);
        match &self.daq {
            Some(daq_sim) if daq_sim.config.is_active() => {
                // Time for a quarter ring of vectors at the sample rate, so
                // a draining streamer never sees an overflow by default.
                let vectors = daq::BUFFER_SIZE / 4 / daq_sim.config.num_channels;
                let vector_period_ns = 1_000_000_000 / daq_sim.config.sample_rate as u64;
                phase_quarter.min((vectors as u64 * vector_period_ns).max(1))
            }
            _ => phase_quarter,
        }
    }

    /// Produce the DAQ vectors that correspond to the OP time elapsed so far.
    fn produce_samples(&mut self) {
        let Some(timer) = &self.timer else { return };
        let Some(daq_sim) = &mut self.daq else { return };
        if !daq_sim.enabled || !daq_sim.config.is_active() {
            return;
        }
        let op_elapsed_ns = timer.elapsed_ns.saturating_sub(timer.ic_time_ns)
            .min(timer.op_time_ns);
        let expected = (op_elapsed_ns as u128 * daq_sim.config.sample_rate as u128
            / 1_000_000_000) as usize;
        while daq_sim.produced_vectors < expected {
            let vector_idx = daq_sim.produced_vectors;
            for channel in 0..daq_sim.config.num_channels {
                daq_sim.ring.push((self.sample_source)(vector_idx, channel) as u32);
            }
            daq_sim.produced_vectors += 1;
        }
    }

    fn eeprom_transfer(&mut self, baddr: u8, mosi: &[u8], miso: &mut [u8]) {
        let write_enabled = self.write_enabled;
        let Some(image) = self.modules.get_mut(&baddr) else { return };
        match mosi[0] {
            CMD_READ if mosi.len() >= 2 => {
                let offset = mosi[1] as usize;
                for idx in 2..miso.len() {
                    miso[idx] = image[(offset + idx - 2) % MEMORY_SIZE];
                }
            }
            CMD_WRITE if mosi.len() >= 2 && write_enabled => {
                let offset = mosi[1] as usize;
                for (idx, &byte) in mosi[2..].iter().enumerate() {
                    image[(offset + idx) % MEMORY_SIZE] = byte;
                }
            }
            CMD_WRITE_ENABLE => self.write_enabled = true,
            CMD_WRITE_DISABLE => self.write_enabled = false,
            CMD_READ_STATUS => {
                // Writes complete instantly, so WIP never reads back set.
                if miso.len() >= 2 {
                    miso[1] = if self.write_enabled { 0x02 } else { 0x00 };
                }
            }
            _ => (),
        }
    }
}

#[derive(Clone)]
pub struct MockDriver {
    state: Rc<RefCell<State>>,
}

impl MockDriver {
    pub fn new() -> MockDriver {
        MockDriver {
            state: Rc::new(RefCell::new(State {
                latched: None,
                time_ns: 0,
                modules: HashMap::new(),
                write_enabled: false,
                transactions: Vec::new(),
                pins: HashMap::new(),
                inputs: HashMap::new(),
                adc_script: VecDeque::new(),
                adc_default: [adc::float_to_raw(0.0); 8],
                adc_shift: [0; 8],
                adc_clk_count: 0,
                timer: None,
                poll_advance_ns: None,
                daq: None,
                sample_source: Box::new(|_, _| adc::float_to_raw(0.0)),
                fault: daq::HwFault::empty(),
            })),
        }
    }

    /// Install a raw 256-byte identity memory image for a module.
    pub fn install_module(&self, baddr: u8, image: [u8; MEMORY_SIZE]) {
        self.state.borrow_mut().modules.insert(baddr, image);
    }

    /// Install a well-formed identity for a module: layout tag, size,
    /// classifier, and EUI-64.
    pub fn install_identity(&self, baddr: u8, classifier: &EntityClassifier, eui: [u8; 8]) {
        let mut image = [0u8; MEMORY_SIZE];
        image[LAYOUT_VERSION_OFFSET as usize] = LAYOUT_V1;
        image[LAYOUT_SIZE_OFFSET as usize..LAYOUT_SIZE_OFFSET as usize + 2]
            .copy_from_slice(&(MEMORY_SIZE as u16).to_le_bytes());
        image[CLASSIFIER_OFFSET as usize..CLASSIFIER_OFFSET as usize + 6]
            .copy_from_slice(&classifier.to_bytes());
        image[EUI_OFFSET as usize..].copy_from_slice(&eui);
        self.install_module(baddr, image);
    }

    /// Identity images for a complete single-cluster chassis: carrier,
    /// CTRL block, U/C/I/SH, an integrator block in M0 and a multiplier
    /// block in M1.
    pub fn install_standard_chassis(&self) {
        use crate::bus;
        use crate::entity::{EntityClass, Version};
        let eui = |tail: u8| [0x04, 0xE9, 0xE5, 0x00, 0x00, 0x00, 0x00, tail];
        self.install_identity(bus::CARRIER_BADDR, &EntityClassifier::new(
            EntityClass::Carrier, 1, Version::new(1, 0, 0), 0), eui(0x01));
        self.install_identity(bus::CTRL_BADDR, &EntityClassifier::new(
            EntityClass::CtrlBlock, 1, Version::new(1, 0, 2), 0), eui(0x02));
        self.install_identity(bus::block_baddr(0, bus::U_BLOCK_SLOT), &EntityClassifier::new(
            EntityClass::UBlock, 1, Version::new(1, 2, 0), 0), eui(0x10));
        self.install_identity(bus::block_baddr(0, bus::C_BLOCK_SLOT), &EntityClassifier::new(
            EntityClass::CBlock, 1, Version::new(1, 0, 0), 1), eui(0x11));
        self.install_identity(bus::block_baddr(0, bus::I_BLOCK_SLOT), &EntityClassifier::new(
            EntityClass::IBlock, 1, Version::new(1, 2, 0), 0), eui(0x12));
        self.install_identity(bus::block_baddr(0, bus::SH_BLOCK_SLOT), &EntityClassifier::new(
            EntityClass::ShBlock, 1, Version::new(1, 1, 0), 0), eui(0x13));
        self.install_identity(bus::block_baddr(0, bus::M0_BLOCK_SLOT), &EntityClassifier::new(
            EntityClass::MBlock, 1, Version::new(1, 0, 0), 0), eui(0x14));
        self.install_identity(bus::block_baddr(0, bus::M1_BLOCK_SLOT), &EntityClassifier::new(
            EntityClass::MBlock, 2, Version::new(1, 0, 0), 0), eui(0x15));
    }

    /// The steady one-shot ADC reading used once the script runs dry.
    pub fn set_adc_default(&self, values: [f32; 8]) {
        self.state.borrow_mut().adc_default = values.map(adc::float_to_raw);
    }

    /// Queue one conversion result; consumed in FIFO order.
    pub fn push_adc_reading(&self, values: [f32; 8]) {
        self.state.borrow_mut().adc_script.push_back(values.map(adc::float_to_raw));
    }

    /// Drive an input pin (overload, external halt) as seen by the core.
    pub fn set_pin_input(&self, pin: Pin, level: bool) {
        self.state.borrow_mut().inputs.insert(pin, level);
    }

    /// Level last written to an output pin; `None` once released.
    pub fn pin_level(&self, pin: Pin) -> Option<bool> {
        self.state.borrow().pins.get(&pin).copied()
    }

    /// Raw samples the continuous engine produces, by vector index and
    /// channel.
    pub fn set_sample_source(&self, source: SampleSource) {
        self.state.borrow_mut().sample_source = source;
    }

    /// Virtual time advanced per `timer_is_done` poll. Set it past the ring
    /// size to provoke overflow.
    pub fn set_poll_advance_ns(&self, advance_ns: u64) {
        self.state.borrow_mut().poll_advance_ns = Some(advance_ns);
    }

    pub fn set_daq_fault(&self, fault: daq::HwFault) {
        self.state.borrow_mut().fault = fault;
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.borrow().transactions.clone()
    }

    pub fn clear_transactions(&self) {
        self.state.borrow_mut().transactions.clear();
    }

    /// All recorded writes to one bus address, for register assertions.
    pub fn writes_to(&self, address: Address) -> Vec<Vec<u8>> {
        self.state.borrow().transactions.iter()
            .filter(|transaction| transaction.address == address)
            .map(|transaction| transaction.mosi.clone())
            .collect()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MockDriver {
    fn latch_address(&mut self, selector: u16) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.latched = Some(Address::new(selector as u8, (selector >> 8) as u8));
        Ok(())
    }

    fn reset_address(&mut self) -> Result<()> {
        self.state.borrow_mut().latched = None;
        Ok(())
    }

    fn transfer(&mut self, _settings: SpiSettings, mosi: &[u8], miso: &mut [u8]) -> Result<()> {
        assert_eq!(mosi.len(), miso.len());
        let mut state = self.state.borrow_mut();
        let address = state.latched.expect("transfer without latched address");
        state.transactions.push(Transaction { address, mosi: mosi.to_vec() });
        if address.faddr() == crate::bus::METADATA_FADDR && !mosi.is_empty() {
            state.eeprom_transfer(address.baddr(), mosi, miso);
        }
        Ok(())
    }

    fn pin_write(&mut self, pin: Pin, level: bool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        match pin {
            Pin::Cnvst => {
                // Arm a conversion on the falling edge.
                if state.pins.get(&pin) == Some(&true) && !level {
                    state.adc_shift = state.adc_script.pop_front()
                        .unwrap_or(state.adc_default);
                    state.adc_clk_count = 0;
                }
            }
            Pin::AdcClk => {
                if state.pins.get(&pin) != Some(&true) && level {
                    state.adc_clk_count += 1;
                }
            }
            _ => (),
        }
        state.pins.insert(pin, level);
        Ok(())
    }

    fn pin_read(&mut self, pin: Pin) -> Result<bool> {
        let state = self.state.borrow();
        match pin {
            Pin::AdcMiso(channel) => {
                let clk = state.adc_clk_count;
                if clk == 0 || clk > 14 {
                    return Ok(false);
                }
                let bit = 13 - (clk - 1);
                Ok(state.adc_shift[channel as usize] >> bit & 1 != 0)
            }
            _ => Ok(*state.inputs.get(&pin)
                .or_else(|| state.pins.get(&pin))
                .unwrap_or(&false)),
        }
    }

    fn pin_release(&mut self, pin: Pin) -> Result<()> {
        self.state.borrow_mut().pins.remove(&pin);
        Ok(())
    }

    fn delay_ns(&mut self, ns: u32) {
        let mut state = self.state.borrow_mut();
        state.time_ns += ns as u64;
        if let Some(timer) = &mut state.timer {
            if timer.running {
                timer.elapsed_ns += ns as u64;
            }
        }
        state.produce_samples();
    }

    fn micros(&mut self) -> u64 {
        self.state.borrow().time_ns / 1000
    }

    fn timer_configure(&mut self, ic_time_ns: u64, op_time_ns: u64) -> Result<()> {
        self.state.borrow_mut().timer =
            Some(TimerSim { ic_time_ns, op_time_ns, running: false, elapsed_ns: 0 });
        Ok(())
    }

    fn timer_start(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let timer = state.timer.as_mut().expect("timer started before configuration");
        timer.running = true;
        timer.elapsed_ns = 0;
        Ok(())
    }

    fn timer_is_done(&mut self) -> Result<bool> {
        let mut state = self.state.borrow_mut();
        let Some(timer) = &state.timer else { return Ok(true) };
        if !timer.running {
            return Ok(true);
        }
        let advance = state.poll_advance_ns.unwrap_or_else(|| state.default_poll_advance());
        let timer = state.timer.as_mut().unwrap();
        let total = timer.ic_time_ns + timer.op_time_ns;
        timer.elapsed_ns += advance;
        let done = timer.elapsed_ns >= total;
        if done {
            timer.elapsed_ns = total;
            timer.running = false;
        }
        state.time_ns += advance;
        state.produce_samples();
        Ok(done)
    }

    fn daq_init(&mut self, config: DaqConfig, ring: Arc<Ring>) -> Result<()> {
        self.state.borrow_mut().daq =
            Some(DaqSim { config, ring, enabled: false, produced_vectors: 0 });
        Ok(())
    }

    fn daq_enable(&mut self) -> Result<()> {
        if let Some(daq_sim) = &mut self.state.borrow_mut().daq {
            daq_sim.enabled = true;
        }
        Ok(())
    }

    fn daq_reset(&mut self) -> Result<()> {
        if let Some(daq_sim) = &mut self.state.borrow_mut().daq {
            daq_sim.ring.reset();
            daq_sim.enabled = false;
            daq_sim.produced_vectors = 0;
        }
        Ok(())
    }

    fn daq_fault(&mut self) -> daq::HwFault {
        self.state.borrow().fault
    }
}
