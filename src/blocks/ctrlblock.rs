//! CTRL block: carrier-level plumbing. Selects which eight-wide bus feeds
//! the ADC channels and carries the sync-ID generator for multi-chassis
//! alignment.

use serde_json::{Map, Value};

use crate::{Error, Result};
use crate::bus::{Address, Bus, CTRL_BADDR};
use crate::chips::shiftreg::ShiftRegister;
use crate::entity::{
    DEFAULT_VARIANT, Entity, EntityClass, EntityClassifier, Eui64, Version,
};
use crate::sys::{BitOrder, SpiMode, SpiSettings};

/// Source feeding the eight ADC channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdcBus {
    // The low values match the cluster indices.
    Cluster0Gain = 0,
    Cluster1Gain = 1,
    Cluster2Gain = 2,
    #[default]
    Adc = 3,
}

pub const MAX_SYNC_ID: u8 = 63;

const SYNC_SPI_SETTINGS: SpiSettings =
    SpiSettings::new(1_000_000, BitOrder::MsbFirst, SpiMode::Mode0);

#[derive(Debug)]
pub struct CtrlBlockHalV102 {
    adc_mux: ShiftRegister,
    adc_mux_latch: Address,
    sync: Address,
}

impl CtrlBlockHalV102 {
    fn new(block: Address) -> CtrlBlockHalV102 {
        CtrlBlockHalV102 {
            adc_mux: ShiftRegister::new(block.with_faddr(2)),
            adc_mux_latch: block.with_faddr(3),
            sync: block.with_faddr(4),
        }
    }
}

#[derive(Debug)]
pub enum CtrlBlockHal {
    V102(CtrlBlockHalV102),
}

impl CtrlBlockHal {
    fn write_adc_bus_muxers(&self, bus: &mut Bus, adc_bus: AdcBus) -> Result<()> {
        let Self::V102(hal) = self;
        hal.adc_mux.write8(bus, adc_bus as u8)?;
        bus.trigger(hal.adc_mux_latch)
    }

    fn write_sync_id(&self, bus: &mut Bus, id: u8) -> Result<()> {
        let Self::V102(hal) = self;
        // Only six of the sixteen bits carry the ID; the fixed prefix and
        // suffix keep the serial stream unique.
        let word = ((id as u16) << 1) | 0b1000_0001;
        bus.address(hal.sync)?;
        bus.transfer16(SYNC_SPI_SETTINGS, word)?;
        bus.deactivate()
    }
}

#[derive(Debug)]
pub struct CtrlBlock {
    classifier: EntityClassifier,
    eui: Eui64,
    hal: CtrlBlockHal,
    adc_bus: AdcBus,
}

impl CtrlBlock {
    pub const TYPE: u8 = 1;

    pub fn from_classifier(classifier: EntityClassifier, eui: Eui64) -> Option<CtrlBlock> {
        if classifier.class != EntityClass::CtrlBlock || classifier.type_ != Self::TYPE {
            return None;
        }
        if classifier.variant != DEFAULT_VARIANT {
            return None;
        }
        // v1.0.1 boards lack the mux hardware and must not be driven.
        if classifier.version < Version::new(1, 0, 2)
                || classifier.version >= Version::new(2, 0, 0) {
            return None;
        }
        Some(CtrlBlock {
            classifier,
            eui,
            hal: CtrlBlockHal::V102(CtrlBlockHalV102::new(Address::new(CTRL_BADDR, 0))),
            adc_bus: AdcBus::Adc,
        })
    }

    /// The power-up mux selection is unhelpful, so write defaults early.
    pub fn init(&mut self, bus: &mut Bus) -> Result<()> {
        self.write_to_hardware(bus)
    }

    pub fn adc_bus(&self) -> AdcBus {
        self.adc_bus
    }

    pub fn set_adc_bus(&mut self, adc_bus: AdcBus) {
        self.adc_bus = adc_bus;
    }

    pub fn set_adc_bus_to_cluster_gain(&mut self, cluster_idx: usize) -> Result<()> {
        let adc_bus = match cluster_idx {
            0 => AdcBus::Cluster0Gain,
            1 => AdcBus::Cluster1Gain,
            2 => AdcBus::Cluster2Gain,
            _ => return Err(Error::Config(format!(
                "no gain bus for cluster {}", cluster_idx))),
        };
        self.adc_bus = adc_bus;
        Ok(())
    }

    pub fn reset_adc_bus(&mut self) {
        self.adc_bus = AdcBus::Adc;
    }

    /// Emit the 6-bit synchronisation pattern. Exposed for bring-up; no
    /// protocol handler drives it yet.
    pub fn write_sync_id(&mut self, bus: &mut Bus, id: u8) -> Result<()> {
        if id > MAX_SYNC_ID {
            return Err(Error::Config(format!("sync id {} exceeds {}", id, MAX_SYNC_ID)));
        }
        self.hal.write_sync_id(bus, id)
    }

    pub fn reset(&mut self, _keep_calibration: bool) {
        self.reset_adc_bus();
    }
}

impl Entity for CtrlBlock {
    fn entity_id(&self) -> &str {
        "CTRL"
    }

    fn classifier(&self) -> EntityClassifier {
        self.classifier
    }

    fn eui(&self) -> Option<Eui64> {
        Some(self.eui)
    }

    fn config_self_from_json(&mut self, cfg: &Map<String, Value>) -> Result<()> {
        for key in cfg.keys() {
            if !key.starts_with('/') {
                return Err(Error::Config(format!("unknown CTRL-block key '{}'", key)));
            }
        }
        Ok(())
    }

    fn config_self_to_json(&self, _cfg: &mut Map<String, Value>) {}

    fn write_to_hardware(&mut self, bus: &mut Bus) -> Result<()> {
        self.hal.write_adc_bus_muxers(bus, self.adc_bus)
    }
}
