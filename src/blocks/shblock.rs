//! SH block: the track-and-hold stage between the summing outputs and the
//! ADC bus. All transitions are trigger functions; merely addressing them
//! performs the switch, so there is no data phase and no flush.

use serde_json::{Map, Value};

use crate::{Error, Result};
use crate::bus::{Address, Bus};
use crate::entity::{
    DEFAULT_VARIANT, Entity, EntityClass, EntityClassifier, Eui64, Version,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShState {
    Track,
    TrackAtIc,
    Gain,
    Inject,
    GainChannels0To7,
    GainChannels8To15,
}

#[derive(Debug)]
pub struct ShBlockHalV11 {
    set_track: Address,
    set_track_at_ic: Address,
    set_gain: Address,
    set_gain_channels_0_to_7: Address,
    set_gain_channels_8_to_15: Address,
    set_inject: Address,
}

impl ShBlockHalV11 {
    fn new(block: Address) -> ShBlockHalV11 {
        ShBlockHalV11 {
            set_track: block.with_faddr(2),
            set_track_at_ic: block.with_faddr(3),
            set_gain: block.with_faddr(4),
            set_gain_channels_0_to_7: block.with_faddr(5),
            set_gain_channels_8_to_15: block.with_faddr(6),
            set_inject: block.with_faddr(7),
        }
    }
}

#[derive(Debug)]
pub enum ShBlockHal {
    V11(ShBlockHalV11),
}

impl ShBlockHal {
    fn trigger(&self, bus: &mut Bus, state: ShState) -> Result<()> {
        let Self::V11(hal) = self;
        let target = match state {
            ShState::Track => hal.set_track,
            ShState::TrackAtIc => hal.set_track_at_ic,
            ShState::Gain => hal.set_gain,
            ShState::GainChannels0To7 => hal.set_gain_channels_0_to_7,
            ShState::GainChannels8To15 => hal.set_gain_channels_8_to_15,
            ShState::Inject => hal.set_inject,
        };
        bus.trigger(target)
    }
}

#[derive(Debug)]
pub struct ShBlock {
    classifier: EntityClassifier,
    eui: Eui64,
    hal: ShBlockHal,
    /// After power-up the hardware sits in inject with an undefined
    /// current.
    state: ShState,
}

impl ShBlock {
    pub const TYPE: u8 = 1;

    pub fn from_classifier(classifier: EntityClassifier, eui: Eui64, block: Address)
            -> Option<ShBlock> {
        if classifier.class != EntityClass::ShBlock || classifier.type_ != Self::TYPE {
            return None;
        }
        if classifier.variant != DEFAULT_VARIANT {
            return None;
        }
        if classifier.version < Version::new(1, 0, 0)
                || classifier.version >= Version::new(2, 0, 0) {
            return None;
        }
        Some(ShBlock {
            classifier,
            eui,
            hal: ShBlockHal::V11(ShBlockHalV11::new(block)),
            state: ShState::Inject,
        })
    }

    pub fn state(&self) -> ShState {
        self.state
    }

    pub fn set_state(&mut self, bus: &mut Bus, state: ShState) -> Result<()> {
        log::trace!("sh: {:?}", state);
        self.hal.trigger(bus, state)?;
        self.state = state;
        Ok(())
    }

    pub fn set_track(&mut self, bus: &mut Bus) -> Result<()> {
        self.set_state(bus, ShState::Track)
    }

    pub fn set_track_at_ic(&mut self, bus: &mut Bus) -> Result<()> {
        self.set_state(bus, ShState::TrackAtIc)
    }

    pub fn set_inject(&mut self, bus: &mut Bus) -> Result<()> {
        self.set_state(bus, ShState::Inject)
    }

    pub fn set_gain(&mut self, bus: &mut Bus) -> Result<()> {
        self.set_state(bus, ShState::Gain)
    }

    /// Put one half of the sixteen gain outputs onto the eight-wide gain
    /// bus.
    pub fn set_gain_channels(&mut self, bus: &mut Bus, upper_half: bool) -> Result<()> {
        self.set_state(bus, if upper_half {
            ShState::GainChannels8To15
        } else {
            ShState::GainChannels0To7
        })
    }

    /// Track the current offsets and freeze them for feedback into the
    /// signal path.
    pub fn compensate_hardware_offsets(&mut self, bus: &mut Bus) -> Result<()> {
        self.set_track(bus)?;
        bus.delay_ns(100_000);
        self.set_inject(bus)?;
        bus.delay_ns(20_000);
        Ok(())
    }

    pub fn reset(&mut self, _keep_calibration: bool) {
        self.state = ShState::Inject;
    }
}

impl Entity for ShBlock {
    fn entity_id(&self) -> &str {
        "SH"
    }

    fn classifier(&self) -> EntityClassifier {
        self.classifier
    }

    fn eui(&self) -> Option<Eui64> {
        Some(self.eui)
    }

    fn config_self_from_json(&mut self, cfg: &Map<String, Value>) -> Result<()> {
        // State transitions are trigger-driven only.
        for key in cfg.keys() {
            if !key.starts_with('/') {
                return Err(Error::Config(format!("unknown SH-block key '{}'", key)));
            }
        }
        Ok(())
    }

    fn config_self_to_json(&self, _cfg: &mut Map<String, Value>) {}

    fn write_to_hardware(&mut self, _bus: &mut Bus) -> Result<()> {
        // Nothing latched; transitions already happened on the triggers.
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sys::mock::MockDriver;

    fn sh_block() -> ShBlock {
        let classifier = EntityClassifier::new(
            EntityClass::ShBlock, ShBlock::TYPE, Version::new(1, 1, 0), 0);
        ShBlock::from_classifier(classifier, Eui64([0; 8]), Address::new(11, 0)).unwrap()
    }

    #[test]
    fn test_initial_state() {
        assert_eq!(sh_block().state(), ShState::Inject);
    }

    #[test]
    fn test_transitions_are_triggers() {
        let driver = MockDriver::new();
        let mut bus = Bus::new(Box::new(driver.clone())).unwrap();
        let mut sh = sh_block();
        sh.set_track(&mut bus).unwrap();
        assert_eq!(sh.state(), ShState::Track);
        sh.set_gain_channels(&mut bus, true).unwrap();
        assert_eq!(sh.state(), ShState::GainChannels8To15);
        // Triggers have no data phase.
        assert!(driver.transactions().is_empty());
    }

    #[test]
    fn test_config_rejected() {
        let mut sh = sh_block();
        let cfg = serde_json::json!({ "state": "track" });
        assert!(crate::entity::config_from_json(&mut sh, &cfg).is_err());
    }
}
