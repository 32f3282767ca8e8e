//! M blocks: the computing elements behind the interconnect.
//!
//! Two slots per cluster. The integrator block carries eight integrators
//! with per-element initial condition and time factor; the multiplier block
//! carries four analog multipliers that need no signal configuration but
//! hold three calibration trims each.

use serde_json::{Map, Value};

use crate::{Error, Result};
use crate::bus::{Address, Bus, M0_BLOCK_SLOT};
use crate::chips::dac::Dac60508;
use crate::chips::shiftreg::ShiftRegister;
use crate::entity::{
    DEFAULT_VARIANT, Entity, EntityClass, EntityClassifier, Eui64, Version,
};

pub const NUM_INTEGRATORS: usize = 8;
pub const NUM_MULTIPLIERS: usize = 4;
pub const DEFAULT_TIME_FACTOR: u32 = 10_000;

/// Lanes per M slot; slot M0 covers lanes 0..8, M1 lanes 8..16.
pub const SLOT_WIDTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MSlot {
    M0,
    M1,
}

impl MSlot {
    pub fn from_baddr(baddr: u8) -> MSlot {
        if baddr % 8 == M0_BLOCK_SLOT {
            MSlot::M0
        } else {
            MSlot::M1
        }
    }

    pub fn entity_id(self) -> &'static str {
        match self {
            Self::M0 => "M0",
            Self::M1 => "M1",
        }
    }

    /// Map an element index within the slot to the cluster-wide lane.
    pub fn lane(self, element: usize) -> usize {
        match self {
            Self::M0 => element,
            Self::M1 => element + SLOT_WIDTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MBlockType {
    Int8 = 1,
    Mul4 = 2,
}

/// Either kind of math block, dispatched by the detected type.
#[derive(Debug)]
pub enum MBlock {
    Int(MIntBlock),
    Mul(MMulBlock),
}

impl MBlock {
    pub fn from_classifier(classifier: EntityClassifier, eui: Eui64, block: Address)
            -> Option<MBlock> {
        if classifier.class != EntityClass::MBlock {
            return None;
        }
        match classifier.type_ {
            type_ if type_ == MBlockType::Int8 as u8 =>
                MIntBlock::from_classifier(classifier, eui, block).map(MBlock::Int),
            type_ if type_ == MBlockType::Mul4 as u8 =>
                MMulBlock::from_classifier(classifier, eui, block).map(MBlock::Mul),
            _ => None,
        }
    }

    pub fn slot(&self) -> MSlot {
        match self {
            Self::Int(block) => block.slot,
            Self::Mul(block) => block.slot,
        }
    }

    pub fn as_int_mut(&mut self) -> Option<&mut MIntBlock> {
        match self {
            Self::Int(block) => Some(block),
            Self::Mul(_) => None,
        }
    }

    pub fn as_mul_mut(&mut self) -> Option<&mut MMulBlock> {
        match self {
            Self::Int(_) => None,
            Self::Mul(block) => Some(block),
        }
    }

    pub fn reset(&mut self, keep_calibration: bool) {
        match self {
            Self::Int(block) => block.reset(keep_calibration),
            Self::Mul(block) => block.reset(keep_calibration),
        }
    }
}

impl Entity for MBlock {
    fn entity_id(&self) -> &str {
        self.slot().entity_id()
    }

    fn classifier(&self) -> EntityClassifier {
        match self {
            Self::Int(block) => block.classifier,
            Self::Mul(block) => block.classifier,
        }
    }

    fn eui(&self) -> Option<Eui64> {
        match self {
            Self::Int(block) => Some(block.eui),
            Self::Mul(block) => Some(block.eui),
        }
    }

    fn config_self_from_json(&mut self, cfg: &Map<String, Value>) -> Result<()> {
        match self {
            Self::Int(block) => block.config_self_from_json(cfg),
            Self::Mul(block) => block.config_self_from_json(cfg),
        }
    }

    fn config_self_to_json(&self, cfg: &mut Map<String, Value>) {
        match self {
            Self::Int(block) => block.config_self_to_json(cfg),
            Self::Mul(block) => block.config_self_to_json(cfg),
        }
    }

    fn write_to_hardware(&mut self, bus: &mut Bus) -> Result<()> {
        match self {
            Self::Int(block) => block.write_to_hardware(bus),
            Self::Mul(block) => block.write_to_hardware(bus),
        }
    }
}

#[derive(Debug)]
pub struct MIntBlockHalV10 {
    ic_dac: Dac60508,
    time_factor_register: ShiftRegister,
    time_factor_sync: Address,
}

impl MIntBlockHalV10 {
    fn new(block: Address) -> MIntBlockHalV10 {
        MIntBlockHalV10 {
            ic_dac: Dac60508::new(block.with_faddr(4)),
            time_factor_register: ShiftRegister::new(block.with_faddr(5)),
            time_factor_sync: block.with_faddr(6),
        }
    }
}

#[derive(Debug)]
pub enum MIntBlockHal {
    V10(MIntBlockHalV10),
}

impl MIntBlockHal {
    fn init(&self, bus: &mut Bus) -> Result<()> {
        match self {
            Self::V10(hal) => hal.ic_dac.init(bus),
        }
    }

    fn write_ic(&self, bus: &mut Bus, element: usize, ic: f32) -> Result<()> {
        match self {
            Self::V10(hal) => {
                // The DAC conversion assumes a 2.5 V reference but the board
                // applies 2 V externally, and the output is level-shifted
                // and inverted downstream such that IC = 2 V - output.
                hal.ic_dac.set_channel(bus, element as u8, (ic + 1.0) * 1.25)
            }
        }
    }

    fn write_time_factor_switches(&self, bus: &mut Bus, switches: u8) -> Result<()> {
        match self {
            Self::V10(hal) => {
                hal.time_factor_register.write8(bus, switches)?;
                bus.trigger(hal.time_factor_sync)
            }
        }
    }
}

#[derive(Debug)]
pub struct MIntBlock {
    classifier: EntityClassifier,
    eui: Eui64,
    slot: MSlot,
    hal: MIntBlockHal,
    ic_values: [f32; NUM_INTEGRATORS],
    time_factors: [u32; NUM_INTEGRATORS],
}

impl MIntBlock {
    pub fn from_classifier(classifier: EntityClassifier, eui: Eui64, block: Address)
            -> Option<MIntBlock> {
        if classifier.class != EntityClass::MBlock
                || classifier.type_ != MBlockType::Int8 as u8
                || classifier.variant != DEFAULT_VARIANT {
            return None;
        }
        if classifier.version < Version::new(1, 0, 0)
                || classifier.version >= Version::new(1, 1, 0) {
            return None;
        }
        Some(MIntBlock {
            classifier,
            eui,
            slot: MSlot::from_baddr(block.baddr()),
            hal: MIntBlockHal::V10(MIntBlockHalV10::new(block)),
            ic_values: [0.0; NUM_INTEGRATORS],
            time_factors: [DEFAULT_TIME_FACTOR; NUM_INTEGRATORS],
        })
    }

    pub fn init(&mut self, bus: &mut Bus) -> Result<()> {
        self.hal.init(bus)
    }

    pub fn set_ic_value(&mut self, element: usize, value: f32) -> Result<()> {
        if element >= NUM_INTEGRATORS {
            return Err(Error::Config(format!("integrator {} out of range", element)));
        }
        if !(-1.0..=1.0).contains(&value) {
            return Err(Error::Config(format!(
                "initial condition {} outside [-1, 1]", value)));
        }
        self.ic_values[element] = value;
        Ok(())
    }

    pub fn ic_value(&self, element: usize) -> f32 {
        self.ic_values[element]
    }

    pub fn set_time_factor(&mut self, element: usize, k: u32) -> Result<()> {
        if element >= NUM_INTEGRATORS {
            return Err(Error::Config(format!("integrator {} out of range", element)));
        }
        if k != 100 && k != 10_000 {
            return Err(Error::Config(format!("time factor {} is not 100 or 10000", k)));
        }
        self.time_factors[element] = k;
        Ok(())
    }

    pub fn time_factor(&self, element: usize) -> u32 {
        self.time_factors[element]
    }

    pub fn reset(&mut self, _keep_calibration: bool) {
        self.ic_values = [0.0; NUM_INTEGRATORS];
        self.time_factors = [DEFAULT_TIME_FACTOR; NUM_INTEGRATORS];
    }

    fn config_elements_from_json(&mut self, cfg: &Value) -> Result<()> {
        let apply = |block: &mut Self, element: usize, cfg: &Map<String, Value>| -> Result<()> {
            if let Some(ic) = cfg.get("ic") {
                let ic = ic.as_f64().ok_or_else(|| Error::Config(
                    format!("integrator {} ic must be a number", element)))?;
                block.set_ic_value(element, ic as f32)?;
            }
            if let Some(k) = cfg.get("k") {
                let k = k.as_u64().ok_or_else(|| Error::Config(
                    format!("integrator {} k must be an integer", element)))?;
                block.set_time_factor(element, k as u32)?;
            }
            Ok(())
        };
        match cfg {
            Value::Array(elements) => {
                if elements.len() != NUM_INTEGRATORS {
                    return Err(Error::Config(format!(
                        "expected {} integrator elements, got {}",
                        NUM_INTEGRATORS, elements.len())));
                }
                for (element, element_cfg) in elements.iter().enumerate() {
                    let object = element_cfg.as_object().ok_or_else(|| Error::Config(
                        format!("integrator {} element must be an object", element)))?;
                    apply(self, element, object)?;
                }
                Ok(())
            }
            Value::Object(elements) => {
                for (key, element_cfg) in elements {
                    let element: usize = key.parse().map_err(|_| Error::Config(
                        format!("integrator key '{}' is not an index", key)))?;
                    if element >= NUM_INTEGRATORS {
                        return Err(Error::Config(format!(
                            "integrator {} out of range", element)));
                    }
                    let object = element_cfg.as_object().ok_or_else(|| Error::Config(
                        format!("integrator {} element must be an object", element)))?;
                    apply(self, element, object)?;
                }
                Ok(())
            }
            _ => Err(Error::Config("'elements' must be an array or a mapping".into())),
        }
    }

    fn config_self_from_json(&mut self, cfg: &Map<String, Value>) -> Result<()> {
        for (key, value) in cfg {
            match key.as_str() {
                "elements" => self.config_elements_from_json(value)?,
                _ if key.starts_with('/') => (),
                _ => return Err(Error::Config(format!(
                    "unknown integrator block key '{}'", key))),
            }
        }
        Ok(())
    }

    fn config_self_to_json(&self, cfg: &mut Map<String, Value>) {
        let elements: Vec<Value> = (0..NUM_INTEGRATORS)
            .map(|element| serde_json::json!({
                "ic": self.ic_values[element],
                "k": self.time_factors[element],
            }))
            .collect();
        cfg.insert("elements".into(), Value::Array(elements));
    }

    fn write_to_hardware(&mut self, bus: &mut Bus) -> Result<()> {
        for (element, &ic) in self.ic_values.iter().enumerate() {
            self.hal.write_ic(bus, element, ic)?;
        }
        let mut switches = 0u8;
        for (element, &k) in self.time_factors.iter().enumerate() {
            if k != DEFAULT_TIME_FACTOR {
                switches |= 1 << element;
            }
        }
        self.hal.write_time_factor_switches(bus, switches)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MultiplierCalibration {
    pub offset_x: f32,
    pub offset_y: f32,
    pub offset_z: f32,
}

pub const MAX_MULTIPLIER_OFFSET: f32 = 0.1;

#[derive(Debug)]
pub struct MMulBlockHalV10 {
    input_offset_dac: Dac60508,
    output_offset_dac: Dac60508,
}

impl MMulBlockHalV10 {
    fn new(block: Address) -> MMulBlockHalV10 {
        MMulBlockHalV10 {
            input_offset_dac: Dac60508::new(block.with_faddr(4)),
            output_offset_dac: Dac60508::new(block.with_faddr(5)),
        }
    }
}

#[derive(Debug)]
pub enum MMulBlockHal {
    V10(MMulBlockHalV10),
}

impl MMulBlockHal {
    fn init(&self, bus: &mut Bus) -> Result<()> {
        match self {
            Self::V10(hal) => {
                hal.input_offset_dac.init(bus)?;
                hal.output_offset_dac.init(bus)
            }
        }
    }

    pub fn write_input_offsets(&self, bus: &mut Bus, multiplier: usize,
            offset_x: f32, offset_y: f32) -> Result<()> {
        if offset_x.abs() > MAX_MULTIPLIER_OFFSET || offset_y.abs() > MAX_MULTIPLIER_OFFSET {
            return Err(Error::Config(format!(
                "multiplier {} input offsets ({}, {}) out of range",
                multiplier, offset_x, offset_y)));
        }
        match self {
            Self::V10(hal) => {
                // The 2 V external reference and the inverting I/U
                // converters turn the [-0.1, 0.1] trim into this DAC range.
                hal.input_offset_dac.set_channel(bus, multiplier as u8 * 2 + 1,
                    (offset_x - 0.1) * -12.5)?;
                hal.input_offset_dac.set_channel(bus, multiplier as u8 * 2,
                    (offset_y - 0.1) * -12.5)
            }
        }
    }

    pub fn write_output_offset(&self, bus: &mut Bus, multiplier: usize, offset_z: f32)
            -> Result<()> {
        if offset_z.abs() > MAX_MULTIPLIER_OFFSET {
            return Err(Error::Config(format!(
                "multiplier {} output offset {} out of range", multiplier, offset_z)));
        }
        match self {
            Self::V10(hal) =>
                hal.output_offset_dac.set_channel(bus, multiplier as u8,
                    (offset_z - 0.1) * -12.5),
        }
    }
}

#[derive(Debug)]
pub struct MMulBlock {
    classifier: EntityClassifier,
    eui: Eui64,
    slot: MSlot,
    pub(crate) hal: MMulBlockHal,
    calibration: [MultiplierCalibration; NUM_MULTIPLIERS],
}

impl MMulBlock {
    pub fn from_classifier(classifier: EntityClassifier, eui: Eui64, block: Address)
            -> Option<MMulBlock> {
        if classifier.class != EntityClass::MBlock
                || classifier.type_ != MBlockType::Mul4 as u8
                || classifier.variant != DEFAULT_VARIANT {
            return None;
        }
        if classifier.version < Version::new(1, 0, 0)
                || classifier.version >= Version::new(1, 1, 0) {
            return None;
        }
        Some(MMulBlock {
            classifier,
            eui,
            slot: MSlot::from_baddr(block.baddr()),
            hal: MMulBlockHal::V10(MMulBlockHalV10::new(block)),
            calibration: [MultiplierCalibration::default(); NUM_MULTIPLIERS],
        })
    }

    pub fn init(&mut self, bus: &mut Bus) -> Result<()> {
        self.hal.init(bus)?;
        // Hardware trims power up at random; zero them.
        for multiplier in 0..NUM_MULTIPLIERS {
            self.hal.write_input_offsets(bus, multiplier, 0.0, 0.0)?;
            self.hal.write_output_offset(bus, multiplier, 0.0)?;
        }
        Ok(())
    }

    pub fn calibration(&self) -> &[MultiplierCalibration; NUM_MULTIPLIERS] {
        &self.calibration
    }

    pub(crate) fn calibration_mut(&mut self)
            -> &mut [MultiplierCalibration; NUM_MULTIPLIERS] {
        &mut self.calibration
    }

    pub fn reset(&mut self, keep_calibration: bool) {
        if !keep_calibration {
            self.calibration = [MultiplierCalibration::default(); NUM_MULTIPLIERS];
        }
    }

    fn config_self_from_json(&mut self, cfg: &Map<String, Value>) -> Result<()> {
        for (key, value) in cfg {
            match key.as_str() {
                "calibration" => {
                    let object = value.as_object().ok_or_else(|| Error::Config(
                        "'calibration' must be an object".into()))?;
                    let mut axis = |name: &str| -> Result<Vec<f32>> {
                        let values = object.get(name)
                            .and_then(Value::as_array)
                            .filter(|values| values.len() == NUM_MULTIPLIERS)
                            .ok_or_else(|| Error::Config(format!(
                                "missing {} (need {} entries)", name, NUM_MULTIPLIERS)))?;
                        values.iter()
                            .map(|value| value.as_f64()
                                .map(|value| value as f32)
                                .ok_or_else(|| Error::Config(format!(
                                    "{} entries must be numbers", name))))
                            .collect()
                    };
                    let offset_x = axis("offset_x")?;
                    let offset_y = axis("offset_y")?;
                    let offset_z = axis("offset_z")?;
                    for multiplier in 0..NUM_MULTIPLIERS {
                        if offset_x[multiplier].abs() > MAX_MULTIPLIER_OFFSET
                                || offset_y[multiplier].abs() > MAX_MULTIPLIER_OFFSET
                                || offset_z[multiplier].abs() > MAX_MULTIPLIER_OFFSET {
                            return Err(Error::Config(format!(
                                "multiplier {} offsets out of range", multiplier)));
                        }
                        self.calibration[multiplier] = MultiplierCalibration {
                            offset_x: offset_x[multiplier],
                            offset_y: offset_y[multiplier],
                            offset_z: offset_z[multiplier],
                        };
                    }
                }
                _ if key.starts_with('/') => (),
                _ => return Err(Error::Config(format!(
                    "unknown multiplier block key '{}'", key))),
            }
        }
        Ok(())
    }

    fn config_self_to_json(&self, cfg: &mut Map<String, Value>) {
        cfg.insert("calibration".into(), serde_json::json!({
            "offset_x": self.calibration.map(|trim| trim.offset_x),
            "offset_y": self.calibration.map(|trim| trim.offset_y),
            "offset_z": self.calibration.map(|trim| trim.offset_z),
        }));
    }

    fn write_to_hardware(&mut self, bus: &mut Bus) -> Result<()> {
        for (multiplier, trim) in self.calibration.iter().enumerate() {
            self.hal.write_input_offsets(bus, multiplier, trim.offset_x, trim.offset_y)?;
            self.hal.write_output_offset(bus, multiplier, trim.offset_z)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entity;

    fn int_block() -> MBlock {
        let classifier = EntityClassifier::new(
            EntityClass::MBlock, MBlockType::Int8 as u8, Version::new(1, 0, 0), 0);
        MBlock::from_classifier(classifier, Eui64([0; 8]), Address::new(12, 0)).unwrap()
    }

    fn mul_block() -> MBlock {
        let classifier = EntityClassifier::new(
            EntityClass::MBlock, MBlockType::Mul4 as u8, Version::new(1, 0, 0), 0);
        MBlock::from_classifier(classifier, Eui64([0; 8]), Address::new(13, 0)).unwrap()
    }

    #[test]
    fn test_type_dispatch() {
        assert!(matches!(int_block(), MBlock::Int(_)));
        assert!(matches!(mul_block(), MBlock::Mul(_)));
        assert_eq!(int_block().entity_id(), "M0");
        assert_eq!(mul_block().entity_id(), "M1");
    }

    #[test]
    fn test_slot_lane_mapping() {
        assert_eq!(MSlot::M0.lane(3), 3);
        assert_eq!(MSlot::M1.lane(3), 11);
    }

    #[test]
    fn test_ic_bounds() {
        let mut block = int_block();
        let int = block.as_int_mut().unwrap();
        int.set_ic_value(0, 1.0).unwrap();
        int.set_ic_value(0, -1.0).unwrap();
        assert!(int.set_ic_value(0, 1.01).is_err());
        assert!(int.set_ic_value(8, 0.0).is_err());
    }

    #[test]
    fn test_time_factor_values() {
        let mut block = int_block();
        let int = block.as_int_mut().unwrap();
        int.set_time_factor(1, 100).unwrap();
        int.set_time_factor(1, 10_000).unwrap();
        assert!(int.set_time_factor(1, 1000).is_err());
    }

    #[test]
    fn test_int_config_round_trip() {
        let mut block = int_block();
        let cfg = serde_json::json!({ "elements": { "0": { "ic": 0.5, "k": 100 } } });
        entity::config_from_json(&mut block, &cfg).unwrap();
        {
            let int = block.as_int_mut().unwrap();
            assert_eq!(int.ic_value(0), 0.5);
            assert_eq!(int.time_factor(0), 100);
        }
        let serialized = entity::config_to_json(&block, false);
        assert_eq!(serialized["elements"][0]["ic"], 0.5);
        assert_eq!(serialized["elements"][0]["k"], 100);
        assert_eq!(serialized["elements"][7]["k"], DEFAULT_TIME_FACTOR);
    }

    #[test]
    fn test_ic_write_conditioning() {
        use crate::sys::mock::MockDriver;
        let driver = MockDriver::new();
        let mut bus = Bus::new(Box::new(driver.clone())).unwrap();
        let mut block = int_block();
        block.as_int_mut().unwrap().set_ic_value(0, 1.0).unwrap();
        block.write_to_hardware(&mut bus).unwrap();
        // ic = +1 maps to 2.5 in DAC units, i.e. full scale.
        let writes = driver.writes_to(Address::new(12, 4));
        let dac_write = writes.iter()
            .find(|bytes| bytes[0] == crate::chips::dac::reg_dac(0))
            .unwrap();
        let raw = u16::from_be_bytes([dac_write[1], dac_write[2]]);
        assert_eq!(raw, crate::chips::dac::RAW_TWO_FIVE);
    }

    #[test]
    fn test_time_factor_switch_byte() {
        use crate::sys::mock::MockDriver;
        let driver = MockDriver::new();
        let mut bus = Bus::new(Box::new(driver.clone())).unwrap();
        let mut block = int_block();
        block.as_int_mut().unwrap().set_time_factor(2, 100).unwrap();
        block.write_to_hardware(&mut bus).unwrap();
        let writes = driver.writes_to(Address::new(12, 5));
        assert_eq!(writes.last().unwrap(), &vec![0b0000_0100]);
    }

    #[test]
    fn test_mul_calibration_config() {
        let mut block = mul_block();
        let cfg = serde_json::json!({ "calibration": {
            "offset_x": [0.01, 0.02, 0.03, 0.04],
            "offset_y": [0.0, 0.0, 0.0, 0.0],
            "offset_z": [-0.05, 0.0, 0.0, 0.0],
        }});
        entity::config_from_json(&mut block, &cfg).unwrap();
        let mul = block.as_mul_mut().unwrap();
        assert_eq!(mul.calibration()[0].offset_x, 0.01);
        assert_eq!(mul.calibration()[0].offset_z, -0.05);
    }

    #[test]
    fn test_mul_calibration_rejects_out_of_range() {
        let mut block = mul_block();
        let cfg = serde_json::json!({ "calibration": {
            "offset_x": [0.2, 0.0, 0.0, 0.0],
            "offset_y": [0.0, 0.0, 0.0, 0.0],
            "offset_z": [0.0, 0.0, 0.0, 0.0],
        }});
        assert!(entity::config_from_json(&mut block, &cfg).is_err());
    }

    #[test]
    fn test_mul_reset_keeps_calibration() {
        let mut block = mul_block();
        let mul = block.as_mul_mut().unwrap();
        mul.calibration_mut()[1].offset_x = 0.05;
        mul.reset(true);
        assert_eq!(mul.calibration()[1].offset_x, 0.05);
        mul.reset(false);
        assert_eq!(mul.calibration()[1].offset_x, 0.0);
    }
}
