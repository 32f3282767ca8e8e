//! C block: 32 coefficient lanes, one 12-bit multiplying DAC each.
//!
//! A lane accepts any coefficient in [-20, +20]. Values beyond the DAC's
//! native [-2, +2] range rely on the I block multiplying that lane's input
//! by ten; the cluster keeps the upscale bits in sync with the stored
//! coefficients before every flush. A per-lane gain correction from the
//! calibration is applied just before conversion to raw codes.

use serde_json::{Map, Value};

use crate::{Error, Result};
use crate::bus::{Address, Bus};
use crate::chips::mdac::Mdac12;
use crate::entity::{Entity, EntityClass, EntityClassifier, Eui64, Version};

pub const NUM_COEFF: usize = 32;

pub const MAX_FACTOR: f32 = 20.0;
/// Largest magnitude the DAC covers without the I-block upscale.
pub const MAX_REAL_FACTOR: f32 = 2.0;
/// Effective gain of the upscale path.
pub const UPSCALING: f32 = 10.055;

const COEFF_BASE_FADDR: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CBlockVariant {
    SequentialAddresses = 1,
    MixedAddresses = 2,
}

/// Hardware revisions differ only in how lane indices map to function
/// addresses.
#[derive(Debug)]
pub enum CBlockHal {
    Sequential { coeffs: [Mdac12; NUM_COEFF] },
    Mixed { coeffs: [Mdac12; NUM_COEFF] },
}

impl CBlockHal {
    fn sequential(block: Address) -> CBlockHal {
        CBlockHal::Sequential {
            coeffs: std::array::from_fn(|lane| {
                Mdac12::new(block.with_faddr(COEFF_BASE_FADDR + lane as u8))
            }),
        }
    }

    fn mixed(block: Address) -> CBlockHal {
        // Lanes 15..31 answer at function addresses 32.., lane 31 at 17.
        CBlockHal::Mixed {
            coeffs: std::array::from_fn(|lane| {
                let faddr = match lane {
                    0..=14 => COEFF_BASE_FADDR + lane as u8,
                    15..=30 => COEFF_BASE_FADDR + 31 + (lane as u8 - 15),
                    _ => COEFF_BASE_FADDR + 16,
                };
                Mdac12::new(block.with_faddr(faddr))
            }),
        }
    }

    fn write_lane(&self, bus: &mut Bus, lane: usize, raw: u16) -> Result<()> {
        match self {
            Self::Sequential { coeffs } | Self::Mixed { coeffs } =>
                coeffs[lane].set_scale_raw(bus, raw),
        }
    }
}

#[derive(Debug)]
pub struct CBlock {
    classifier: EntityClassifier,
    eui: Eui64,
    hal: CBlockHal,
    factors: [f32; NUM_COEFF],
    gain_corrections: [f32; NUM_COEFF],
}

impl CBlock {
    pub const TYPE: u8 = 1;

    pub fn from_classifier(classifier: EntityClassifier, eui: Eui64, block: Address)
            -> Option<CBlock> {
        if classifier.class != EntityClass::CBlock || classifier.type_ != Self::TYPE {
            return None;
        }
        if classifier.version < Version::new(1, 0, 0)
                || classifier.version >= Version::new(2, 0, 0) {
            return None;
        }
        let hal = match classifier.variant {
            variant if variant == CBlockVariant::SequentialAddresses as u8 =>
                CBlockHal::sequential(block),
            variant if variant == CBlockVariant::MixedAddresses as u8 =>
                CBlockHal::mixed(block),
            _ => return None,
        };
        Some(CBlock {
            classifier,
            eui,
            hal,
            factors: [0.0; NUM_COEFF],
            gain_corrections: [1.0; NUM_COEFF],
        })
    }

    /// Store a coefficient for `lane`. Only the in-memory representation
    /// changes; `write_to_hardware` flushes it.
    pub fn set_factor(&mut self, lane: usize, factor: f32) -> Result<()> {
        if lane >= NUM_COEFF {
            return Err(Error::Config(format!("C-block lane {} out of range", lane)));
        }
        if !(-MAX_FACTOR..=MAX_FACTOR).contains(&factor) {
            return Err(Error::Config(format!(
                "coefficient {} outside [-{}, {}]", factor, MAX_FACTOR, MAX_FACTOR)));
        }
        self.factors[lane] = factor;
        Ok(())
    }

    pub fn factor(&self, lane: usize) -> f32 {
        self.factors[lane]
    }

    /// Whether the lane's coefficient needs the I-block upscale path.
    pub fn needs_upscaling(&self, lane: usize) -> bool {
        self.factors[lane].abs() > MAX_REAL_FACTOR
    }

    /// The value the DAC actually encodes, after upscale division and gain
    /// correction.
    pub fn effective_dac_factor(&self, lane: usize) -> f32 {
        let factor = if self.needs_upscaling(lane) {
            self.factors[lane] / UPSCALING
        } else {
            self.factors[lane]
        };
        factor * self.gain_corrections[lane]
    }

    pub fn gain_corrections(&self) -> &[f32; NUM_COEFF] {
        &self.gain_corrections
    }

    pub fn set_gain_correction(&mut self, lane: usize, correction: f32) -> Result<()> {
        if lane >= NUM_COEFF {
            return Err(Error::Config(format!("C-block lane {} out of range", lane)));
        }
        // Corrections far from one indicate a broken measurement.
        if !(0.5..=1.5).contains(&correction) {
            return Err(Error::Config(format!(
                "gain correction {} for lane {} out of range", correction, lane)));
        }
        self.gain_corrections[lane] = correction;
        Ok(())
    }

    pub fn reset_gain_corrections(&mut self) {
        self.gain_corrections = [1.0; NUM_COEFF];
    }

    pub fn reset(&mut self, keep_calibration: bool) {
        self.factors = [0.0; NUM_COEFF];
        if !keep_calibration {
            self.reset_gain_corrections();
        }
    }
}

impl Entity for CBlock {
    fn entity_id(&self) -> &str {
        "C"
    }

    fn classifier(&self) -> EntityClassifier {
        self.classifier
    }

    fn eui(&self) -> Option<Eui64> {
        Some(self.eui)
    }

    fn config_self_from_json(&mut self, cfg: &Map<String, Value>) -> Result<()> {
        for (key, value) in cfg {
            match key.as_str() {
                "elements" => match value {
                    Value::Array(elements) => {
                        if elements.len() != NUM_COEFF {
                            return Err(Error::Config(format!(
                                "expected {} coefficients, got {}", NUM_COEFF, elements.len())));
                        }
                        for (lane, element) in elements.iter().enumerate() {
                            if element.is_null() {
                                continue;
                            }
                            let factor = element.as_f64().ok_or_else(|| Error::Config(
                                format!("coefficient {} must be a number", lane)))?;
                            self.set_factor(lane, factor as f32)?;
                        }
                    }
                    Value::Object(elements) => {
                        for (lane_key, element) in elements {
                            let lane: usize = lane_key.parse().map_err(|_| Error::Config(
                                format!("coefficient key '{}' is not an index", lane_key)))?;
                            let factor = element.as_f64().ok_or_else(|| Error::Config(
                                format!("coefficient {} must be a number", lane)))?;
                            self.set_factor(lane, factor as f32)?;
                        }
                    }
                    _ => return Err(Error::Config(
                        "'elements' must be an array or a mapping".into())),
                },
                _ if key.starts_with('/') => (),
                _ => return Err(Error::Config(format!("unknown C-block key '{}'", key))),
            }
        }
        Ok(())
    }

    fn config_self_to_json(&self, cfg: &mut Map<String, Value>) {
        let elements: Vec<Value> = self.factors.iter()
            .map(|&factor| Value::from(factor))
            .collect();
        cfg.insert("elements".into(), Value::Array(elements));
    }

    fn write_to_hardware(&mut self, bus: &mut Bus) -> Result<()> {
        for lane in 0..NUM_COEFF {
            let raw = Mdac12::float_to_raw(self.effective_dac_factor(lane));
            self.hal.write_lane(bus, lane, raw)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entity;

    fn cblock() -> CBlock {
        let classifier = EntityClassifier::new(EntityClass::CBlock, CBlock::TYPE,
            Version::new(1, 0, 0), CBlockVariant::SequentialAddresses as u8);
        CBlock::from_classifier(classifier, Eui64([0; 8]), Address::new(9, 0)).unwrap()
    }

    #[test]
    fn test_unknown_variant_rejected() {
        let classifier = EntityClassifier::new(EntityClass::CBlock, CBlock::TYPE,
            Version::new(1, 0, 0), 9);
        assert!(CBlock::from_classifier(classifier, Eui64([0; 8]), Address::new(9, 0)).is_none());
    }

    #[test]
    fn test_factor_bounds() {
        let mut cblock = cblock();
        cblock.set_factor(0, 20.0).unwrap();
        cblock.set_factor(0, -20.0).unwrap();
        assert!(cblock.set_factor(0, 20.1).is_err());
        assert!(cblock.set_factor(32, 1.0).is_err());
    }

    #[test]
    fn test_upscale_boundary() {
        let mut cblock = cblock();
        cblock.set_factor(3, 2.0001).unwrap();
        assert!(cblock.needs_upscaling(3));
        let effective = cblock.effective_dac_factor(3);
        assert!((effective - 0.199).abs() < 0.001, "effective {}", effective);

        cblock.set_factor(3, 2.0).unwrap();
        assert!(!cblock.needs_upscaling(3));
        assert_eq!(cblock.effective_dac_factor(3), 2.0);
    }

    #[test]
    fn test_gain_correction_applies_before_conversion() {
        let mut cblock = cblock();
        cblock.set_factor(1, 1.0).unwrap();
        cblock.set_gain_correction(1, 1.25).unwrap();
        assert!((cblock.effective_dac_factor(1) - 1.25).abs() < 1e-6);
        // The stored coefficient is unchanged.
        assert_eq!(cblock.factor(1), 1.0);
    }

    #[test]
    fn test_gain_correction_bounds() {
        let mut cblock = cblock();
        assert!(cblock.set_gain_correction(0, 0.4).is_err());
        assert!(cblock.set_gain_correction(0, 1.6).is_err());
    }

    #[test]
    fn test_reset_keeps_calibration() {
        let mut cblock = cblock();
        cblock.set_factor(2, 1.5).unwrap();
        cblock.set_gain_correction(2, 1.1).unwrap();
        cblock.reset(true);
        assert_eq!(cblock.factor(2), 0.0);
        assert_eq!(cblock.gain_corrections()[2], 1.1);
        cblock.reset(false);
        assert_eq!(cblock.gain_corrections()[2], 1.0);
    }

    #[test]
    fn test_config_round_trip() {
        let mut cblock = cblock();
        let mut elements = vec![Value::Null; NUM_COEFF];
        elements[5] = Value::from(0.5);
        let cfg = serde_json::json!({ "elements": elements });
        entity::config_from_json(&mut cblock, &cfg).unwrap();
        assert_eq!(cblock.factor(5), 0.5);

        let serialized = entity::config_to_json(&cblock, false);
        assert_eq!(serialized["elements"][5], 0.5);
        assert_eq!(serialized["elements"].as_array().unwrap().len(), NUM_COEFF);
    }

    #[test]
    fn test_config_mapping() {
        let mut cblock = cblock();
        let cfg = serde_json::json!({ "elements": { "7": -1.25 } });
        entity::config_from_json(&mut cblock, &cfg).unwrap();
        assert_eq!(cblock.factor(7), -1.25);
        assert_eq!(cblock.factor(0), 0.0);
    }

    #[test]
    fn test_mixed_addresses_layout() {
        let classifier = EntityClassifier::new(EntityClass::CBlock, CBlock::TYPE,
            Version::new(1, 0, 0), CBlockVariant::MixedAddresses as u8);
        let cblock = CBlock::from_classifier(
            classifier, Eui64([0; 8]), Address::new(9, 0)).unwrap();
        assert!(matches!(cblock.hal, CBlockHal::Mixed { .. }));
    }
}
