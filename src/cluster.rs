//! A cluster: the U/C/I interconnect plus up to two M blocks and the SH
//! stage, sharing one backplane. Signal paths compose as U output to C lane
//! to I input, with equal indices referring to the same lane.

use serde_json::{Map, Value};

use crate::{Error, Result};
use crate::blocks::{CBlock, IBlock, MBlock, ShBlock, UBlock};
use crate::blocks::cblock;
use crate::blocks::ublock::TransmissionMode;
use crate::bus::{
    self, Bus, C_BLOCK_SLOT, I_BLOCK_SLOT, M0_BLOCK_SLOT, M1_BLOCK_SLOT,
    SH_BLOCK_SLOT, U_BLOCK_SLOT,
};
use crate::entity::{
    self, Entity, EntityClass, EntityClassifier, Version,
};

/// Lanes 24..31 connect to the front-panel ports.
pub const EXTERNAL_LANE_BASE: usize = 24;
pub const NUM_EXTERNAL_LANES: usize = 8;

/// Default coefficient for externally routed signals, keeping the outputs
/// within the +-1 V port range.
pub const EXTERNAL_C_FACTOR: f32 = 0.5;

#[derive(Debug)]
pub struct Cluster {
    id: String,
    cluster_idx: u8,
    pub ublock: UBlock,
    pub cblock: CBlock,
    pub iblock: IBlock,
    pub m0block: Option<MBlock>,
    pub m1block: Option<MBlock>,
    pub shblock: Option<ShBlock>,
}

impl Cluster {
    /// Probe every block slot of the cluster, constructing drivers for the
    /// identities found. U, C and I are mandatory, as is at least one M
    /// block; the SH stage is probed but optional.
    pub fn detect(bus: &mut Bus, cluster_idx: u8) -> Result<Cluster> {
        log::debug!("detecting blocks of cluster {}", cluster_idx);
        let slot_address = |slot| bus::block_address(cluster_idx, slot);

        let (classifier, eui) = entity::read_identity(bus, slot_address(U_BLOCK_SLOT))?;
        let ublock = UBlock::from_classifier(classifier, eui, slot_address(U_BLOCK_SLOT))
            .ok_or(Error::NotDetected(slot_address(U_BLOCK_SLOT)))?;

        let (classifier, eui) = entity::read_identity(bus, slot_address(C_BLOCK_SLOT))?;
        let cblock = CBlock::from_classifier(classifier, eui, slot_address(C_BLOCK_SLOT))
            .ok_or(Error::NotDetected(slot_address(C_BLOCK_SLOT)))?;

        let (classifier, eui) = entity::read_identity(bus, slot_address(I_BLOCK_SLOT))?;
        let iblock = IBlock::from_classifier(classifier, eui, slot_address(I_BLOCK_SLOT))
            .ok_or(Error::NotDetected(slot_address(I_BLOCK_SLOT)))?;

        let detect_m = |bus: &mut Bus, slot: u8| -> Option<MBlock> {
            let address = slot_address(slot);
            match entity::read_identity(bus, address) {
                Ok((classifier, eui)) => {
                    let block = MBlock::from_classifier(classifier, eui, address);
                    if block.is_none() {
                        log::warn!("unsupported M block {:?} at {:?}", classifier, address);
                    }
                    block
                }
                Err(_) => None,
            }
        };
        let m0block = detect_m(bus, M0_BLOCK_SLOT);
        let m1block = detect_m(bus, M1_BLOCK_SLOT);
        if m0block.is_none() && m1block.is_none() {
            log::error!("cluster {}: both M slots are empty or unknown", cluster_idx);
            return Err(Error::NotDetected(slot_address(M0_BLOCK_SLOT)));
        }

        let shblock = match entity::read_identity(bus, slot_address(SH_BLOCK_SLOT)) {
            Ok((classifier, eui)) => ShBlock::from_classifier(classifier, eui,
                slot_address(SH_BLOCK_SLOT)),
            Err(_) => {
                log::warn!("cluster {}: SH block is missing", cluster_idx);
                None
            }
        };

        let mut cluster = Cluster {
            id: cluster_idx.to_string(),
            cluster_idx,
            ublock,
            cblock,
            iblock,
            m0block,
            m1block,
            shblock,
        };
        cluster.init(bus)?;
        Ok(cluster)
    }

    fn init(&mut self, bus: &mut Bus) -> Result<()> {
        for mblock in [&mut self.m0block, &mut self.m1block].into_iter().flatten() {
            match mblock {
                MBlock::Int(block) => block.init(bus)?,
                MBlock::Mul(block) => block.init(bus)?,
            }
        }
        self.reset(false);
        // The I-block matrix survives power cycles; flush the cleared state.
        Entity::write_to_hardware(self, bus)
    }

    pub fn cluster_idx(&self) -> u8 {
        self.cluster_idx
    }

    /// The M block at `slot_idx` (0 or 1), if one is installed.
    pub fn mblock(&mut self, slot_idx: usize) -> Option<&mut MBlock> {
        match slot_idx {
            0 => self.m0block.as_mut(),
            1 => self.m1block.as_mut(),
            _ => None,
        }
    }

    /// Register a route through the cluster: U input `u_in` appears on lane
    /// `u_out`, scaled by `c_factor`, summed into I output `i_out`. Only
    /// the in-memory representation changes until `write_to_hardware`.
    pub fn route(&mut self, u_in: usize, u_out: usize, c_factor: f32, i_out: usize)
            -> Result<()> {
        self.ublock.connect(u_in, u_out, false)?;
        self.cblock.set_factor(u_out, c_factor)?;
        self.iblock.connect(u_out, i_out, false, false)
    }

    /// Route a constant from the reference rail instead of a U input.
    pub fn add_constant(&mut self, mode: TransmissionMode, u_out: usize, c_factor: f32,
            i_out: usize) -> Result<()> {
        self.ublock.connect_alternative(mode, u_out, false, false)?;
        self.cblock.set_factor(u_out, c_factor)?;
        self.iblock.connect(u_out, i_out, false, false)
    }

    /// Feed front-panel input `input` into I output `i_out`.
    pub fn route_in_external(&mut self, input: usize, i_out: usize) -> Result<()> {
        if input >= NUM_EXTERNAL_LANES {
            return Err(Error::Config(format!("external input {} out of range", input)));
        }
        self.iblock.connect(EXTERNAL_LANE_BASE + input, i_out, false, false)
    }

    /// Put U input `u_in` onto front-panel output `output`. The default
    /// coefficient of 0.5 keeps the port within +-1 V.
    pub fn route_out_external(&mut self, u_in: usize, output: usize, c_factor: f32)
            -> Result<()> {
        if output >= NUM_EXTERNAL_LANES {
            return Err(Error::Config(format!("external output {} out of range", output)));
        }
        self.ublock.connect(u_in, EXTERNAL_LANE_BASE + output, false)?;
        self.cblock.set_factor(EXTERNAL_LANE_BASE + output, c_factor)
    }

    /// Return all blocks to defaults. Calibration state (gain corrections,
    /// offset trims, multiplier trims) survives when `keep_calibration`.
    pub fn reset(&mut self, keep_calibration: bool) {
        self.ublock.reset(keep_calibration);
        self.cblock.reset(keep_calibration);
        self.iblock.reset(keep_calibration);
        for mblock in [&mut self.m0block, &mut self.m1block].into_iter().flatten() {
            mblock.reset(keep_calibration);
        }
        if let Some(shblock) = &mut self.shblock {
            shblock.reset(keep_calibration);
        }
    }

    /// Mirror the coefficient magnitudes into the I-block upscale bits.
    fn sync_upscaling(&mut self) {
        for lane in 0..cblock::NUM_COEFF {
            let upscale = self.cblock.needs_upscaling(lane);
            // Lane indices are aligned between the two blocks.
            let _ = self.iblock.set_upscaling(lane, upscale);
        }
    }
}

impl Entity for Cluster {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn classifier(&self) -> EntityClassifier {
        // Clusters carry no identity memory of their own.
        EntityClassifier::new(EntityClass::Cluster, 1, Version::new(1, 0, 0), 0)
    }

    fn children(&self) -> Vec<&dyn Entity> {
        let mut children: Vec<&dyn Entity> = Vec::new();
        if let Some(m0block) = &self.m0block {
            children.push(m0block);
        }
        if let Some(m1block) = &self.m1block {
            children.push(m1block);
        }
        children.push(&self.ublock);
        children.push(&self.cblock);
        children.push(&self.iblock);
        if let Some(shblock) = &self.shblock {
            children.push(shblock);
        }
        children
    }

    fn child_entity_mut(&mut self, id: &str) -> Option<&mut dyn Entity> {
        match id {
            "U" => Some(&mut self.ublock),
            "C" => Some(&mut self.cblock),
            "I" => Some(&mut self.iblock),
            "M0" => self.m0block.as_mut().map(|block| block as &mut dyn Entity),
            "M1" => self.m1block.as_mut().map(|block| block as &mut dyn Entity),
            "SH" => self.shblock.as_mut().map(|block| block as &mut dyn Entity),
            _ => None,
        }
    }

    fn config_self_from_json(&mut self, _cfg: &Map<String, Value>) -> Result<()> {
        // The cluster itself has no configuration; everything lives in the
        // blocks below it.
        Ok(())
    }

    fn config_self_to_json(&self, _cfg: &mut Map<String, Value>) {}

    /// Flush all blocks in fixed order: U, C, I, M0, M1, SH.
    fn write_to_hardware(&mut self, bus: &mut Bus) -> Result<()> {
        self.sync_upscaling();
        self.ublock.write_to_hardware(bus)?;
        self.cblock.write_to_hardware(bus)?;
        self.iblock.write_to_hardware(bus)?;
        for mblock in [&mut self.m0block, &mut self.m1block].into_iter().flatten() {
            mblock.write_to_hardware(bus)?;
        }
        if let Some(shblock) = &mut self.shblock {
            shblock.write_to_hardware(bus)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::sys::mock::MockDriver;

    pub fn detected_cluster() -> (MockDriver, Bus, Cluster) {
        let driver = MockDriver::new();
        driver.install_standard_chassis();
        let mut bus = Bus::new(Box::new(driver.clone())).unwrap();
        let cluster = Cluster::detect(&mut bus, 0).unwrap();
        (driver, bus, cluster)
    }

    #[test]
    fn test_detection_finds_all_blocks() {
        let (_driver, _bus, cluster) = detected_cluster();
        assert!(cluster.m0block.is_some());
        assert!(cluster.m1block.is_some());
        assert!(cluster.shblock.is_some());
        assert!(matches!(cluster.m0block, Some(MBlock::Int(_))));
        assert!(matches!(cluster.m1block, Some(MBlock::Mul(_))));
    }

    #[test]
    fn test_missing_mandatory_block_fails() {
        let driver = MockDriver::new();
        driver.install_standard_chassis();
        // Wipe the C block's identity.
        driver.install_module(bus::block_baddr(0, C_BLOCK_SLOT), [0; 256]);
        let mut bus = Bus::new(Box::new(driver)).unwrap();
        assert!(matches!(Cluster::detect(&mut bus, 0), Err(Error::NotDetected(_))));
    }

    #[test]
    fn test_missing_m_blocks_fail() {
        let driver = MockDriver::new();
        driver.install_standard_chassis();
        driver.install_module(bus::block_baddr(0, M0_BLOCK_SLOT), [0; 256]);
        driver.install_module(bus::block_baddr(0, M1_BLOCK_SLOT), [0; 256]);
        let mut bus = Bus::new(Box::new(driver)).unwrap();
        assert!(Cluster::detect(&mut bus, 0).is_err());
    }

    #[test]
    fn test_missing_sh_block_tolerated() {
        let driver = MockDriver::new();
        driver.install_standard_chassis();
        driver.install_module(bus::block_baddr(0, SH_BLOCK_SLOT), [0; 256]);
        let mut bus = Bus::new(Box::new(driver)).unwrap();
        let cluster = Cluster::detect(&mut bus, 0).unwrap();
        assert!(cluster.shblock.is_none());
    }

    #[test]
    fn test_route_composes_three_blocks() {
        let (_driver, _bus, mut cluster) = detected_cluster();
        cluster.route(2, 5, 0.5, 3).unwrap();
        assert!(cluster.ublock.is_connected(2, 5));
        assert_eq!(cluster.cblock.factor(5), 0.5);
        assert!(cluster.iblock.is_connected(5, 3));
    }

    #[test]
    fn test_route_upscale_syncs_iblock(){
        let (_driver, mut bus, mut cluster) = detected_cluster();
        cluster.route(0, 1, 5.0, 0).unwrap();
        Entity::write_to_hardware(&mut cluster, &mut bus).unwrap();
        assert!(cluster.iblock.get_upscaling(1));
        // Shrinking the factor clears the bit again on the next flush.
        cluster.cblock.set_factor(1, 1.0).unwrap();
        Entity::write_to_hardware(&mut cluster, &mut bus).unwrap();
        assert!(!cluster.iblock.get_upscaling(1));
    }

    #[test]
    fn test_add_constant() {
        let (_driver, _bus, mut cluster) = detected_cluster();
        cluster.add_constant(TransmissionMode::PosRef, 4, 1.0, 2).unwrap();
        assert!(cluster.ublock.is_connected(15, 4));
        assert!(cluster.iblock.is_connected(4, 2));
    }

    #[test]
    fn test_external_routes() {
        let (_driver, _bus, mut cluster) = detected_cluster();
        cluster.route_in_external(0, 7).unwrap();
        assert!(cluster.iblock.is_connected(EXTERNAL_LANE_BASE, 7));
        cluster.route_out_external(3, 1, EXTERNAL_C_FACTOR).unwrap();
        assert!(cluster.ublock.is_connected(3, EXTERNAL_LANE_BASE + 1));
        assert_eq!(cluster.cblock.factor(EXTERNAL_LANE_BASE + 1), EXTERNAL_C_FACTOR);
        assert!(cluster.route_in_external(8, 0).is_err());
    }

    #[test]
    fn test_reset_keep_calibration() {
        let (_driver, _bus, mut cluster) = detected_cluster();
        cluster.route(1, 2, 1.5, 3).unwrap();
        cluster.cblock.set_gain_correction(2, 1.05).unwrap();
        cluster.reset(true);
        assert!(!cluster.ublock.is_anything_connected());
        assert!(!cluster.iblock.is_anything_connected());
        assert_eq!(cluster.cblock.factor(2), 0.0);
        assert_eq!(cluster.cblock.gain_corrections()[2], 1.05);
    }

    #[test]
    fn test_config_tree_recursion() {
        let (_driver, _bus, mut cluster) = detected_cluster();
        let cfg = serde_json::json!({
            "/C": { "elements": { "5": 0.5 } },
            "/I": { "outputs": [[], [], [], [], [], [5], [], [], [], [], [], [], [], [], [], []] },
        });
        entity::config_from_json(&mut cluster, &cfg).unwrap();
        assert_eq!(cluster.cblock.factor(5), 0.5);
        assert!(cluster.iblock.is_connected(5, 5));

        let serialized = entity::config_to_json(&cluster, true);
        assert_eq!(serialized["/C"]["elements"][5], 0.5);
        assert!(serialized.get("/U").is_some());
        assert!(serialized.get("/SH").is_some());
    }

    #[test]
    fn test_unknown_child_rejected() {
        let (_driver, _bus, mut cluster) = detected_cluster();
        let cfg = serde_json::json!({ "/X": {} });
        assert!(entity::config_from_json(&mut cluster, &cfg).is_err());
    }
}
