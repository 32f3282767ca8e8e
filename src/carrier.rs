//! The carrier: root of the entity tree. Owns the clusters, the CTRL
//! block, the ADC channel map and the front-panel ACL switch, and serves
//! the configuration protocol.

use serde_json::{Map, Value};

use crate::{Error, Result};
use crate::blocks::CtrlBlock;
use crate::bus::{Address, Bus, CARRIER_BADDR, CTRL_BADDR};
use crate::chips::shiftreg::ShiftRegister;
use crate::cluster::Cluster;
use crate::entity::{
    self, Entity, EntityClass, EntityClassifier, Eui64, ResetAction,
};
use crate::protocol::Status;

pub const NUM_ADC_CHANNELS: usize = 8;
pub const ADC_CHANNEL_DISABLED: i8 = -1;
/// Highest cluster output routable to an ADC channel.
pub const MAX_ADC_SOURCE: i8 = 15;

pub const NUM_ACL_LANES: usize = 8;

/// Whether a front-panel lane is fed internally or from the panel port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AclMode {
    #[default]
    Internal,
    External,
}

#[derive(Debug)]
struct CarrierHal {
    adc_mux: ShiftRegister,
    adc_mux_latch: Address,
    acl_select: ShiftRegister,
    acl_select_latch: Address,
}

impl CarrierHal {
    fn new() -> CarrierHal {
        let base = Address::new(CARRIER_BADDR, 0);
        CarrierHal {
            adc_mux: ShiftRegister::new(base.with_faddr(2)),
            adc_mux_latch: base.with_faddr(3),
            acl_select: ShiftRegister::new(base.with_faddr(4)),
            acl_select_latch: base.with_faddr(5),
        }
    }

    fn write_adc_mux(&self, bus: &mut Bus, channels: &[i8; NUM_ADC_CHANNELS]) -> Result<()> {
        // One byte per channel: the source index, or the mux's disable code.
        let bytes = channels.map(|channel| {
            if channel >= 0 { channel as u8 } else { 0x80 }
        });
        self.adc_mux.write_bytes(bus, &bytes)?;
        bus.trigger(self.adc_mux_latch)
    }

    fn write_acl_select(&self, bus: &mut Bus, select: &[AclMode; NUM_ACL_LANES]) -> Result<()> {
        let mut bits = 0u8;
        for (lane, &mode) in select.iter().enumerate() {
            if mode == AclMode::External {
                bits |= 1 << lane;
            }
        }
        self.acl_select.write8(bus, bits)?;
        bus.trigger(self.acl_select_latch)
    }
}

#[derive(Debug)]
pub struct Carrier {
    id: String,
    eui: Eui64,
    classifier: EntityClassifier,
    pub clusters: Vec<Cluster>,
    pub ctrl_block: CtrlBlock,
    adc_channels: [i8; NUM_ADC_CHANNELS],
    acl_select: [AclMode; NUM_ACL_LANES],
    hal: CarrierHal,
}

impl Carrier {
    /// Read the carrier's own identity, detect the CTRL block and all
    /// clusters, and bring the hardware into the reset state. Any missing
    /// mandatory piece fails the whole bring-up.
    pub fn detect(bus: &mut Bus, num_clusters: u8) -> Result<Carrier> {
        let (classifier, eui) = entity::read_identity(bus, Address::new(CARRIER_BADDR, 0))?;
        if classifier.class != EntityClass::Carrier {
            return Err(Error::NotDetected(Address::new(CARRIER_BADDR, 0)));
        }

        let (ctrl_classifier, ctrl_eui) =
            entity::read_identity(bus, Address::new(CTRL_BADDR, 0))?;
        let mut ctrl_block = CtrlBlock::from_classifier(ctrl_classifier, ctrl_eui)
            .ok_or(Error::NotDetected(Address::new(CTRL_BADDR, 0)))?;
        ctrl_block.init(bus)?;

        let mut clusters = Vec::with_capacity(num_clusters as usize);
        for cluster_idx in 0..num_clusters {
            clusters.push(Cluster::detect(bus, cluster_idx)?);
        }

        log::info!("carrier {} up with {} cluster(s)", eui, clusters.len());
        Ok(Carrier {
            id: eui.to_string(),
            eui,
            classifier,
            clusters,
            ctrl_block,
            adc_channels: [ADC_CHANNEL_DISABLED; NUM_ADC_CHANNELS],
            acl_select: [AclMode::Internal; NUM_ACL_LANES],
            hal: CarrierHal::new(),
        })
    }

    pub fn adc_channels(&self) -> &[i8; NUM_ADC_CHANNELS] {
        &self.adc_channels
    }

    /// Assign all eight ADC channels at once. Sources must be in range and
    /// distinct; splitting one signal onto two channels is almost always a
    /// mistake, so it is refused.
    pub fn set_adc_channels(&mut self, channels: [i8; NUM_ADC_CHANNELS]) -> Result<()> {
        for &channel in &channels {
            if channel > MAX_ADC_SOURCE {
                return Err(Error::Config(format!("ADC source {} out of range", channel)));
            }
        }
        for (idx, &channel) in channels.iter().enumerate() {
            if channel < 0 {
                continue;
            }
            if channels.iter().skip(idx + 1).any(|&other| other == channel) {
                return Err(Error::Config(format!(
                    "signal {} assigned to more than one ADC channel", channel)));
            }
        }
        self.adc_channels = channels;
        Ok(())
    }

    pub fn set_adc_channel(&mut self, idx: usize, source: i8) -> Result<()> {
        if idx >= NUM_ADC_CHANNELS {
            return Err(Error::Config(format!("ADC channel {} out of range", idx)));
        }
        let source = if source < 0 { ADC_CHANNEL_DISABLED } else { source };
        if source > MAX_ADC_SOURCE {
            return Err(Error::Config(format!("ADC source {} out of range", source)));
        }
        if source != ADC_CHANNEL_DISABLED {
            for (other_idx, &other) in self.adc_channels.iter().enumerate() {
                if other_idx != idx && other == source {
                    return Err(Error::Config(format!(
                        "signal {} already feeds ADC channel {}", source, other_idx)));
                }
            }
        }
        self.adc_channels[idx] = source;
        Ok(())
    }

    pub fn reset_adc_channels(&mut self) {
        self.adc_channels = [ADC_CHANNEL_DISABLED; NUM_ADC_CHANNELS];
    }

    pub fn acl_select(&self) -> &[AclMode; NUM_ACL_LANES] {
        &self.acl_select
    }

    pub fn set_acl_mode(&mut self, lane: usize, mode: AclMode) -> Result<()> {
        if lane >= NUM_ACL_LANES {
            return Err(Error::Config(format!("ACL lane {} out of range", lane)));
        }
        self.acl_select[lane] = mode;
        Ok(())
    }

    pub fn reset(&mut self, action: ResetAction) {
        let keep_calibration = action.keep_calibration();
        if action.contains(ResetAction::CIRCUIT) {
            for cluster in &mut self.clusters {
                cluster.reset(keep_calibration);
            }
            self.ctrl_block.reset(keep_calibration);
            self.reset_adc_channels();
            self.acl_select = [AclMode::Internal; NUM_ACL_LANES];
        }
    }

    /// `set_config` entry point. The error codes are part of the protocol:
    /// 1 malformed message, 2 empty path, 3 foreign carrier, 4 unresolved
    /// path, 5 rejected configuration, 6 failed hardware flush.
    pub fn user_set_config(&mut self, bus: &mut Bus, msg: &Value)
            -> core::result::Result<Value, Status> {
        let (Some(path), Some(config)) = (msg.get("entity"), msg.get("config")) else {
            return Err(Status::new(1, "malformed message"));
        };
        let path = parse_path(path).ok_or_else(|| Status::new(1, "malformed message"))?;
        if path.is_empty() {
            return Err(Status::new(2, "invalid entity path"));
        }
        if path[0] != self.id {
            return Err(Status::new(3, format!(
                "message intended for carrier {} but I am {}", path[0], self.id)));
        }

        let target = entity::resolve_child_mut(self, &path[1..])
            .ok_or_else(|| Status::new(4, "no entity at that path"))?;
        entity::config_from_json(target, config)
            .map_err(|error| Status::new(5, error.to_string()))?;

        self.write_to_hardware(bus)
            .map_err(|error| Status::new(6, error.to_string()))?;

        // Echo the configuration as applied.
        let target = entity::resolve_child_mut(self, &path[1..])
            .ok_or_else(|| Status::new(4, "no entity at that path"))?;
        Ok(serde_json::json!({
            "entity": msg["entity"],
            "config": entity::config_to_json(target, true),
        }))
    }

    /// `get_config` entry point.
    pub fn user_get_config(&mut self, msg: &Value) -> core::result::Result<Value, Status> {
        let recursive = msg.get("recursive").and_then(Value::as_bool).unwrap_or(true);
        let target: &dyn Entity = match msg.get("entity") {
            None | Some(Value::Null) => self,
            Some(path) => {
                let path = parse_path(path)
                    .ok_or_else(|| Status::new(3, "entity path is not a list"))?;
                if path.is_empty() {
                    self
                } else if path[0] != self.id {
                    return Err(Status::new(1, format!(
                        "requested entity {} but I am {}", path[0], self.id)));
                } else {
                    entity::resolve_child_mut(self, &path[1..])
                        .ok_or_else(|| Status::new(2, "cannot resolve entity path"))?
                }
            }
        };
        let config = entity::config_to_json(target, recursive);
        Ok(serde_json::json!({
            "entity": msg.get("entity").cloned().unwrap_or(Value::Null),
            "config": config,
        }))
    }

    /// `get_entities` entry point: the classifier tree keyed by EUI.
    pub fn get_entities(&self) -> Value {
        let mut entities = Map::new();
        entities.insert(self.id.clone(), entity::classifier_tree(self));
        serde_json::json!({ "entities": entities })
    }

    /// `reset` entry point.
    pub fn user_reset(&mut self, bus: &mut Bus, msg: &Value)
            -> core::result::Result<Value, Status> {
        let flag = |name: &str, default| {
            msg.get(name).and_then(Value::as_bool).unwrap_or(default)
        };
        let mut action = ResetAction::empty();
        if !flag("keep_calibration", true) {
            action |= ResetAction::CALIBRATION;
        }
        if flag("overload_reset", true) {
            action |= ResetAction::OVERLOAD;
        }
        if flag("circuit_reset", true) {
            action |= ResetAction::CIRCUIT;
        }
        self.reset(action);
        if flag("sync", true) {
            self.write_to_hardware(bus)
                .map_err(|error| Status::new(6, error.to_string()))?;
        }
        Ok(serde_json::json!({}))
    }
}

fn parse_path(path: &Value) -> Option<Vec<String>> {
    path.as_array()?.iter()
        .map(|segment| segment.as_str().map(str::to_owned))
        .collect()
}

impl Entity for Carrier {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn classifier(&self) -> EntityClassifier {
        self.classifier
    }

    fn eui(&self) -> Option<Eui64> {
        Some(self.eui)
    }

    fn children(&self) -> Vec<&dyn Entity> {
        self.clusters.iter().map(|cluster| cluster as &dyn Entity).collect()
    }

    fn child_entity_mut(&mut self, id: &str) -> Option<&mut dyn Entity> {
        let cluster_idx: usize = id.parse().ok()?;
        self.clusters.get_mut(cluster_idx).map(|cluster| cluster as &mut dyn Entity)
    }

    fn config_self_from_json(&mut self, cfg: &Map<String, Value>) -> Result<()> {
        for key in cfg.keys() {
            if !key.starts_with('/') && key != "adc_channels" {
                return Err(Error::Config(format!("unknown carrier key '{}'", key)));
            }
        }
        if let Some(channels) = cfg.get("adc_channels") {
            let channels = channels.as_array()
                .filter(|channels| channels.len() == NUM_ADC_CHANNELS)
                .ok_or_else(|| Error::Config(format!(
                    "'adc_channels' must be an array of {}", NUM_ADC_CHANNELS)))?;
            let mut parsed = [ADC_CHANNEL_DISABLED; NUM_ADC_CHANNELS];
            for (idx, channel) in channels.iter().enumerate() {
                parsed[idx] = match channel {
                    Value::Null => ADC_CHANNEL_DISABLED,
                    _ => channel.as_i64().ok_or_else(|| Error::Config(
                        format!("ADC channel {} must be a number or null", idx)))? as i8,
                };
            }
            self.set_adc_channels(parsed)?;
        }
        Ok(())
    }

    fn config_self_to_json(&self, cfg: &mut Map<String, Value>) {
        let channels: Vec<Value> = self.adc_channels.iter()
            .map(|&channel| if channel >= 0 { Value::from(channel) } else { Value::Null })
            .collect();
        cfg.insert("adc_channels".into(), Value::Array(channels));
    }

    fn write_to_hardware(&mut self, bus: &mut Bus) -> Result<()> {
        for cluster in &mut self.clusters {
            cluster.write_to_hardware(bus)?;
        }
        self.ctrl_block.write_to_hardware(bus)?;
        self.hal.write_adc_mux(bus, &self.adc_channels)?;
        self.hal.write_acl_select(bus, &self.acl_select)
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::sys::mock::MockDriver;

    pub fn detected_carrier() -> (MockDriver, Bus, Carrier) {
        let driver = MockDriver::new();
        driver.install_standard_chassis();
        let mut bus = Bus::new(Box::new(driver.clone())).unwrap();
        let carrier = Carrier::detect(&mut bus, 1).unwrap();
        (driver, bus, carrier)
    }

    #[test]
    fn test_detection() {
        let (_driver, _bus, carrier) = detected_carrier();
        assert_eq!(carrier.clusters.len(), 1);
        assert_eq!(carrier.entity_id(), "04-e9-e5-00-00-00-00-01");
    }

    #[test]
    fn test_missing_ctrl_block_fails() {
        let driver = MockDriver::new();
        driver.install_standard_chassis();
        driver.install_module(CTRL_BADDR, [0; 256]);
        let mut bus = Bus::new(Box::new(driver)).unwrap();
        assert!(Carrier::detect(&mut bus, 1).is_err());
    }

    #[test]
    fn test_adc_channel_duplicates_rejected() {
        let (_driver, _bus, mut carrier) = detected_carrier();
        let mut channels = [ADC_CHANNEL_DISABLED; NUM_ADC_CHANNELS];
        channels[0] = 3;
        channels[4] = 3;
        assert!(carrier.set_adc_channels(channels).is_err());
        channels[4] = 4;
        carrier.set_adc_channels(channels).unwrap();
        assert!(carrier.set_adc_channel(1, 4).is_err());
        carrier.set_adc_channel(1, 5).unwrap();
        assert_eq!(carrier.adc_channels()[1], 5);
    }

    #[test]
    fn test_adc_channel_range() {
        let (_driver, _bus, mut carrier) = detected_carrier();
        let mut channels = [ADC_CHANNEL_DISABLED; NUM_ADC_CHANNELS];
        channels[0] = 16;
        assert!(carrier.set_adc_channels(channels).is_err());
    }

    #[test]
    fn test_get_entities_shape() {
        let (_driver, _bus, carrier) = detected_carrier();
        let entities = carrier.get_entities();
        let root = &entities["entities"]["04-e9-e5-00-00-00-00-01"];
        assert_eq!(root["class"], EntityClass::Carrier as u8);
        assert_eq!(root["type"], 1);
        assert_eq!(root["version"], serde_json::json!([1, 0, 0]));
        assert_eq!(root["variant"], 0);
        let cluster = &root["/0"];
        assert_eq!(cluster["class"], EntityClass::Cluster as u8);
        for block in ["/U", "/C", "/I"] {
            assert!(cluster.get(block).is_some(), "missing {}", block);
        }
    }

    #[test]
    fn test_set_config_route_and_read_back() {
        let (_driver, mut bus, mut carrier) = detected_carrier();
        let mut u_outputs = vec![Value::Null; 32];
        u_outputs[5] = Value::from(2);
        let mut c_elements = vec![Value::Null; 32];
        c_elements[5] = Value::from(0.5);
        let mut i_outputs = vec![serde_json::json!([]); 16];
        i_outputs[5] = serde_json::json!([5]);
        let msg = serde_json::json!({
            "entity": [carrier.entity_id(), "0"],
            "config": {
                "/U": { "outputs": u_outputs },
                "/C": { "elements": c_elements },
                "/I": { "outputs": i_outputs },
            },
        });
        carrier.user_set_config(&mut bus, &msg).unwrap();

        let get = serde_json::json!({ "entity": [carrier.entity_id(), "0", "U"] });
        let response = carrier.user_get_config(&get).unwrap();
        assert_eq!(response["config"]["outputs"][5], 2);
    }

    #[test]
    fn test_set_config_error_codes() {
        let (_driver, mut bus, mut carrier) = detected_carrier();
        let code = |result: core::result::Result<Value, Status>| result.unwrap_err().code;

        let missing = serde_json::json!({ "entity": ["x"] });
        assert_eq!(code(carrier.user_set_config(&mut bus, &missing)), 1);

        let empty = serde_json::json!({ "entity": [], "config": {} });
        assert_eq!(code(carrier.user_set_config(&mut bus, &empty)), 2);

        let foreign = serde_json::json!({ "entity": ["someone-else"], "config": {} });
        assert_eq!(code(carrier.user_set_config(&mut bus, &foreign)), 3);

        let unresolved = serde_json::json!({
            "entity": [carrier.entity_id(), "7"], "config": {} });
        assert_eq!(code(carrier.user_set_config(&mut bus, &unresolved)), 4);

        let rejected = serde_json::json!({
            "entity": [carrier.entity_id(), "0", "C"],
            "config": { "elements": { "0": 25.0 } },
        });
        assert_eq!(code(carrier.user_set_config(&mut bus, &rejected)), 5);
    }

    #[test]
    fn test_reset_clears_routes_keeps_calibration() {
        let (_driver, mut bus, mut carrier) = detected_carrier();
        carrier.clusters[0].route(1, 2, 0.5, 3).unwrap();
        carrier.clusters[0].cblock.set_gain_correction(2, 1.1).unwrap();
        let msg = serde_json::json!({ "keep_calibration": true });
        carrier.user_reset(&mut bus, &msg).unwrap();
        assert!(!carrier.clusters[0].ublock.is_anything_connected());
        assert_eq!(carrier.clusters[0].cblock.gain_corrections()[2], 1.1);
    }

    #[test]
    fn test_acl_select_register() {
        let (driver, mut bus, mut carrier) = detected_carrier();
        carrier.set_acl_mode(2, AclMode::External).unwrap();
        carrier.write_to_hardware(&mut bus).unwrap();
        let writes = driver.writes_to(Address::new(CARRIER_BADDR, 4));
        assert_eq!(writes.last().unwrap(), &vec![0b0000_0100]);
        assert!(carrier.set_acl_mode(8, AclMode::External).is_err());
    }

    #[test]
    fn test_config_self_adc_channels() {
        let (_driver, mut bus, mut carrier) = detected_carrier();
        let msg = serde_json::json!({
            "entity": [carrier.entity_id()],
            "config": { "adc_channels": [0, 1, null, null, null, null, null, null] },
        });
        carrier.user_set_config(&mut bus, &msg).unwrap();
        assert_eq!(carrier.adc_channels()[0], 0);
        assert_eq!(carrier.adc_channels()[1], 1);
        assert_eq!(carrier.adc_channels()[2], ADC_CHANNEL_DISABLED);
    }
}
