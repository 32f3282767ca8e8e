//! The entity tree: everything that can be detected, configured, and
//! introspected. Each hardware module carries a classifier in its identity
//! memory; the in-memory tree mirrors carrier, cluster, block and speaks a
//! recursive JSON configuration protocol where keys starting with `/`
//! address children.

use std::fmt;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use serde_json::{Map, Value};

use crate::{Error, Result};
use crate::bus::{Address, Bus, METADATA_FADDR};
use crate::chips::eeprom::IdentityMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityClass {
    Unknown = 0,
    Carrier = 1,
    Cluster = 2,
    FrontPanel = 3,
    MBlock = 4,
    UBlock = 5,
    CBlock = 6,
    IBlock = 7,
    ShBlock = 8,
    CtrlBlock = 9,
}

impl EntityClass {
    pub fn from_u8(value: u8) -> EntityClass {
        match value {
            1 => Self::Carrier,
            2 => Self::Cluster,
            3 => Self::FrontPanel,
            4 => Self::MBlock,
            5 => Self::UBlock,
            6 => Self::CBlock,
            7 => Self::IBlock,
            8 => Self::ShBlock,
            9 => Self::CtrlBlock,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Version {
        Version { major, minor, patch }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// On-wire byte layout of a classifier inside the identity memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ClassifierBytes {
    class: u8,
    type_: u8,
    major: u8,
    minor: u8,
    patch: u8,
    variant: u8,
}

pub const DEFAULT_VARIANT: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityClassifier {
    pub class: EntityClass,
    pub type_: u8,
    pub version: Version,
    pub variant: u8,
}

impl EntityClassifier {
    pub const fn new(class: EntityClass, type_: u8, version: Version, variant: u8)
            -> EntityClassifier {
        EntityClassifier { class, type_, version, variant }
    }

    pub fn from_bytes(bytes: [u8; 6]) -> EntityClassifier {
        let raw: ClassifierBytes = bytemuck::pod_read_unaligned(&bytes);
        EntityClassifier {
            class: EntityClass::from_u8(raw.class),
            type_: raw.type_,
            version: Version::new(raw.major, raw.minor, raw.patch),
            variant: raw.variant,
        }
    }

    pub fn to_bytes(&self) -> [u8; 6] {
        let raw = ClassifierBytes {
            class: self.class as u8,
            type_: self.type_,
            major: self.version.major,
            minor: self.version.minor,
            patch: self.version.patch,
            variant: self.variant,
        };
        bytemuck::bytes_of(&raw).try_into().unwrap()
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "class": self.class as u8,
            "type": self.type_,
            "variant": self.variant,
            "version": [self.version.major, self.version.minor, self.version.patch],
        })
    }
}

/// EUI-64 read from the identity memory; the entity's stable id on the
/// protocol. No two entities on the same bus share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Eui64(pub [u8; 8]);

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (idx, byte) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

// Identity memory layout: a version tag, the total size, the classifier,
// opaque payload, and the EUI-64 at the very end of the 256-byte array.
pub const LAYOUT_VERSION_OFFSET: u8 = 0;
pub const LAYOUT_SIZE_OFFSET: u8 = 1;
pub const CLASSIFIER_OFFSET: u8 = 3;
pub const EUI_OFFSET: u8 = 248;
pub const LAYOUT_V1: u8 = 1;

/// Read and validate the identity of the module at `module`.
pub fn read_identity(bus: &mut Bus, module: Address) -> Result<(EntityClassifier, Eui64)> {
    let memory = IdentityMemory::new(module.with_faddr(METADATA_FADDR));
    let mut classifier_bytes = [0u8; 6];
    memory.read(bus, CLASSIFIER_OFFSET, &mut classifier_bytes)?;
    let classifier = EntityClassifier::from_bytes(classifier_bytes);
    if classifier.class == EntityClass::Unknown {
        return Err(Error::NotDetected(module));
    }
    let mut eui_bytes = [0u8; 8];
    memory.read(bus, EUI_OFFSET, &mut eui_bytes)?;
    log::debug!("detected {:?} v{} at {:?}", classifier.class, classifier.version, module);
    Ok((classifier, Eui64(eui_bytes)))
}

bitflags! {
    /// What a reset request is allowed to touch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResetAction: u8 {
        const CIRCUIT     = 1 << 0;
        const CALIBRATION = 1 << 1;
        const OVERLOAD    = 1 << 2;
    }
}

impl ResetAction {
    pub fn keep_calibration(self) -> bool {
        !self.contains(ResetAction::CALIBRATION)
    }
}

/// One node of the configuration tree.
pub trait Entity {
    /// Unique among siblings; the carrier uses its EUI string.
    fn entity_id(&self) -> &str;
    fn classifier(&self) -> EntityClassifier;
    fn eui(&self) -> Option<Eui64> {
        None
    }

    fn children(&self) -> Vec<&dyn Entity> {
        Vec::new()
    }
    fn child_entity_mut(&mut self, _id: &str) -> Option<&mut dyn Entity> {
        None
    }

    /// Apply the keys of `cfg` that belong to this entity itself. Keys
    /// starting with `/` are handled by the recursion and must be ignored.
    fn config_self_from_json(&mut self, cfg: &Map<String, Value>) -> Result<()>;
    fn config_self_to_json(&self, cfg: &mut Map<String, Value>);

    fn write_to_hardware(&mut self, bus: &mut Bus) -> Result<()>;
}

/// Apply a configuration object: plain keys go to the entity itself, every
/// `/`-prefixed key recurses into the child named by the suffix. Partial
/// reconfiguration is the normal case; absent keys stay untouched.
pub fn config_from_json(entity: &mut dyn Entity, cfg: &Value) -> Result<()> {
    let object = cfg.as_object().ok_or_else(|| Error::Config(format!(
        "configuration for '{}' must be an object", entity.entity_id())))?;
    entity.config_self_from_json(object)?;
    for (key, value) in object {
        if let Some(child_id) = key.strip_prefix('/') {
            if child_id.is_empty() {
                continue;
            }
            let entity_id = entity.entity_id().to_owned();
            let child = entity.child_entity_mut(child_id).ok_or_else(|| Error::Config(
                format!("child entity '{}' does not exist at entity '{}'", child_id, entity_id)))?;
            config_from_json(child, value)?;
        }
    }
    Ok(())
}

pub fn config_to_json(entity: &dyn Entity, recursive: bool) -> Value {
    let mut object = Map::new();
    entity.config_self_to_json(&mut object);
    if recursive {
        for child in entity.children() {
            object.insert(format!("/{}", child.entity_id()), config_to_json(child, true));
        }
    }
    Value::Object(object)
}

/// Resolve a path of child ids, returning the descendant or `None`. Path
/// segments may carry the `/` prefix used in configuration trees.
pub fn resolve_child_mut<'a>(entity: &'a mut dyn Entity, path: &[String])
        -> Option<&'a mut dyn Entity> {
    let mut current = entity;
    for segment in path {
        let id = segment.strip_prefix('/').unwrap_or(segment);
        current = current.child_entity_mut(id)?;
    }
    Some(current)
}

/// Classifier of an entity and all its descendants, children nested under
/// `/`-prefixed keys, as served by `get_entities`.
pub fn classifier_tree(entity: &dyn Entity) -> Value {
    let mut object = match entity.classifier().to_json() {
        Value::Object(object) => object,
        _ => unreachable!(),
    };
    if let Some(eui) = entity.eui() {
        object.insert("eui".into(), Value::String(eui.to_string()));
    }
    for child in entity.children() {
        object.insert(format!("/{}", child.entity_id()), classifier_tree(child));
    }
    Value::Object(object)
}
