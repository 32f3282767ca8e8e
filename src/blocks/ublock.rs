//! U block: the 16x32 voltage crossbar at the front of every cluster.
//!
//! Any input may fan out to many outputs, but each output is driven by at
//! most one input. Two switch groups share the matrix: the regular group
//! ("A side") carries analog inputs, the alternative group ("B side") can
//! feed references or ground through the canonical reference inputs 15
//! (outputs 0..15) and 14 (outputs 16..31).

use serde_json::{Map, Value};

use crate::{Error, Result};
use crate::bus::{Address, Bus};
use crate::chips::dac::Dac60508;
use crate::chips::shiftreg::ShiftRegister;
use crate::chips::xbar::UMatrix;
use crate::entity::{
    DEFAULT_VARIANT, Entity, EntityClass, EntityClassifier, Eui64, Version,
};

pub const NUM_INPUTS: usize = 16;
pub const NUM_OUTPUTS: usize = 32;
pub const NUM_OFFSETS: usize = 8;

/// Block-wide magnitude of the reference fed through the B side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferenceMagnitude {
    #[default]
    One = 0,
    OneTenth = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransmissionMode {
    #[default]
    AnalogInput = 0b00,
    PosRef = 0b01,
    NegRef = 0b10,
    Ground = 0b11,
}

/// Nominal offset trim value; the calibration nudges around it.
pub const OFFSET_NOMINAL: f32 = 1.0;
const OFFSET_MIN: f32 = 0.8;
const OFFSET_MAX: f32 = 1.2;

#[derive(Debug)]
pub struct UBlockHalV12 {
    matrix: UMatrix,
    matrix_sync: Address,
    mode_register: ShiftRegister,
    mode_sync: Address,
    offset_dac: Dac60508,
}

impl UBlockHalV12 {
    fn new(block: Address) -> UBlockHalV12 {
        UBlockHalV12 {
            matrix: UMatrix::new(block.with_faddr(5)),
            matrix_sync: block.with_faddr(6),
            mode_register: ShiftRegister::new(block.with_faddr(2)),
            mode_sync: block.with_faddr(3),
            offset_dac: Dac60508::new(block.with_faddr(1)),
        }
    }
}

/// Versioned register access, selected by the detected classifier.
#[derive(Debug)]
pub enum UBlockHal {
    V12(UBlockHalV12),
}

impl UBlockHal {
    fn write_outputs(&self, bus: &mut Bus, outputs: &[i8; NUM_OUTPUTS]) -> Result<()> {
        match self {
            Self::V12(hal) => {
                hal.matrix.transfer(bus, outputs)?;
                bus.trigger(hal.matrix_sync)
            }
        }
    }

    fn write_transmission_modes_and_ref(&self, bus: &mut Bus,
            a_side: TransmissionMode, b_side: TransmissionMode,
            ref_magnitude: ReferenceMagnitude) -> Result<()> {
        match self {
            Self::V12(hal) => {
                // Magnitude in the lowest bit, then two bits per switch group.
                let data = ref_magnitude as u8
                    | (a_side as u8) << 1
                    | (b_side as u8) << 3;
                hal.mode_register.write8(bus, data)?;
                bus.trigger(hal.mode_sync)
            }
        }
    }

    fn write_offsets(&self, bus: &mut Bus, offsets: &[f32; NUM_OFFSETS]) -> Result<()> {
        match self {
            Self::V12(hal) => {
                for (channel, &offset) in offsets.iter().enumerate() {
                    hal.offset_dac.set_channel(bus, channel as u8, offset * 1.25)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
pub struct UBlock {
    classifier: EntityClassifier,
    eui: Eui64,
    hal: UBlockHal,
    output_map: [i8; NUM_OUTPUTS],
    ref_magnitude: ReferenceMagnitude,
    a_side: TransmissionMode,
    b_side: TransmissionMode,
    offsets: [f32; NUM_OFFSETS],
}

impl UBlock {
    pub const TYPE: u8 = 1;

    /// Construct the driver matching a detected classifier, or `None` when
    /// the combination is unsupported.
    pub fn from_classifier(classifier: EntityClassifier, eui: Eui64, block: Address)
            -> Option<UBlock> {
        if classifier.class != EntityClass::UBlock || classifier.type_ != Self::TYPE {
            return None;
        }
        if classifier.variant != DEFAULT_VARIANT {
            return None;
        }
        if classifier.version < Version::new(1, 2, 0) || classifier.version >= Version::new(1, 3, 0) {
            return None;
        }
        Some(UBlock {
            classifier,
            eui,
            hal: UBlockHal::V12(UBlockHalV12::new(block)),
            output_map: [-1; NUM_OUTPUTS],
            ref_magnitude: ReferenceMagnitude::One,
            a_side: TransmissionMode::AnalogInput,
            b_side: TransmissionMode::AnalogInput,
            offsets: [OFFSET_NOMINAL; NUM_OFFSETS],
        })
    }

    fn check_input(input: usize) -> Result<()> {
        if input >= NUM_INPUTS {
            return Err(Error::Config(format!("U-block input {} out of range", input)));
        }
        Ok(())
    }

    fn check_output(output: usize) -> Result<()> {
        if output >= NUM_OUTPUTS {
            return Err(Error::Config(format!("U-block output {} out of range", output)));
        }
        Ok(())
    }

    /// The canonical reference input serving an output half.
    pub fn reference_input(output: usize) -> usize {
        if output < 16 { 15 } else { 14 }
    }

    /// Connect `input` to `output`. The regular switch group migrates back
    /// to analog mode if it is currently feeding a reference and that is
    /// possible without consequences; connecting the canonical reference
    /// input is compatible with any B-side mode and never migrates it.
    pub fn connect(&mut self, input: usize, output: usize, force: bool) -> Result<()> {
        Self::check_input(input)?;
        Self::check_output(output)?;

        if !force && self.is_output_connected(output) {
            return Err(Error::Config(format!(
                "U-block output {} is already connected", output)));
        }

        let regular_route = input != Self::reference_input(output);
        if regular_route && self.a_side != TransmissionMode::AnalogInput {
            if !force && self.is_input_connected(input) {
                return Err(Error::Config(format!(
                    "cannot migrate A side while input {} is in use", input)));
            }
            self.a_side = TransmissionMode::AnalogInput;
        }

        self.output_map[output] = input as i8;
        Ok(())
    }

    /// Feed a reference or ground to `output` through the alternative
    /// switch group. Reference signals require the block-wide magnitude to
    /// be one; a conflicting magnitude fails unless `force`, which rewrites
    /// it.
    pub fn connect_alternative(&mut self, mode: TransmissionMode, output: usize,
            force: bool, use_a_side: bool) -> Result<()> {
        Self::check_output(output)?;
        if mode == TransmissionMode::AnalogInput {
            return Err(Error::Config("alternative connection needs a non-analog mode".into()));
        }

        if matches!(mode, TransmissionMode::PosRef | TransmissionMode::NegRef)
                && self.ref_magnitude != ReferenceMagnitude::One {
            if !force {
                return Err(Error::Config(
                    "reference magnitude conflicts with an earlier selection".into()));
            }
            self.ref_magnitude = ReferenceMagnitude::One;
        }

        if !force && self.is_output_connected(output) {
            return Err(Error::Config(format!(
                "U-block output {} is already connected", output)));
        }

        if use_a_side {
            if self.a_side != mode {
                if !force {
                    return Err(Error::Config(
                        "A side is not in the requested mode".into()));
                }
                self.a_side = mode;
            }
        } else if self.b_side != mode {
            if !force && (self.is_input_connected(14) || self.is_input_connected(15)) {
                return Err(Error::Config(
                    "cannot change B side while reference inputs are in use".into()));
            }
            self.b_side = mode;
        }

        // One-to-one mapping where possible; input 0 is the fallback.
        let input = if use_a_side {
            match output {
                0..=14 => output,
                15 | 30 => 0,
                _ => output - 16,
            }
        } else {
            Self::reference_input(output)
        };

        self.output_map[output] = input as i8;
        Ok(())
    }

    pub fn disconnect(&mut self, input: usize, output: usize) -> Result<()> {
        Self::check_input(input)?;
        Self::check_output(output)?;
        if self.output_map[output] != input as i8 {
            return Err(Error::Config(format!(
                "input {} is not connected to output {}", input, output)));
        }
        self.output_map[output] = -1;
        Ok(())
    }

    pub fn disconnect_output(&mut self, output: usize) -> Result<()> {
        Self::check_output(output)?;
        self.output_map[output] = -1;
        Ok(())
    }

    pub fn is_connected(&self, input: usize, output: usize) -> bool {
        output < NUM_OUTPUTS && self.output_map[output] == input as i8
    }

    pub fn is_output_connected(&self, output: usize) -> bool {
        output < NUM_OUTPUTS && self.output_map[output] >= 0
    }

    pub fn is_input_connected(&self, input: usize) -> bool {
        self.output_map.iter().any(|&connected| connected == input as i8)
    }

    pub fn is_anything_connected(&self) -> bool {
        self.output_map.iter().any(|&connected| connected >= 0)
    }

    pub fn output_map(&self) -> &[i8; NUM_OUTPUTS] {
        &self.output_map
    }

    pub fn transmission_modes(&self) -> (TransmissionMode, TransmissionMode) {
        (self.a_side, self.b_side)
    }

    pub fn set_transmission_modes(&mut self, a_side: TransmissionMode, b_side: TransmissionMode) {
        self.a_side = a_side;
        self.b_side = b_side;
    }

    pub fn reference_magnitude(&self) -> ReferenceMagnitude {
        self.ref_magnitude
    }

    pub fn set_reference_magnitude(&mut self, magnitude: ReferenceMagnitude) {
        self.ref_magnitude = magnitude;
    }

    pub fn offset(&self, channel: usize) -> f32 {
        self.offsets[channel]
    }

    /// Adjust one per-lane offset trim; used by the calibration loop.
    pub fn change_offset(&mut self, channel: usize, value: f32) -> Result<()> {
        if channel >= NUM_OFFSETS {
            return Err(Error::Config(format!("offset channel {} out of range", channel)));
        }
        if !(OFFSET_MIN..=OFFSET_MAX).contains(&value) {
            return Err(Error::Config(format!("offset trim {} out of range", value)));
        }
        self.offsets[channel] = value;
        Ok(())
    }

    pub fn reset_connections(&mut self) {
        self.output_map = [-1; NUM_OUTPUTS];
    }

    pub fn reset(&mut self, keep_calibration: bool) {
        self.reset_connections();
        self.a_side = TransmissionMode::AnalogInput;
        self.b_side = TransmissionMode::AnalogInput;
        self.ref_magnitude = ReferenceMagnitude::One;
        if !keep_calibration {
            self.offsets = [OFFSET_NOMINAL; NUM_OFFSETS];
        }
    }

    fn config_outputs_from_json(&mut self, cfg: &Value) -> Result<()> {
        match cfg {
            // A full array resets all outputs first.
            Value::Array(outputs) => {
                if outputs.len() != NUM_OUTPUTS {
                    return Err(Error::Config(format!(
                        "expected {} outputs, got {}", NUM_OUTPUTS, outputs.len())));
                }
                self.reset_connections();
                for (output, input) in outputs.iter().enumerate() {
                    match input {
                        Value::Null => (),
                        Value::Number(number) => {
                            let input = number.as_u64().ok_or_else(|| Error::Config(
                                format!("output {} input must be an unsigned integer", output)))?;
                            self.connect(input as usize, output, false)?;
                        }
                        _ => return Err(Error::Config(format!(
                            "output {} input must be a number or null", output))),
                    }
                }
                Ok(())
            }
            // A mapping only touches the outputs it names; clearing first
            // allows swapping inputs between outputs.
            Value::Object(outputs) => {
                let mut changes = Vec::with_capacity(outputs.len());
                for (key, input) in outputs {
                    let output: usize = key.parse().map_err(|_| Error::Config(
                        format!("output key '{}' is not an index", key)))?;
                    changes.push((output, input));
                }
                for &(output, _) in &changes {
                    self.disconnect_output(output)?;
                }
                for (output, input) in changes {
                    match input {
                        Value::Null => (),
                        Value::Number(number) => {
                            let input = number.as_u64().ok_or_else(|| Error::Config(
                                format!("output {} input must be an unsigned integer", output)))?;
                            self.connect(input as usize, output, false)?;
                        }
                        _ => return Err(Error::Config(format!(
                            "output {} input must be a number or null", output))),
                    }
                }
                Ok(())
            }
            _ => Err(Error::Config("'outputs' must be an array or a mapping".into())),
        }
    }

    fn config_constant_from_json(&mut self, cfg: &Value) -> Result<()> {
        match cfg {
            Value::Null | Value::Bool(false) => {
                self.b_side = TransmissionMode::AnalogInput;
                self.ref_magnitude = ReferenceMagnitude::One;
                Ok(())
            }
            Value::Bool(true) => {
                self.b_side = TransmissionMode::PosRef;
                self.ref_magnitude = ReferenceMagnitude::One;
                Ok(())
            }
            Value::Number(number) => match number.as_f64() {
                Some(value) if value == 0.1 => {
                    self.b_side = TransmissionMode::PosRef;
                    self.ref_magnitude = ReferenceMagnitude::OneTenth;
                    Ok(())
                }
                Some(value) if value == 1.0 => {
                    self.b_side = TransmissionMode::PosRef;
                    self.ref_magnitude = ReferenceMagnitude::One;
                    Ok(())
                }
                _ => Err(Error::Config(format!("cannot use {} as a constant", number))),
            },
            _ => Err(Error::Config("cannot understand 'constant' value".into())),
        }
    }
}

impl Entity for UBlock {
    fn entity_id(&self) -> &str {
        "U"
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
                "outputs" => self.config_outputs_from_json(value)?,
                "constant" => self.config_constant_from_json(value)?,
                _ if key.starts_with('/') => (),
                _ => return Err(Error::Config(format!("unknown U-block key '{}'", key))),
            }
        }
        Ok(())
    }

    fn config_self_to_json(&self, cfg: &mut Map<String, Value>) {
        let outputs: Vec<Value> = self.output_map.iter()
            .map(|&input| if input >= 0 { Value::from(input) } else { Value::Null })
            .collect();
        cfg.insert("outputs".into(), Value::Array(outputs));
    }

    fn write_to_hardware(&mut self, bus: &mut Bus) -> Result<()> {
        self.hal.write_outputs(bus, &self.output_map)?;
        self.hal.write_transmission_modes_and_ref(
            bus, self.a_side, self.b_side, self.ref_magnitude)?;
        self.hal.write_offsets(bus, &self.offsets)
    }
}
