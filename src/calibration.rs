//! Calibration of the analog signal chain.
//!
//! Three interlocking procedures, all run with the analog core in IC and
//! the SH block acting as a precise comparator onto the cluster gain bus:
//! offset zeroing per lane, per-lane gain correction, and the multiplier
//! trims. Changing coefficients disturbs offsets, so the earlier passes are
//! repeated whenever a later one rewrites coefficients.

use crate::{Error, Result};
use crate::blocks::{MBlock, ShBlock};
use crate::blocks::mblock::{MMulBlock, NUM_MULTIPLIERS, SLOT_WIDTH};
use crate::blocks::ublock::{self, TransmissionMode};
use crate::bus::Bus;
use crate::carrier::Carrier;
use crate::cluster::Cluster;
use crate::daq::OneshotDaq;
use crate::entity::Entity;

/// A lane offset within this band of zero counts as calibrated.
const OFFSET_EPSILON: f32 = 0.005;
const MAX_OFFSET_ITERATIONS: usize = 32;

/// Multiplier trim sweep: start low, step up until the output crosses zero.
const TRIM_SWEEP_START: f32 = -0.1;
const TRIM_SWEEP_STEP: f32 = 0.01;
const TRIM_SWEEP_STEPS: usize = 20;

/// Gain corrections outside this band indicate a broken measurement and
/// are not applied.
const GAIN_MEASUREMENT_MIN: f32 = 0.67;
const GAIN_MEASUREMENT_MAX: f32 = 1.5;

impl Cluster {
    /// There is no calibrating anything without the comparator stage.
    fn sh_required(&mut self) -> Result<&mut ShBlock> {
        self.shblock.as_mut().ok_or_else(|| Error::Config(
            "calibration requires an SH block".into()))
    }

    /// Zero the per-lane offsets. The signal path is grounded, the SH
    /// stage freezes the residual offsets, and the offset trims are
    /// adjusted until each sampled channel sits within epsilon of zero.
    /// The caller must have the gain bus of this cluster on the ADC.
    pub fn calibrate_offsets(&mut self, bus: &mut Bus, daq: &mut OneshotDaq) -> Result<()> {
        self.sh_required()?;
        log::debug!("cluster {}: calibrating offsets", self.cluster_idx());

        let saved_modes = self.ublock.transmission_modes();
        self.ublock.set_transmission_modes(TransmissionMode::Ground, TransmissionMode::Ground);
        self.ublock.write_to_hardware(bus)?;
        bus.delay_ns(250_000);

        // Freeze the residual offsets and put them on the gain bus.
        let shblock = self.sh_required()?;
        shblock.set_track(bus)?;
        bus.delay_ns(100_000);
        shblock.set_inject(bus)?;
        shblock.set_gain(bus)?;
        bus.delay_ns(100_000);

        for channel in 0..ublock::NUM_OFFSETS {
            let mut iterations = 0;
            loop {
                let measured = daq.sample_avg(bus.driver_mut(), 4, 10)?[channel];
                if measured.abs() <= OFFSET_EPSILON {
                    break;
                }
                if iterations >= MAX_OFFSET_ITERATIONS {
                    log::warn!("offset channel {} did not converge, residual {}",
                        channel, measured);
                    break;
                }
                let trimmed = self.ublock.offset(channel) - measured;
                if self.ublock.change_offset(channel, trimmed).is_err() {
                    log::warn!("offset channel {} hit the trim range at {}",
                        channel, trimmed);
                    break;
                }
                self.ublock.write_to_hardware(bus)?;
                bus.delay_ns(100_000);
                iterations += 1;
            }
        }

        self.ublock.set_transmission_modes(saved_modes.0, saved_modes.1);
        self.ublock.write_to_hardware(bus)?;
        self.sh_required()?.set_inject(bus)?;
        Ok(())
    }

    /// Measure each routed lane against the unit reference and store the
    /// inverse as its gain correction. Offsets are zeroed first; routes and
    /// coefficients are restored afterwards.
    pub fn calibrate_routes(&mut self, bus: &mut Bus, daq: &mut OneshotDaq) -> Result<()> {
        self.calibrate_offsets(bus, daq)?;
        log::debug!("cluster {}: calibrating lane gains", self.cluster_idx());

        let saved_modes = self.ublock.transmission_modes();
        let saved_magnitude = self.ublock.reference_magnitude();

        for lane in 0..ublock::NUM_OUTPUTS {
            if !self.ublock.is_output_connected(lane) {
                continue;
            }
            let Some(i_out) = self.iblock.output_for_input(lane) else { continue };
            let saved_input = self.ublock.output_map()[lane];
            let saved_factor = self.cblock.factor(lane);

            // Unit reference through the lane, uncorrected.
            self.ublock.connect_alternative(TransmissionMode::PosRef, lane, true, false)?;
            self.cblock.set_gain_correction(lane, 1.0)?;
            self.cblock.set_factor(lane, 1.0)?;
            self.ublock.write_to_hardware(bus)?;
            self.cblock.write_to_hardware(bus)?;

            self.sh_required()?.set_gain_channels(bus, i_out >= 8)?;
            bus.delay_ns(250_000);

            let measured = daq.sample_avg(bus.driver_mut(), 4, 10)?[i_out % 8].abs();
            if (GAIN_MEASUREMENT_MIN..=GAIN_MEASUREMENT_MAX).contains(&measured) {
                self.cblock.set_gain_correction(lane, 1.0 / measured)?;
            } else {
                log::warn!("lane {}: implausible gain measurement {}, correction skipped",
                    lane, measured);
            }

            // Put the route back the way it was.
            self.cblock.set_factor(lane, saved_factor)?;
            if saved_input >= 0 {
                self.ublock.connect(saved_input as usize, lane, true)?;
            } else {
                self.ublock.disconnect_output(lane)?;
            }
        }

        self.ublock.set_transmission_modes(saved_modes.0, saved_modes.1);
        self.ublock.set_reference_magnitude(saved_magnitude);
        self.sh_required()?.set_inject(bus)?;
        Entity::write_to_hardware(self, bus)
    }

    fn mul_block_mut(&mut self, slot_idx: usize) -> Result<&mut MMulBlock> {
        let slot = match slot_idx {
            0 => self.m0block.as_mut(),
            1 => self.m1block.as_mut(),
            _ => None,
        };
        slot.and_then(MBlock::as_mul_mut).ok_or_else(|| Error::Config(format!(
            "no multiplier block in M slot {}", slot_idx)))
    }

    /// Trim the multipliers of the M block in `slot_idx`. The caller has
    /// already routed calibrated unit references to all slot inputs and
    /// the slot outputs to the ADC.
    ///
    /// Empirically developed sequence: with both inputs zeroed the output
    /// is roughly `-offset_z`; then with one input at one, the matching
    /// input offset is swept from -0.1 upwards until the output crosses
    /// zero. A sweep that reaches +0.1 without crossing keeps the boundary
    /// value and is only reported in the log.
    pub fn calibrate_multipliers(&mut self, slot_idx: usize, bus: &mut Bus,
            daq: &mut OneshotDaq) -> Result<()> {
        let lane_base = slot_idx * SLOT_WIDTH;
        self.mul_block_mut(slot_idx)?;

        // Output offsets first, with all inputs at zero.
        log::debug!("M{}: calibrating output offsets", slot_idx);
        for element in 0..SLOT_WIDTH {
            self.cblock.set_factor(lane_base + element, 0.0)?;
        }
        self.cblock.write_to_hardware(bus)?;
        self.calibrate_offsets(bus, daq)?;
        let measured = daq.sample_avg(bus.driver_mut(), 4, 10)?;
        for multiplier in 0..NUM_MULTIPLIERS {
            let offset_z = -measured[multiplier];
            let mul = self.mul_block_mut(slot_idx)?;
            mul.hal.write_output_offset(bus, multiplier, offset_z)?;
            mul.calibration_mut()[multiplier].offset_z = offset_z;
        }

        // X offsets: drive x = 1, y = 0 and sweep.
        log::debug!("M{}: calibrating x input offsets", slot_idx);
        for multiplier in 0..NUM_MULTIPLIERS {
            self.cblock.set_factor(lane_base + 2 * multiplier, 1.0)?;
        }
        self.cblock.write_to_hardware(bus)?;
        self.calibrate_offsets(bus, daq)?;
        bus.delay_ns(100_000_000);
        for multiplier in 0..NUM_MULTIPLIERS {
            let offset_x = self.sweep_input_offset(slot_idx, multiplier, bus, daq,
                |mul, bus, multiplier, trim| {
                    let offset_y = mul.calibration()[multiplier].offset_y;
                    mul.hal.write_input_offsets(bus, multiplier, trim, offset_y)
                })?;
            self.mul_block_mut(slot_idx)?.calibration_mut()[multiplier].offset_x = offset_x;
        }

        // Y offsets: x back to zero, y = 1, sweep again.
        log::debug!("M{}: calibrating y input offsets", slot_idx);
        for multiplier in 0..NUM_MULTIPLIERS {
            self.cblock.set_factor(lane_base + 2 * multiplier, 0.0)?;
            self.cblock.set_factor(lane_base + 2 * multiplier + 1, 1.0)?;
        }
        self.cblock.write_to_hardware(bus)?;
        self.calibrate_offsets(bus, daq)?;
        bus.delay_ns(100_000_000);
        for multiplier in 0..NUM_MULTIPLIERS {
            let offset_y = self.sweep_input_offset(slot_idx, multiplier, bus, daq,
                |mul, bus, multiplier, trim| {
                    let offset_x = mul.calibration()[multiplier].offset_x;
                    mul.hal.write_input_offsets(bus, multiplier, offset_x, trim)
                })?;
            self.mul_block_mut(slot_idx)?.calibration_mut()[multiplier].offset_y = offset_y;
        }
        Ok(())
    }

    /// One trim sweep: write increasing offsets until the sampled output
    /// goes negative, and return the final trim value.
    fn sweep_input_offset<W>(&mut self, slot_idx: usize, multiplier: usize, bus: &mut Bus,
            daq: &mut OneshotDaq, write_trim: W) -> Result<f32>
            where W: Fn(&mut MMulBlock, &mut Bus, usize, f32) -> Result<()> {
        let trim_at = |step: usize| TRIM_SWEEP_START + step as f32 * TRIM_SWEEP_STEP;
        let mut step = 0;
        {
            let mul = self.mul_block_mut(slot_idx)?;
            write_trim(mul, bus, multiplier, trim_at(step))?;
        }
        loop {
            let measured = daq.sample_channel(bus.driver_mut(), multiplier)?;
            if measured < 0.0 {
                log::debug!("multiplier {} trim converged at {} (measured {})",
                    multiplier, trim_at(step), measured);
                return Ok(trim_at(step));
            }
            if step >= TRIM_SWEEP_STEPS {
                log::warn!("multiplier {} trim at the upper limit, measured {}",
                    multiplier, measured);
                return Ok(trim_at(step));
            }
            step += 1;
            let mul = self.mul_block_mut(slot_idx)?;
            write_trim(mul, bus, multiplier, trim_at(step))?;
            bus.delay_ns(7_000_000);
        }
    }
}

impl Carrier {
    /// Offset calibration across all clusters, with the CTRL mux pointed
    /// at each cluster's gain bus in turn.
    pub fn calibrate_offset(&mut self, bus: &mut Bus, daq: &mut OneshotDaq) -> Result<()> {
        for cluster_idx in 0..self.clusters.len() {
            self.with_gain_bus(cluster_idx, bus, |carrier, bus| {
                carrier.clusters[cluster_idx].calibrate_offsets(bus, daq)
            })?;
        }
        Ok(())
    }

    /// Gain calibration of every routed lane in every cluster.
    pub fn calibrate_routes(&mut self, bus: &mut Bus, daq: &mut OneshotDaq) -> Result<()> {
        for cluster_idx in 0..self.clusters.len() {
            self.with_gain_bus(cluster_idx, bus, |carrier, bus| {
                carrier.clusters[cluster_idx].calibrate_routes(bus, daq)
            })?;
        }
        Ok(())
    }

    /// Full calibration of the multiplier block in `slot_idx` of one
    /// cluster. Routes unit references to all slot inputs, connects the
    /// slot outputs to the ADC, recalibrates the feeding lanes, then hands
    /// over to the trim sweeps. Existing routes are not preserved.
    pub fn calibrate_mblock(&mut self, cluster_idx: usize, slot_idx: usize, bus: &mut Bus,
            daq: &mut OneshotDaq) -> Result<()> {
        if cluster_idx >= self.clusters.len() {
            return Err(Error::Config(format!("no cluster {}", cluster_idx)));
        }
        log::info!("calibrating M{} of cluster {}", slot_idx, cluster_idx);

        let lane_base = slot_idx * SLOT_WIDTH;
        {
            let cluster = &mut self.clusters[cluster_idx];
            cluster.reset(true);
            for element in 0..SLOT_WIDTH {
                let lane = lane_base + element;
                cluster.add_constant(TransmissionMode::PosRef, lane, 1.0, lane)?;
            }
        }
        self.reset_adc_channels();
        for element in 0..SLOT_WIDTH {
            self.set_adc_channel(element, (lane_base + element) as i8)?;
        }
        self.write_to_hardware(bus)?;

        self.with_gain_bus(cluster_idx, bus, |carrier, bus| {
            carrier.clusters[cluster_idx].calibrate_routes(bus, daq)?;
            carrier.clusters[cluster_idx].calibrate_multipliers(slot_idx, bus, daq)
        })?;

        // Leave a clean state behind.
        self.clusters[cluster_idx].reset(true);
        self.reset_adc_channels();
        self.write_to_hardware(bus)
    }

    fn with_gain_bus<F>(&mut self, cluster_idx: usize, bus: &mut Bus, body: F) -> Result<()>
            where F: FnOnce(&mut Carrier, &mut Bus) -> Result<()> {
        self.ctrl_block.set_adc_bus_to_cluster_gain(cluster_idx)?;
        self.ctrl_block.write_to_hardware(bus)?;
        let result = body(self, bus);
        self.ctrl_block.reset_adc_bus();
        self.ctrl_block.write_to_hardware(bus)?;
        result
    }
}
