//! Operating-mode control of the analog core.
//!
//! The core has three modes driven by two pins: IC (load initial
//! conditions), OP (run), and HALT (freeze). Imperative transitions are
//! available at any time; timed sequences are delegated to the hardware
//! sequencer behind [`crate::sys::Driver`].

use crate::Result;
use crate::sys::{Driver, Pin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnOverload {
    Ignore,
    #[default]
    HaltImmediately,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnExtHalt {
    #[default]
    Ignore,
    Halt,
}

pub struct ModeControl;

impl ModeControl {
    pub fn to_ic(driver: &mut dyn Driver) -> Result<()> {
        log::debug!("mode: IC");
        driver.pin_write(Pin::ModeIc, true)?;
        driver.pin_write(Pin::ModeOp, false)
    }

    pub fn to_op(driver: &mut dyn Driver) -> Result<()> {
        log::debug!("mode: OP");
        driver.pin_write(Pin::ModeIc, false)?;
        driver.pin_write(Pin::ModeOp, true)
    }

    pub fn to_halt(driver: &mut dyn Driver) -> Result<()> {
        log::debug!("mode: HALT");
        driver.pin_write(Pin::ModeIc, false)?;
        driver.pin_write(Pin::ModeOp, false)
    }

    /// Release the mode pins so an external master can drive them.
    pub fn to_minion(driver: &mut dyn Driver) -> Result<()> {
        log::info!("mode: minion, releasing IC/OP pins");
        driver.pin_release(Pin::ModeIc)?;
        driver.pin_release(Pin::ModeOp)
    }
}

/// A timed IC/OP sequence on the hardware sequencer.
#[derive(Debug, Clone, Copy)]
pub struct TimedRun {
    pub ic_time_ns: u64,
    pub op_time_ns: u64,
    pub on_overload: OnOverload,
    pub on_ext_halt: OnExtHalt,
}

impl TimedRun {
    pub fn setup(driver: &mut dyn Driver, ic_time_ns: u64, op_time_ns: u64,
            on_overload: OnOverload, on_ext_halt: OnExtHalt) -> Result<TimedRun> {
        driver.timer_configure(ic_time_ns, op_time_ns)?;
        Ok(TimedRun { ic_time_ns, op_time_ns, on_overload, on_ext_halt })
    }

    pub fn force_start(&self, driver: &mut dyn Driver) -> Result<()> {
        driver.timer_start()
    }

    pub fn is_done(&self, driver: &mut dyn Driver) -> Result<bool> {
        driver.timer_is_done()
    }

    /// Poll the fault inputs and apply the configured policies. Returns
    /// true when the sequence was halted.
    pub fn service_events(&self, driver: &mut dyn Driver) -> Result<bool> {
        if driver.pin_read(Pin::Overload)? && self.on_overload == OnOverload::HaltImmediately {
            log::warn!("overload asserted, halting");
            ModeControl::to_halt(driver)?;
            return Ok(true);
        }
        if driver.pin_read(Pin::ExtHalt)? && self.on_ext_halt == OnExtHalt::Halt {
            log::debug!("external halt asserted, halting");
            ModeControl::to_halt(driver)?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sys::mock::MockDriver;

    #[test]
    fn test_manual_transitions() {
        let mut driver = MockDriver::new();
        ModeControl::to_ic(&mut driver).unwrap();
        assert_eq!(driver.pin_level(Pin::ModeIc), Some(true));
        assert_eq!(driver.pin_level(Pin::ModeOp), Some(false));
        ModeControl::to_op(&mut driver).unwrap();
        assert_eq!(driver.pin_level(Pin::ModeIc), Some(false));
        assert_eq!(driver.pin_level(Pin::ModeOp), Some(true));
        ModeControl::to_halt(&mut driver).unwrap();
        assert_eq!(driver.pin_level(Pin::ModeOp), Some(false));
    }

    #[test]
    fn test_minion_releases_pins() {
        let mut driver = MockDriver::new();
        ModeControl::to_ic(&mut driver).unwrap();
        ModeControl::to_minion(&mut driver).unwrap();
        assert_eq!(driver.pin_level(Pin::ModeIc), None);
        assert_eq!(driver.pin_level(Pin::ModeOp), None);
    }

    #[test]
    fn test_timed_run_completes() {
        let mut driver = MockDriver::new();
        let timed = TimedRun::setup(&mut driver, 100_000, 1_000_000,
            OnOverload::default(), OnExtHalt::default()).unwrap();
        timed.force_start(&mut driver).unwrap();
        let mut polls = 0;
        while !timed.is_done(&mut driver).unwrap() {
            polls += 1;
            assert!(polls < 1000);
        }
    }

    #[test]
    fn test_overload_policy() {
        let mut driver = MockDriver::new();
        driver.set_pin_input(Pin::Overload, true);
        let timed = TimedRun::setup(&mut driver, 0, 1_000_000,
            OnOverload::HaltImmediately, OnExtHalt::Ignore).unwrap();
        assert!(timed.service_events(&mut driver).unwrap());
        assert_eq!(driver.pin_level(Pin::ModeOp), Some(false));

        let ignoring = TimedRun::setup(&mut driver, 0, 1_000_000,
            OnOverload::Ignore, OnExtHalt::Ignore).unwrap();
        assert!(!ignoring.service_events(&mut driver).unwrap());
    }
}
