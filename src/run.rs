//! Timed analog runs: the state model and the manager that stitches the
//! mode controller and the continuous DAQ into one sequence.

use std::collections::VecDeque;

use crate::{Error, Result};
use crate::daq::{ContinuousDaq, DaqConfig};
use crate::mode::{OnExtHalt, OnOverload, TimedRun};
use crate::sys::Driver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    New,
    Error,
    Done,
    Queued,
    TakeOff,
    Ic,
    Op,
    OpEnd,
    TmpHalt,
}

impl RunState {
    pub fn name(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Error => "ERROR",
            Self::Done => "DONE",
            Self::Queued => "QUEUED",
            Self::TakeOff => "TAKE_OFF",
            Self::Ic => "IC",
            Self::Op => "OP",
            Self::OpEnd => "OP_END",
            Self::TmpHalt => "TMP_HALT",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    pub ic_time_ns: u64,
    pub op_time_ns: u64,
    pub halt_on_overload: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            ic_time_ns: 100_000,
            op_time_ns: 500_000_000,
            halt_on_overload: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunStateChange {
    pub t_ns: u64,
    pub old: RunState,
    pub new: RunState,
}

/// Transition history kept per run; oldest entries are dropped.
pub const MAX_HISTORY: usize = 7;

#[derive(Debug)]
pub struct Run {
    pub id: String,
    pub config: RunConfig,
    pub daq_config: DaqConfig,
    pub state: RunState,
    history: VecDeque<RunStateChange>,
}

impl Run {
    pub fn new(id: String, config: RunConfig, daq_config: DaqConfig) -> Run {
        Run {
            id,
            config,
            daq_config,
            state: RunState::New,
            history: VecDeque::with_capacity(MAX_HISTORY),
        }
    }

    pub fn to(&mut self, new_state: RunState, t_ns: u64) -> RunStateChange {
        let change = RunStateChange { t_ns, old: self.state, new: new_state };
        self.state = new_state;
        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(change);
        change
    }

    pub fn history(&self) -> impl Iterator<Item = &RunStateChange> {
        self.history.iter()
    }
}

pub trait RunStateHandler {
    fn handle(&mut self, change: RunStateChange, run: &Run);
}

pub trait RunDataHandler {
    /// Called before acquisition starts so buffers can be sized from
    /// `op_time * sample_rate * channels`.
    fn prepare(&mut self, run: &Run);
    /// One batch of samples in strict temporal order, `channels` values per
    /// vector.
    fn handle(&mut self, data: &[f32], channels: usize, run: &Run);
}

/// Owns the one in-flight run. A new run is refused while the previous one
/// is in any non-terminal state.
#[derive(Debug, Default)]
pub struct RunManager {
    active: Option<Run>,
}

impl RunManager {
    pub fn new() -> RunManager {
        RunManager { active: None }
    }

    pub fn start_run(&mut self, run: Run) -> Result<()> {
        if let Some(active) = &self.active {
            if !active.state.is_terminal() {
                return Err(Error::Run(format!(
                    "run {} is still {}", active.id, active.state.name())));
            }
        }
        if !run.daq_config.is_valid() {
            return Err(Error::Run(format!(
                "invalid DAQ config: {} channels at {} Hz",
                run.daq_config.num_channels, run.daq_config.sample_rate)));
        }
        if run.config.op_time_ns == 0 {
            return Err(Error::Run("op_time must be nonzero".into()));
        }
        log::debug!("queueing run {}", run.id);
        self.active = Some(run);
        Ok(())
    }

    pub fn active(&self) -> Option<&Run> {
        self.active.as_ref()
    }

    pub fn has_pending(&self) -> bool {
        matches!(&self.active, Some(run) if run.state == RunState::New)
    }

    /// Drop a finished run, making room for the next one.
    pub fn clear_finished(&mut self) -> Option<Run> {
        if matches!(&self.active, Some(run) if run.state.is_terminal()) {
            return self.active.take();
        }
        None
    }

    /// Execute the queued run to completion. State changes are published
    /// through `state_handler`, sample batches through `data_handler`.
    pub fn run_next(&mut self, driver: &mut dyn Driver,
            state_handler: &mut dyn RunStateHandler,
            data_handler: &mut dyn RunDataHandler) -> Result<()> {
        let mut run = match self.active.take() {
            Some(run) if run.state == RunState::New => run,
            Some(run) => {
                self.active = Some(run);
                return Err(Error::Run("no queued run".into()));
            }
            None => return Err(Error::Run("no queued run".into())),
        };
        let result = Self::sequence(&mut run, driver, state_handler, data_handler);
        if let Err(error) = &result {
            log::error!("run {} failed: {}", run.id, error);
            let t_ns = driver.micros() * 1000;
            let change = run.to(RunState::Error, t_ns);
            state_handler.handle(change, &run);
        }
        self.active = Some(run);
        result
    }

    fn sequence(run: &mut Run, driver: &mut dyn Driver,
            state_handler: &mut dyn RunStateHandler,
            data_handler: &mut dyn RunDataHandler) -> Result<()> {
        data_handler.prepare(run);

        let on_overload = if run.config.halt_on_overload {
            OnOverload::HaltImmediately
        } else {
            OnOverload::Ignore
        };
        let on_ext_halt = OnExtHalt::Ignore;

        let timed = TimedRun::setup(driver, run.config.ic_time_ns, run.config.op_time_ns,
            on_overload, on_ext_halt)?;
        let mut daq = ContinuousDaq::init(driver, run.daq_config)?;
        daq.enable(driver)?;

        let mut transition = |run: &mut Run, driver: &mut dyn Driver, state| {
            let t_ns = driver.micros() * 1000;
            let change = run.to(state, t_ns);
            state_handler.handle(change, run);
        };

        transition(run, driver, RunState::Queued);
        transition(run, driver, RunState::TakeOff);
        transition(run, driver, RunState::Ic);
        timed.force_start(driver)?;
        driver.delay_ns(run.config.ic_time_ns.min(u32::MAX as u64) as u32);
        transition(run, driver, RunState::Op);

        while !timed.is_done(driver)? {
            if timed.service_events(driver)? {
                break;
            }
            daq.stream(false, run, data_handler)?;
        }

        // Allow the last DMA transfer to land before the final flush.
        driver.delay_ns(5_000);
        daq.stream(true, run, data_handler)?;

        transition(run, driver, RunState::OpEnd);
        daq.finalize(driver)?;
        transition(run, driver, RunState::Done);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chips::adc;
    use crate::sys::{Pin, mock::MockDriver};

    struct StateLog {
        changes: Vec<(RunState, RunState)>,
    }

    impl RunStateHandler for StateLog {
        fn handle(&mut self, change: RunStateChange, _run: &Run) {
            self.changes.push((change.old, change.new));
        }
    }

    struct DataLog {
        prepared: bool,
        vectors: Vec<Vec<f32>>,
    }

    impl RunDataHandler for DataLog {
        fn prepare(&mut self, _run: &Run) {
            self.prepared = true;
        }

        fn handle(&mut self, data: &[f32], channels: usize, _run: &Run) {
            for vector in data.chunks(channels) {
                self.vectors.push(vector.to_vec());
            }
        }
    }

    fn handlers() -> (StateLog, DataLog) {
        (StateLog { changes: Vec::new() }, DataLog { prepared: false, vectors: Vec::new() })
    }

    #[test]
    fn test_history_is_bounded() {
        let mut run = Run::new("r".into(), RunConfig::default(), DaqConfig::default());
        for _ in 0..5 {
            run.to(RunState::TmpHalt, 0);
            run.to(RunState::Op, 0);
        }
        assert_eq!(run.history().count(), MAX_HISTORY);
    }

    #[test]
    fn test_second_run_refused_while_active() {
        let mut manager = RunManager::new();
        manager.start_run(Run::new("a".into(), RunConfig::default(), DaqConfig::default()))
            .unwrap();
        let refused = manager.start_run(
            Run::new("b".into(), RunConfig::default(), DaqConfig::default()));
        assert!(matches!(refused, Err(Error::Run(_))));
    }

    #[test]
    fn test_invalid_daq_config_refused() {
        let mut manager = RunManager::new();
        let run = Run::new("a".into(), RunConfig::default(),
            DaqConfig { num_channels: 3, sample_rate: 100_000 });
        assert!(manager.start_run(run).is_err());
    }

    #[test]
    fn test_full_sequence_without_daq() {
        let mut driver = MockDriver::new();
        let mut manager = RunManager::new();
        let (mut states, mut data) = handlers();
        manager.start_run(Run::new("a".into(), RunConfig {
            ic_time_ns: 100_000, op_time_ns: 1_000_000, halt_on_overload: true,
        }, DaqConfig::default())).unwrap();
        manager.run_next(&mut driver, &mut states, &mut data).unwrap();

        let expected = [
            (RunState::New, RunState::Queued),
            (RunState::Queued, RunState::TakeOff),
            (RunState::TakeOff, RunState::Ic),
            (RunState::Ic, RunState::Op),
            (RunState::Op, RunState::OpEnd),
            (RunState::OpEnd, RunState::Done),
        ];
        assert_eq!(states.changes, expected);
        assert!(data.prepared);
        assert_eq!(manager.active().unwrap().state, RunState::Done);
        assert!(manager.clear_finished().is_some());
    }

    #[test]
    fn test_integrator_ramp_run() {
        // A +0.5 constant into an inverting integrator with k = 10000 ramps
        // to -0.1 after 200 us of OP time.
        let mut driver = MockDriver::new();
        let op_time_ns = 200_000u64;
        let sample_rate = 100_000u32;
        driver.set_sample_source(Box::new(move |vector_idx, _channel| {
            // -500/s ramp sampled on a 10 us grid, reaching -0.1 at 200 us.
            let t_s = (vector_idx + 1) as f32 / sample_rate as f32;
            adc::float_to_raw(-500.0 * t_s)
        }));
        let mut manager = RunManager::new();
        let (mut states, mut data) = handlers();
        manager.start_run(Run::new("ramp".into(), RunConfig {
            ic_time_ns: 1_000_000, op_time_ns, halt_on_overload: true,
        }, DaqConfig { num_channels: 1, sample_rate })).unwrap();
        manager.run_next(&mut driver, &mut states, &mut data).unwrap();

        assert_eq!(manager.active().unwrap().state, RunState::Done);
        assert_eq!(data.vectors.len(), 20);
        let last = data.vectors.last().unwrap()[0];
        assert!((-0.11..=-0.09).contains(&last), "last sample {}", last);
    }

    #[test]
    fn test_overflow_ends_run_in_error() {
        let mut driver = MockDriver::new();
        // Produce far more than a full ring between two polls so the
        // streamer cannot keep up.
        driver.set_poll_advance_ns(1_000_000_000);
        let mut manager = RunManager::new();
        let (mut states, mut data) = handlers();
        manager.start_run(Run::new("overflow".into(), RunConfig {
            ic_time_ns: 100_000, op_time_ns: 1_000_000_000, halt_on_overload: true,
        }, DaqConfig { num_channels: 8, sample_rate: 1_000_000 })).unwrap();
        let result = manager.run_next(&mut driver, &mut states, &mut data);

        assert!(matches!(result, Err(Error::Daq(crate::daq::Fault::Overflow))));
        assert_eq!(manager.active().unwrap().state, RunState::Error);
        // No truncated data was reported as valid after the overflow.
        let (_, last) = states.changes.last().unwrap().clone();
        assert_eq!(last, RunState::Error);
    }

    #[test]
    fn test_overload_halts_immediately() {
        let mut driver = MockDriver::new();
        driver.set_pin_input(Pin::Overload, true);
        let mut manager = RunManager::new();
        let (mut states, mut data) = handlers();
        manager.start_run(Run::new("ovl".into(), RunConfig {
            ic_time_ns: 100_000, op_time_ns: 1_000_000_000, halt_on_overload: true,
        }, DaqConfig::default())).unwrap();
        manager.run_next(&mut driver, &mut states, &mut data).unwrap();
        // Run completed early rather than erroring out.
        assert_eq!(manager.active().unwrap().state, RunState::Done);
    }
}
