//! End-to-end exercise of the whole stack against the mock driver:
//! detection, entity introspection, a configured route, and a timed run
//! with streamed samples.

use hybridctl::{Bus, Carrier, RunManager};
use hybridctl::chips::adc;
use hybridctl::entity::Entity;
use hybridctl::protocol::{self, Context, RunNotificationEmitter};
use hybridctl::sys::mock::MockDriver;

fn main() -> hybridctl::Result<()> {
    env_logger::init();

    let driver = MockDriver::new();
    driver.install_standard_chassis();
    // A -500/s ramp on channel 0, as an integrator fed with +0.5 would
    // produce.
    driver.set_sample_source(Box::new(|vector_idx, _channel| {
        adc::float_to_raw(-500.0 * (vector_idx + 1) as f32 / 100_000.0)
    }));

    let mut bus = Bus::new(Box::new(driver.clone()))?;
    let mut carrier = Carrier::detect(&mut bus, 1)?;
    let carrier_id = carrier.entity_id().to_owned();
    let mut run_manager = RunManager::new();
    let mut context = Context {
        bus: &mut bus,
        carrier: &mut carrier,
        run_manager: &mut run_manager,
    };

    let lines = [
        r#"{"id":"1","type":"ping","msg":{}}"#.to_owned(),
        r#"{"id":"2","type":"get_entities","msg":{}}"#.to_owned(),
        format!(concat!(
            r#"{{"id":"3","type":"set_config","msg":{{"entity":["{}","0"],"config":{{"#,
            r#""/U":{{"outputs":{{"5":2}}}},"#,
            r#""/C":{{"elements":{{"5":0.5}}}},"#,
            r#""/I":{{"outputs":[[],[],[],[5],[],[],[],[],[],[],[],[],[],[],[],[]]}}}}}}}}"#,
        ), carrier_id),
        format!(r#"{{"id":"4","type":"get_config","msg":{{"entity":["{}","0","U"]}}}}"#,
            carrier_id),
        r#"{"id":"5","type":"one_shot_daq","msg":{"channel":0}}"#.to_owned(),
        concat!(r#"{"id":"6","type":"start_run","msg":{"id":"run-1","#,
            r#""config":{"ic_time":1000000,"op_time":200000},"#,
            r#""daq_config":{"num_channels":1,"sample_rate":100000}}}"#).to_owned(),
    ];
    for line in &lines {
        println!("-> {}", line);
        println!("<- {}", protocol::handle_line(&mut context, line));
    }

    let mut state_emitter = RunNotificationEmitter::new(carrier_id.clone());
    let mut data_emitter = RunNotificationEmitter::new(carrier_id);
    context.run_manager.run_next(
        context.bus.driver_mut(), &mut state_emitter, &mut data_emitter)?;
    for line in state_emitter.lines.iter().chain(&data_emitter.lines) {
        println!("<- {}", line);
    }
    Ok(())
}
