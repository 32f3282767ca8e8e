//! JSON-line message handling.
//!
//! One envelope per line: `{"id": ..., "type": ..., "msg": {...}}` in,
//! `{"id", "type", "success", "msg" | "error" + "error_code"}` out. The
//! transport (TCP, serial) lives outside this crate; this module only
//! resolves a type string to a handler over the device context and wraps
//! the result.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::bus::Bus;
use crate::carrier::Carrier;
use crate::chips::adc;
use crate::daq::{DaqConfig, OneshotDaq};
use crate::mode::ModeControl;
use crate::run::{Run, RunConfig, RunDataHandler, RunStateChange, RunStateHandler, RunManager};

/// Wire-level status: code 0 is success, anything else carries a
/// handler-specific error code plus a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: i32,
    pub message: String,
}

impl Status {
    pub fn new(code: i32, message: impl Into<String>) -> Status {
        Status { code, message: message.into() }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Value,
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    msg: Value,
}

/// Everything a message handler may touch.
pub struct Context<'a> {
    pub bus: &'a mut Bus,
    pub carrier: &'a mut Carrier,
    pub run_manager: &'a mut RunManager,
}

/// Handle one envelope line and produce the response line.
pub fn handle_line(context: &mut Context, line: &str) -> String {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(error) => {
            log::debug!("unparseable envelope: {}", error);
            return json!({
                "id": Value::Null,
                "type": Value::Null,
                "success": false,
                "error": format!("malformed envelope: {}", error),
                "error_code": -1,
            }).to_string();
        }
    };
    let mut response = json!({
        "id": envelope.id,
        "type": envelope.type_,
    });
    match dispatch(context, &envelope.type_, &envelope.msg) {
        Ok(msg) => {
            response["success"] = Value::Bool(true);
            response["msg"] = msg;
        }
        Err(status) => {
            log::debug!("{} failed: [{}] {}", envelope.type_, status.code, status.message);
            response["success"] = Value::Bool(false);
            response["error"] = Value::String(status.message);
            response["error_code"] = Value::from(status.code);
        }
    }
    response.to_string()
}

/// Resolve `type_` to its handler and run it.
pub fn dispatch(context: &mut Context, type_: &str, msg: &Value)
        -> core::result::Result<Value, Status> {
    log::debug!("dispatching '{}'", type_);
    match type_ {
        "ping" => ping(context),
        "get_entities" => Ok(context.carrier.get_entities()),
        "get_config" => context.carrier.user_get_config(msg),
        "set_config" => context.carrier.user_set_config(context.bus, msg),
        "reset" => context.carrier.user_reset(context.bus, msg),
        "start_run" => start_run(context, msg),
        "one_shot_daq" => one_shot_daq(context, msg),
        "manual_mode" => manual_mode(context, msg),
        "sys_ident" => Ok(json!({
            "type": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        })),
        _ => Err(Status::new(-2, format!("unknown message type '{}'", type_))),
    }
}

fn ping(context: &mut Context) -> core::result::Result<Value, Status> {
    let micros = context.bus.driver_mut().micros();
    Ok(json!({
        // No wall clock on the device; uptime seconds stand in.
        "now": format!("{}.{:06}", micros / 1_000_000, micros % 1_000_000),
        "micros": micros,
    }))
}

fn start_run(context: &mut Context, msg: &Value) -> core::result::Result<Value, Status> {
    let id = msg.get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Status::new(1, "run needs a string 'id'"))?
        .to_owned();

    let mut config = RunConfig::default();
    if let Some(config_msg) = msg.get("config") {
        if let Some(ic_time) = config_msg.get("ic_time").and_then(Value::as_u64) {
            config.ic_time_ns = ic_time;
        }
        if let Some(op_time) = config_msg.get("op_time").and_then(Value::as_u64) {
            config.op_time_ns = op_time;
        }
        if let Some(halt) = config_msg.get("halt_on_overload").and_then(Value::as_bool) {
            config.halt_on_overload = halt;
        }
    }

    let mut daq_config = DaqConfig::default();
    if let Some(daq_msg) = msg.get("daq_config") {
        if let Some(num_channels) = daq_msg.get("num_channels").and_then(Value::as_u64) {
            daq_config.num_channels = num_channels as usize;
        }
        if let Some(sample_rate) = daq_msg.get("sample_rate").and_then(Value::as_u64) {
            daq_config.sample_rate = sample_rate as u32;
        }
    }

    context.run_manager.start_run(Run::new(id, config, daq_config))
        .map_err(|error| Status::new(2, error.to_string()))?;
    Ok(json!({}))
}

fn one_shot_daq(context: &mut Context, msg: &Value) -> core::result::Result<Value, Status> {
    let mut daq = OneshotDaq::new();
    let driver = context.bus.driver_mut();
    let data = match msg.get("sample_avg") {
        Some(sample_avg) => {
            let samples = sample_avg.get("size_samples")
                .and_then(Value::as_u64)
                .ok_or_else(|| Status::new(1, "sample_avg needs 'size_samples'"))?;
            let delay_us = sample_avg.get("avg_us")
                .and_then(Value::as_u64)
                .ok_or_else(|| Status::new(1, "sample_avg needs 'avg_us'"))?;
            daq.sample_avg(driver, samples as usize, delay_us as u32)
        }
        None => daq.sample(driver),
    }.map_err(|error| Status::new(2, error.to_string()))?;

    match msg.get("channel") {
        Some(channel) => {
            let channel = channel.as_u64()
                .filter(|&channel| (channel as usize) < adc::NUM_CHANNELS)
                .ok_or_else(|| Status::new(3, "channel has to be a single number"))?;
            Ok(json!({ "data": data[channel as usize] }))
        }
        None => Ok(json!({ "data": data.to_vec() })),
    }
}

fn manual_mode(context: &mut Context, msg: &Value) -> core::result::Result<Value, Status> {
    // Hands off while a run is queued or in flight.
    if let Some(run) = context.run_manager.active() {
        if !run.state.is_terminal() {
            return Err(Status::new(1, format!("run {} is {}", run.id, run.state.name())));
        }
    }
    let driver = context.bus.driver_mut();
    let result = match msg.get("to").and_then(Value::as_str) {
        Some("ic") => ModeControl::to_ic(driver),
        Some("op") => ModeControl::to_op(driver),
        Some("halt") => ModeControl::to_halt(driver),
        Some("minion") => ModeControl::to_minion(driver),
        _ => return Err(Status::new(10, "illegal target state")),
    };
    result.map_err(|error| Status::new(11, error.to_string()))?;
    Ok(json!({}))
}

/// Collects `run_state_change` and `run_data` notification lines during a
/// run, formatted for the same JSON-lines stream as the responses.
pub struct RunNotificationEmitter {
    carrier_id: String,
    pub lines: Vec<String>,
}

impl RunNotificationEmitter {
    pub fn new(carrier_id: String) -> RunNotificationEmitter {
        RunNotificationEmitter { carrier_id, lines: Vec::new() }
    }
}

impl RunStateHandler for RunNotificationEmitter {
    fn handle(&mut self, change: RunStateChange, run: &Run) {
        self.lines.push(json!({
            "type": "run_state_change",
            "id": run.id,
            "msg": {
                "t": change.t_ns,
                "old": change.old.name(),
                "new": change.new.name(),
            },
        }).to_string());
    }
}

impl RunDataHandler for RunNotificationEmitter {
    fn prepare(&mut self, run: &Run) {
        let expected = run.config.op_time_ns as u128
            * run.daq_config.sample_rate as u128 / 1_000_000_000;
        self.lines.reserve(expected as usize / 16 + 1);
    }

    fn handle(&mut self, data: &[f32], channels: usize, run: &Run) {
        let vectors: Vec<Value> = data.chunks(channels)
            .map(|vector| Value::from(vector.to_vec()))
            .collect();
        self.lines.push(json!({
            "type": "run_data",
            "id": run.id,
            "entity": [self.carrier_id],
            "data": vectors,
        }).to_string());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::carrier::test::detected_carrier;

    macro_rules! context {
        ($context:ident, $bus:ident, $carrier:ident, $runs:ident) => {
            let mut $runs = RunManager::new();
            let mut $context = Context {
                bus: &mut $bus,
                carrier: &mut $carrier,
                run_manager: &mut $runs,
            };
        };
    }

    #[test]
    fn test_ping_round_trip() {
        let (_driver, mut bus, mut carrier) = detected_carrier();
        context!(context, bus, carrier, runs);
        let response = handle_line(&mut context, r#"{"id":"a","type":"ping","msg":{}}"#);
        let response: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(response["id"], "a");
        assert_eq!(response["type"], "ping");
        assert_eq!(response["success"], true);
        assert!(response["msg"]["now"].is_string());
        assert!(response["msg"]["micros"].is_u64());
    }

    #[test]
    fn test_malformed_envelope() {
        let (_driver, mut bus, mut carrier) = detected_carrier();
        context!(context, bus, carrier, runs);
        let response = handle_line(&mut context, "this is not json");
        let response: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(response["success"], false);
        assert_eq!(response["error_code"], -1);
    }

    #[test]
    fn test_unknown_type() {
        let (_driver, mut bus, mut carrier) = detected_carrier();
        context!(context, bus, carrier, runs);
        let response = handle_line(&mut context, r#"{"id":1,"type":"frobnicate","msg":{}}"#);
        let response: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(response["success"], false);
        assert_eq!(response["error_code"], -2);
    }

    #[test]
    fn test_get_entities_envelope() {
        let (_driver, mut bus, mut carrier) = detected_carrier();
        let carrier_id = crate::entity::Entity::entity_id(&carrier).to_owned();
        context!(context, bus, carrier, runs);
        let response = handle_line(&mut context, r#"{"id":"e","type":"get_entities","msg":{}}"#);
        let response: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(response["success"], true);
        let entities = response["msg"]["entities"].as_object().unwrap();
        assert_eq!(entities.len(), 1);
        assert!(entities.contains_key(&carrier_id));
    }

    #[test]
    fn test_set_config_dispatch() {
        let (_driver, mut bus, mut carrier) = detected_carrier();
        let carrier_id = crate::entity::Entity::entity_id(&carrier).to_owned();
        context!(context, bus, carrier, runs);
        let msg = json!({
            "entity": [carrier_id, "0", "C"],
            "config": { "elements": { "3": 0.25 } },
        });
        let result = dispatch(&mut context, "set_config", &msg).unwrap();
        assert_eq!(result["config"]["elements"][3], 0.25);
    }

    #[test]
    fn test_one_shot_daq_single_channel() {
        let (driver, mut bus, mut carrier) = detected_carrier();
        driver.set_adc_default([0.5; 8]);
        context!(context, bus, carrier, runs);
        let result = dispatch(&mut context, "one_shot_daq", &json!({ "channel": 2 })).unwrap();
        assert!((result["data"].as_f64().unwrap() - 0.5).abs() < 1e-3);

        let all = dispatch(&mut context, "one_shot_daq", &json!({})).unwrap();
        assert_eq!(all["data"].as_array().unwrap().len(), 8);
    }

    #[test]
    fn test_manual_mode_blocked_while_run_pending() {
        let (_driver, mut bus, mut carrier) = detected_carrier();
        context!(context, bus, carrier, runs);
        dispatch(&mut context, "start_run", &json!({
            "id": "r1",
            "config": { "ic_time": 100_000, "op_time": 1_000_000 },
            "daq_config": { "num_channels": 1, "sample_rate": 100_000 },
        })).unwrap();
        let refused = dispatch(&mut context, "manual_mode", &json!({ "to": "ic" }));
        assert_eq!(refused.unwrap_err().code, 1);
    }

    #[test]
    fn test_manual_mode_transitions() {
        let (driver, mut bus, mut carrier) = detected_carrier();
        context!(context, bus, carrier, runs);
        dispatch(&mut context, "manual_mode", &json!({ "to": "ic" })).unwrap();
        assert_eq!(driver.pin_level(crate::sys::Pin::ModeIc), Some(true));
        let illegal = dispatch(&mut context, "manual_mode", &json!({ "to": "warp" }));
        assert_eq!(illegal.unwrap_err().code, 10);
    }

    #[test]
    fn test_start_run_then_notifications() {
        let (_driver, mut bus, mut carrier) = detected_carrier();
        let carrier_id = crate::entity::Entity::entity_id(&carrier).to_owned();
        context!(context, bus, carrier, runs);
        dispatch(&mut context, "start_run", &json!({
            "id": "r2",
            "config": { "ic_time": 100_000, "op_time": 100_000 },
            "daq_config": { "num_channels": 1, "sample_rate": 1_000_000 },
        })).unwrap();

        let mut states = RunNotificationEmitter::new(carrier_id.clone());
        let mut data = RunNotificationEmitter::new(carrier_id);
        context.run_manager.run_next(
            context.bus.driver_mut(), &mut states, &mut data).unwrap();

        let first: Value = serde_json::from_str(&states.lines[0]).unwrap();
        assert_eq!(first["type"], "run_state_change");
        assert_eq!(first["msg"]["old"], "NEW");
        assert_eq!(first["msg"]["new"], "QUEUED");
        let last: Value = serde_json::from_str(states.lines.last().unwrap()).unwrap();
        assert_eq!(last["msg"]["new"], "DONE");

        let data_line: Value = serde_json::from_str(&data.lines[0]).unwrap();
        assert_eq!(data_line["type"], "run_data");
        assert_eq!(data_line["id"], "r2");
        assert!(data_line["data"].is_array());
    }
}
