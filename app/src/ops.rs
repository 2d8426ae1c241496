//! Built-in operations for the headless runner.
//!
//! Script nodes name one of these operations in their code field. They cover
//! the small arithmetic/text vocabulary the demo graphs use, plus `to_blob`
//! for exercising the handle store from the command line.

use std::collections::BTreeMap;

use engine::model::{HandleRef, Value};
use engine::runner::{OpRunner, ScriptFailure, ScriptSuccess};
use engine::store::{RawBuffer, StoreOptions};
use serde_json::json;

fn number(inputs: &BTreeMap<String, Value>, port: &str) -> Result<f64, ScriptFailure> {
    inputs
        .get(port)
        .and_then(|v| v.as_data())
        .and_then(|v| v.as_f64())
        .ok_or_else(|| ScriptFailure::validation(format!("port '{port}' is not a number")))
}

fn text<'a>(inputs: &'a BTreeMap<String, Value>, port: &str) -> Result<&'a str, ScriptFailure> {
    inputs
        .get(port)
        .and_then(|v| v.as_data())
        .and_then(|v| v.as_str())
        .ok_or_else(|| ScriptFailure::validation(format!("port '{port}' is not text")))
}

pub fn builtin_runner() -> OpRunner {
    let mut runner = OpRunner::new();

    runner.register("double", |inputs, _| {
        Ok(number(inputs, "in")
            .map(|n| ScriptSuccess::with_default(Value::data(json!(n * 2.0)))))
    });

    runner.register("sum", |inputs, _| {
        let mut total = 0.0;
        for value in inputs.values() {
            match value.as_data().and_then(|v| v.as_f64()) {
                Some(n) => total += n,
                None => return Ok(Err(ScriptFailure::validation("non-numeric input"))),
            }
        }
        Ok(Ok(ScriptSuccess::with_default(Value::data(json!(total)))))
    });

    runner.register("describe", |inputs, _| {
        Ok(number(inputs, "in").map(|n| {
            ScriptSuccess::with_default(Value::data(json!(format!("{n} units"))))
        }))
    });

    runner.register("uppercase", |inputs, _| {
        Ok(text(inputs, "in")
            .map(|s| ScriptSuccess::with_default(Value::data(json!(s.to_uppercase())))))
    });

    // Stores the input text's bytes out-of-band and emits a handle.
    runner.register("to_blob", |inputs, store| {
        let bytes = match text(inputs, "in") {
            Ok(s) => s.as_bytes().to_vec(),
            Err(failure) => return Ok(Err(failure)),
        };
        let handle = store.store(Box::new(RawBuffer(bytes)), "raw", StoreOptions::default())?;
        let mut success = ScriptSuccess::with_default(Value::Handle(HandleRef::new(handle.id)));
        success.produced_handles.push(handle.id);
        Ok(Ok(success))
    });

    runner
}
