//! Built-in analysis functions.

use async_trait::async_trait;
use serde_json::{json, Value};

use cairn_types::{CairnError, Result};

use crate::registry::{AnalysisFunction, ArgSpec, FunctionCall, FunctionOutput};

/// Every number inside `v`, depth first. Nulls and non-numbers are skipped.
fn numbers(v: &Value) -> Vec<f64> {
    match v {
        Value::Number(n) => n.as_f64().into_iter().collect(),
        Value::Array(items) => items.iter().flat_map(numbers).collect(),
        Value::Object(map) => map.values().flat_map(numbers).collect(),
        _ => Vec::new(),
    }
}

/// Rebuild `v` with `f` applied to every number.
fn map_numbers(v: &Value, f: &impl Fn(f64) -> f64) -> Value {
    match v {
        Value::Number(n) => n.as_f64().map(|x| json!(f(x))).unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(items.iter().map(|i| map_numbers(i, f)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, i)| (k.clone(), map_numbers(i, f)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// SumFunction: "basic/sum"
// ---------------------------------------------------------------------------

/// Sums every number in `x` and, if connected, `y`.
pub struct SumFunction;

#[async_trait]
impl AnalysisFunction for SumFunction {
    fn name(&self) -> &str {
        "basic/sum"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required("x"), ArgSpec::optional("y")]
    }

    async fn invoke(&self, call: FunctionCall) -> Result<FunctionOutput> {
        let x = call.inputs.get("x").ok_or_else(|| CairnError::AnalysisFunction {
            function: self.name().into(),
            node: call.node_id.clone(),
            message: "argument 'x' is required".into(),
        })?;
        let xs = numbers(x);
        let mut total: f64 = xs.iter().sum();
        let mut count = xs.len();
        if let Some(y) = call.inputs.get("y") {
            let ys = numbers(y);
            total += ys.iter().sum::<f64>();
            count += ys.len();
        }
        tracing::debug!(node = %call.node_id, total, count, "Summed inputs");
        Ok(FunctionOutput::new()
            .with_value("sum", json!(total))
            .with_metadata(json!({ "function": self.name(), "count": count })))
    }
}

// ---------------------------------------------------------------------------
// ScaleFunction: "basic/scale"
// ---------------------------------------------------------------------------

/// Multiplies every number in `x` by the `factor` param (default 1).
pub struct ScaleFunction;

#[async_trait]
impl AnalysisFunction for ScaleFunction {
    fn name(&self) -> &str {
        "basic/scale"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required("x")]
    }

    async fn invoke(&self, call: FunctionCall) -> Result<FunctionOutput> {
        let x = call.inputs.get("x").ok_or_else(|| CairnError::AnalysisFunction {
            function: self.name().into(),
            node: call.node_id.clone(),
            message: "argument 'x' is required".into(),
        })?;
        let factor = match call.params.get("factor") {
            None | Some(Value::Null) => 1.0,
            Some(v) => v.as_f64().ok_or_else(|| CairnError::AnalysisFunction {
                function: self.name().into(),
                node: call.node_id.clone(),
                message: format!("param 'factor' must be a number, got {v}"),
            })?,
        };
        Ok(FunctionOutput::new()
            .with_value("scaled", map_numbers(x, &|n| n * factor))
            .with_metadata(json!({ "function": self.name(), "factor": factor })))
    }
}
