use serde_json::{Map, Value};

use crate::catalog::{OperationKind, OperationSpec, ParamKind, ParamSpec};
use crate::error::{PipelineError, PipelineResult};
use crate::resolver::Plan;

#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    Null,
    Str(String),
    Int(i64),
    Array(Vec<Value>),
    Object(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundArg {
    pub param: &'static ParamSpec,
    pub value: BoundValue,
}

/// A plan whose arguments match the operation's declared schema, in
/// declared order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundCall {
    pub kind: OperationKind,
    pub args: Vec<BoundArg>,
}

impl BoundCall {
    pub fn operation_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn get(&self, name: &str) -> Option<&BoundValue> {
        self.args
            .iter()
            .find(|arg| arg.param.name == name)
            .map(|arg| &arg.value)
    }

    /// Non-empty trimmed string value.
    pub fn string(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            BoundValue::Str(value) => {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_owned())
            }
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            BoundValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn array(&self, name: &str) -> Option<&[Value]> {
        match self.get(name)? {
            BoundValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn object(&self, name: &str) -> Option<&Map<String, Value>> {
        match self.get(name)? {
            BoundValue::Object(map) => Some(map),
            _ => None,
        }
    }
}

pub fn bind(plan: Plan, spec: &'static OperationSpec) -> PipelineResult<BoundCall> {
    if plan.operation_name != spec.name() {
        return Err(PipelineError::unknown_operation(&plan.operation_name));
    }
    let mut raw = plan.arguments;

    let mut args = Vec::with_capacity(spec.parameters.len());
    for param in spec.parameters {
        let value = match raw.remove(param.name) {
            Some(Value::Null) | None => {
                if param.required {
                    return Err(PipelineError::missing_argument(param.name));
                }
                coerce(param, param.default.to_value())?
            }
            Some(value) => coerce(param, value)?,
        };
        args.push(BoundArg { param, value });
    }

    if let Some(extra) = raw.keys().min() {
        return Err(PipelineError::unexpected_argument(extra));
    }

    Ok(BoundCall {
        kind: spec.kind,
        args,
    })
}

fn coerce(param: &ParamSpec, value: Value) -> PipelineResult<BoundValue> {
    let mismatch = |value: &Value| {
        PipelineError::invalid_argument(format!(
            "argument `{}` must be {} {}, got {}",
            param.name,
            article(param.kind),
            param.kind.as_str(),
            json_type_name(value)
        ))
    };

    match (param.kind, value) {
        (_, Value::Null) => Ok(BoundValue::Null),
        (ParamKind::String, Value::String(text)) => Ok(BoundValue::Str(text)),
        (ParamKind::String, Value::Number(number)) => Ok(BoundValue::Str(number.to_string())),
        (ParamKind::String, Value::Bool(flag)) => Ok(BoundValue::Str(flag.to_string())),
        (ParamKind::Integer, Value::Number(number)) => {
            if let Some(int) = number.as_i64() {
                return Ok(BoundValue::Int(int));
            }
            match number.as_f64() {
                Some(float) if float.fract() == 0.0 && float.abs() < i64::MAX as f64 => {
                    Ok(BoundValue::Int(float as i64))
                }
                _ => Err(mismatch(&Value::Number(number))),
            }
        }
        (ParamKind::Integer, Value::String(text)) => text
            .trim()
            .parse::<i64>()
            .map(BoundValue::Int)
            .map_err(|_| mismatch(&Value::String(text))),
        (ParamKind::Array, Value::Array(items)) => Ok(BoundValue::Array(items)),
        (ParamKind::Object, Value::Object(map)) => Ok(BoundValue::Object(map)),
        (_, other) => Err(mismatch(&other)),
    }
}

fn article(kind: ParamKind) -> &'static str {
    match kind {
        ParamKind::Integer | ParamKind::Array | ParamKind::Object => "an",
        ParamKind::String => "a",
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
