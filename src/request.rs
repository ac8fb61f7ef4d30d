//! Request planning: turning an operation descriptor plus a caller option
//! map into a concrete HTTP request.
//!
//! Binding is deterministic and free of I/O. The caller's option map is
//! never mutated; binding works on a defensive clone. Option keys that do
//! not correspond to a declared parameter are silently dropped.

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::{Map, Value};
use url::Url;

use crate::error::{AriError, AriResult};
use crate::schema::{OperationDescriptor, ParamPlacement};

/// A fully bound HTTP request, ready for the invoker.
///
/// Credentials are not part of the plan; the invoker attaches Basic
/// authentication when executing it.
#[derive(Debug, Clone)]
pub struct RequestPlan {
    /// HTTP method.
    pub method: String,
    /// Absolute URL with all path parameters substituted.
    pub url: Url,
    /// Query pairs. List-typed values appear as repeated keys.
    pub query: Vec<(String, String)>,
    /// Extra headers from header-placement parameters.
    pub headers: Vec<(String, String)>,
    /// Form fields, when the operation declares form parameters.
    pub form: Vec<(String, String)>,
    /// JSON request body, when the operation declares body parameters.
    pub body: Option<Value>,
}

/// Bind `opts` against the operation, producing a [`RequestPlan`].
///
/// Fails with [`AriError::MissingRequiredParameter`] when a required
/// parameter is absent. A non-object `opts` is treated as empty.
pub(crate) fn bind(base: &Url, op: &OperationDescriptor, opts: &Value) -> AriResult<RequestPlan> {
    let mut remaining: Map<String, Value> = match opts {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    let mut path = op.path.clone();
    let mut query = Vec::new();
    let mut headers = Vec::new();
    let mut form = Vec::new();
    let mut body_parts: Vec<(String, Value)> = Vec::new();

    for param in &op.parameters {
        if param.required && !remaining.contains_key(&param.name) {
            return Err(AriError::MissingRequiredParameter {
                name: param.name.clone(),
            });
        }
        let Some(value) = remaining.remove(&param.name) else {
            continue;
        };
        match param.placement {
            ParamPlacement::Path => {
                let encoded =
                    utf8_percent_encode(&scalar_text(&value), NON_ALPHANUMERIC).to_string();
                path = path.replace(&format!("{{{}}}", param.name), &encoded);
            }
            ParamPlacement::Query => push_pairs(&mut query, &param.name, &value),
            ParamPlacement::Form => push_pairs(&mut form, &param.name, &value),
            ParamPlacement::Header => headers.push((param.name.clone(), scalar_text(&value))),
            ParamPlacement::Body => {
                body_parts.push((param.name.clone(), unwrap_body_value(&param.name, value)));
            }
        }
    }
    // Keys left in `remaining` are undeclared ("bogus") parameters; dropped.

    let mut url = base.clone();
    url.set_path(&path);
    url.set_query(None);

    Ok(RequestPlan {
        method: op.method.clone(),
        url,
        query,
        headers,
        form,
        body: assemble_body(body_parts),
    })
}

/// Text form of a scalar option value for paths, headers, and pairs.
fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Append one option value as wire pairs; arrays become repeated keys.
fn push_pairs(pairs: &mut Vec<(String, String)>, name: &str, value: &Value) {
    match value {
        Value::Array(items) => {
            for item in items {
                pairs.push((name.to_string(), scalar_text(item)));
            }
        }
        other => pairs.push((name.to_string(), scalar_text(other))),
    }
}

/// The two wrapping parameters the server expects under a named key.
fn wrappable(name: &str) -> bool {
    name == "variables" || name == "fields"
}

/// Strip an existing `{"variables": {...}}` wrapper so the assembly step
/// wraps exactly once however the caller shaped the value.
fn unwrap_body_value(name: &str, value: Value) -> Value {
    if !wrappable(name) {
        return value;
    }
    if let Value::Object(map) = &value {
        if map.len() == 1 {
            if let Some(inner) = map.get(name) {
                if inner.is_object() {
                    return inner.clone();
                }
            }
        }
    }
    value
}

/// Assemble collected body parameters into the request body.
///
/// A single parameter serializes bare, except `variables`/`fields` map
/// values which are wrapped under their parameter name. Multiple
/// parameters merge into one object keyed by parameter name.
fn assemble_body(mut parts: Vec<(String, Value)>) -> Option<Value> {
    match parts.len() {
        0 => None,
        1 => {
            let (name, value) = parts.remove(0);
            if wrappable(&name) && value.is_object() {
                let mut wrapped = Map::new();
                wrapped.insert(name, value);
                Some(Value::Object(wrapped))
            } else {
                Some(value)
            }
        }
        _ => {
            let mut merged = Map::new();
            for (name, value) in parts {
                merged.insert(name, value);
            }
            Some(Value::Object(merged))
        }
    }
}
