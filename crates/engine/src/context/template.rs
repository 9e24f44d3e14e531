//! `${...}` expression rendering using minijinja.
//!
//! Placeholders use `${ expr }`, blocks keep `{% %}`. Undefined values are
//! strict: a missing variable is an evaluation error, never an empty string.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::syntax::SyntaxConfig;
use minijinja::value::ValueKind;
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, Value};

use crate::error::{EngineError, EngineResult};

/// Expression renderer shared by every execution context.
pub struct ExpressionRenderer {
    env: Environment<'static>,
}

impl std::fmt::Debug for ExpressionRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionRenderer").finish_non_exhaustive()
    }
}

impl ExpressionRenderer {
    /// Create a renderer with the `${...}` syntax and custom filters.
    pub fn new() -> EngineResult<Self> {
        let syntax = SyntaxConfig::builder()
            .block_delimiters("{%", "%}")
            .variable_delimiters("${", "}")
            .comment_delimiters("{#", "#}")
            .build()
            .map_err(|e| EngineError::Config(format!("expression syntax: {}", e)))?;

        let mut env = Environment::new();
        env.set_syntax(syntax);
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("b64decode", filter_b64decode);
        env.add_filter("tojson", filter_tojson);
        env.add_filter("fromjson", filter_fromjson);
        env.add_filter("split", filter_split);

        Ok(Self { env })
    }

    /// Render a template against a prepared context.
    pub fn render(&self, template: &str, context: &HashMap<String, Value>) -> Result<String, Error> {
        let tmpl = self.env.template_from_str(template)?;
        tmpl.render(Value::from_object(context.clone()))
    }

    /// Evaluate a bare expression, or a single `${...}` placeholder.
    pub fn evaluate(&self, expression: &str, context: &HashMap<String, Value>) -> Result<Value, Error> {
        let expr = self.env.compile_expression(strip_placeholder(expression))?;
        let value = expr.eval(Value::from_object(context.clone()))?;
        if value.is_undefined() {
            return Err(Error::new(
                ErrorKind::UndefinedError,
                format!("'{}' is undefined", expression.trim()),
            ));
        }
        Ok(value)
    }
}

/// True if the string contains placeholder or block syntax.
pub fn contains_expression(s: &str) -> bool {
    (s.contains("${") && s.contains('}')) || (s.contains("{%") && s.contains("%}"))
}

/// `${ a.b }` -> `a.b`; other strings are returned trimmed.
fn strip_placeholder(expression: &str) -> &str {
    let trimmed = expression.trim();
    match trimmed.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        Some(inner) if !inner.contains("${") => inner.trim(),
        _ => trimmed,
    }
}

/// Convert a serde_json value to a minijinja value.
pub fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::from(()),
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(f) = n.as_f64() {
                Value::from(f)
            } else {
                Value::from(())
            }
        }
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(arr) => {
            let items: Vec<Value> = arr.iter().map(json_to_value).collect();
            Value::from(items)
        }
        serde_json::Value::Object(map) => {
            let items: HashMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect();
            Value::from_object(items)
        }
    }
}

/// Convert a minijinja value back to serde_json.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    if value.is_undefined() || value.is_none() {
        return serde_json::Value::Null;
    }
    match value.kind() {
        ValueKind::Bool => serde_json::Value::Bool(value.is_true()),
        ValueKind::Number => {
            if let Some(i) = value.as_i64() {
                return serde_json::Value::Number(i.into());
            }
            f64::try_from(value.clone())
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null)
        }
        ValueKind::String => serde_json::Value::String(value.as_str().unwrap_or_default().to_string()),
        ValueKind::Seq => value
            .try_iter()
            .map(|iter| serde_json::Value::Array(iter.map(|v| value_to_json(&v)).collect()))
            .unwrap_or(serde_json::Value::Array(Vec::new())),
        ValueKind::Map => {
            let mut map = serde_json::Map::new();
            if let Ok(iter) = value.try_iter() {
                for key in iter {
                    if let Ok(val) = value.get_item(&key) {
                        map.insert(key.to_string(), value_to_json(&val));
                    }
                }
            }
            serde_json::Value::Object(map)
        }
        _ => serde_json::Value::String(value.to_string()),
    }
}

// ============================================================================
// Custom Filters
// ============================================================================

fn filter_b64encode(value: &Value) -> Result<String, Error> {
    Ok(BASE64.encode(value.to_string().as_bytes()))
}

fn filter_b64decode(value: &Value) -> Result<String, Error> {
    let decoded = BASE64.decode(value.to_string().as_bytes()).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, format!("b64decode error: {}", e))
    })?;
    String::from_utf8(decoded)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("utf8 error: {}", e)))
}

fn filter_tojson(value: &Value) -> Result<String, Error> {
    serde_json::to_string(&value_to_json(value))
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("tojson error: {}", e)))
}

fn filter_fromjson(value: &Value) -> Result<Value, Error> {
    let json: serde_json::Value = serde_json::from_str(&value.to_string()).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, format!("fromjson error: {}", e))
    })?;
    Ok(json_to_value(&json))
}

fn filter_split(value: &Value, sep: Option<&Value>) -> Vec<String> {
    let separator = sep.map(|v| v.to_string()).unwrap_or_else(|| ",".to_string());
    value
        .to_string()
        .split(&separator)
        .map(|s| s.trim().to_string())
        .collect()
}
