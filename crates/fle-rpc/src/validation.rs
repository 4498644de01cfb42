//! Fast-fail, tag-driven validation of JSON values.
//!
//! A [`Schema`] is an ordered list of `(path, rules)` pairs. Paths are dotted
//! (`"user.name"`, `"items.0"`); the empty path addresses the value itself.
//! Validation walks fields in declaration order and rules in tag order and
//! stops at the first violation, returning a single [`ValidationError`].
//!
//! Rules are written in tag syntax, e.g. `"required,min=1,max=64"`. A field
//! that is missing or `null` fails only `required`; every other rule skips it.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};

use fle_core::code::is_valid_session_code;

use crate::types::{JSONRPC_VERSION, Request};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)+$")
        .expect("valid email regex")
});
static NUMERIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-+]?[0-9]+(?:\.[0-9]+)?$").expect("valid numeric regex")
});

/// Tags understood by [`Rule::parse`].
pub const SUPPORTED_TAGS: &[&str] = &[
    "required",
    "eq",
    "ne",
    "min",
    "max",
    "len",
    "gt",
    "gte",
    "lt",
    "lte",
    "oneof",
    "email",
    "url",
    "numeric",
    "alpha",
    "alphanum",
    "sessioncode",
    "jsonrpcversion",
];

/// Problems building a schema from tags.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// The tag name is not in [`SUPPORTED_TAGS`].
    #[error("unknown validation tag '{0}'")]
    UnknownTag(String),
    /// The tag needs a parameter it did not get, or got one it cannot use.
    #[error("invalid parameter '{param}' for tag '{tag}'")]
    InvalidParam {
        /// Tag name.
        tag: String,
        /// Offending parameter text.
        param: String,
    },
}

/// A single validation rule.
#[derive(Clone, Debug, PartialEq)]
pub enum Rule {
    /// Present, non-null, and not an empty string/array/object.
    Required,
    /// Equal to the parameter (strings by text, numbers by value, collections by length).
    Eq(String),
    /// Negation of [`Rule::Eq`].
    Ne(String),
    /// Length (strings, collections) or value (numbers) at least the bound.
    Min(f64),
    /// Length or value at most the bound.
    Max(f64),
    /// Length or value exactly the bound.
    Len(f64),
    /// Length or value strictly greater.
    Gt(f64),
    /// Length or value greater or equal.
    Gte(f64),
    /// Length or value strictly less.
    Lt(f64),
    /// Length or value less or equal.
    Lte(f64),
    /// One of the listed values.
    OneOf(Vec<String>),
    /// Plausible email address.
    Email,
    /// Absolute URL with a scheme.
    Url,
    /// Number, or a string holding a decimal number.
    Numeric,
    /// ASCII letters only.
    Alpha,
    /// ASCII letters and digits only.
    Alphanum,
    /// `adjective-noun-number` session code, case-insensitive.
    SessionCode,
    /// Exactly the protocol version `"2.0"`.
    JsonRpcVersion,
}

impl Rule {
    /// Parse one `tag` or `tag=param` item.
    pub fn parse(item: &str) -> Result<Self, SchemaError> {
        let (tag, param) = match item.split_once('=') {
            Some((tag, param)) => (tag.trim(), Some(param.trim())),
            None => (item.trim(), None),
        };

        let bound = |param: Option<&str>| -> Result<f64, SchemaError> {
            param
                .and_then(|p| p.parse::<f64>().ok())
                .filter(|n| n.is_finite())
                .ok_or_else(|| SchemaError::InvalidParam {
                    tag: tag.to_string(),
                    param: param.unwrap_or_default().to_string(),
                })
        };
        let text = |param: Option<&str>| -> Result<String, SchemaError> {
            param.map(str::to_string).ok_or_else(|| SchemaError::InvalidParam {
                tag: tag.to_string(),
                param: String::new(),
            })
        };

        let rule = match tag {
            "required" => Self::Required,
            "eq" => Self::Eq(text(param)?),
            "ne" => Self::Ne(text(param)?),
            "min" => Self::Min(bound(param)?),
            "max" => Self::Max(bound(param)?),
            "len" => Self::Len(bound(param)?),
            "gt" => Self::Gt(bound(param)?),
            "gte" => Self::Gte(bound(param)?),
            "lt" => Self::Lt(bound(param)?),
            "lte" => Self::Lte(bound(param)?),
            "oneof" => {
                let options: Vec<String> =
                    text(param)?.split_whitespace().map(str::to_string).collect();
                if options.is_empty() {
                    return Err(SchemaError::InvalidParam {
                        tag: tag.to_string(),
                        param: String::new(),
                    });
                }
                Self::OneOf(options)
            }
            "email" => Self::Email,
            "url" => Self::Url,
            "numeric" => Self::Numeric,
            "alpha" => Self::Alpha,
            "alphanum" => Self::Alphanum,
            "sessioncode" => Self::SessionCode,
            "jsonrpcversion" => Self::JsonRpcVersion,
            other => return Err(SchemaError::UnknownTag(other.to_string())),
        };
        Ok(rule)
    }

    /// Parse a comma-separated tag list such as `"required,min=1"`.
    pub fn parse_tags(tags: &str) -> Result<Vec<Self>, SchemaError> {
        tags.split(',')
            .filter(|item| !item.trim().is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Tag name.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::Eq(_) => "eq",
            Self::Ne(_) => "ne",
            Self::Min(_) => "min",
            Self::Max(_) => "max",
            Self::Len(_) => "len",
            Self::Gt(_) => "gt",
            Self::Gte(_) => "gte",
            Self::Lt(_) => "lt",
            Self::Lte(_) => "lte",
            Self::OneOf(_) => "oneof",
            Self::Email => "email",
            Self::Url => "url",
            Self::Numeric => "numeric",
            Self::Alpha => "alpha",
            Self::Alphanum => "alphanum",
            Self::SessionCode => "sessioncode",
            Self::JsonRpcVersion => "jsonrpcversion",
        }
    }

    /// Parameter text, empty for parameterless rules.
    pub fn param(&self) -> String {
        match self {
            Self::Eq(p) | Self::Ne(p) => p.clone(),
            Self::Min(n) | Self::Max(n) | Self::Len(n) | Self::Gt(n) | Self::Gte(n)
            | Self::Lt(n) | Self::Lte(n) => format_bound(*n),
            Self::OneOf(options) => options.join(" "),
            _ => String::new(),
        }
    }

    /// Whether `value` (already known to be present and non-null) satisfies the rule.
    fn check(&self, value: &Value) -> bool {
        match self {
            Self::Required => !is_empty(value),
            Self::Eq(p) => equals(value, p),
            Self::Ne(p) => !equals(value, p),
            Self::Min(n) => measure(value).is_some_and(|m| m >= *n),
            Self::Max(n) => measure(value).is_some_and(|m| m <= *n),
            Self::Len(n) => measure(value).is_some_and(|m| (m - *n).abs() < f64::EPSILON),
            Self::Gt(n) => measure(value).is_some_and(|m| m > *n),
            Self::Gte(n) => measure(value).is_some_and(|m| m >= *n),
            Self::Lt(n) => measure(value).is_some_and(|m| m < *n),
            Self::Lte(n) => measure(value).is_some_and(|m| m <= *n),
            Self::OneOf(options) => scalar_text(value).is_some_and(|t| options.contains(&t)),
            Self::Email => value.as_str().is_some_and(|s| EMAIL_RE.is_match(s)),
            Self::Url => value.as_str().is_some_and(is_url),
            Self::Numeric => match value {
                Value::Number(_) => true,
                Value::String(s) => NUMERIC_RE.is_match(s),
                _ => false,
            },
            Self::Alpha => value
                .as_str()
                .is_some_and(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphabetic())),
            Self::Alphanum => value
                .as_str()
                .is_some_and(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric())),
            Self::SessionCode => value.as_str().is_some_and(is_valid_session_code),
            Self::JsonRpcVersion => value.as_str() == Some(JSONRPC_VERSION),
        }
    }

    fn message(&self, field: &str, value: &Value) -> String {
        let shown = display_value(value);
        let param = self.param();
        let is_text = value.is_string();
        let length = || measure(value).map_or(0, |m| m as u64);
        match self {
            Self::Required => format!("field '{field}' is required"),
            Self::Eq(_) => format!("field '{field}' must equal '{param}', got '{shown}'"),
            Self::Min(_) if is_text => format!(
                "field '{field}' must be at least {param} characters long, got {}",
                length()
            ),
            Self::Min(_) => format!("field '{field}' must be at least {param}, got '{shown}'"),
            Self::Max(_) if is_text => format!(
                "field '{field}' must be at most {param} characters long, got {}",
                length()
            ),
            Self::Max(_) => format!("field '{field}' must be at most {param}, got '{shown}'"),
            Self::Len(_) => format!(
                "field '{field}' must be exactly {param} in length, got {}",
                length()
            ),
            Self::OneOf(_) => format!("field '{field}' must be one of [{param}], got '{shown}'"),
            Self::Email => format!("field '{field}' must be a valid email address, got '{shown}'"),
            Self::Url => format!("field '{field}' must be a valid URL, got '{shown}'"),
            Self::Numeric => format!("field '{field}' must be numeric, got '{shown}'"),
            Self::Alpha => format!(
                "field '{field}' must contain only alphabetic characters, got '{shown}'"
            ),
            Self::Alphanum => format!(
                "field '{field}' must contain only alphanumeric characters, got '{shown}'"
            ),
            Self::SessionCode => format!(
                "field '{field}' must be a valid session code in format 'adjective-noun-number' (e.g., 'happy-panda-42'), got '{shown}'"
            ),
            Self::JsonRpcVersion => format!(
                "field '{field}' must be exactly '2.0' for JSON-RPC 2.0 compliance, got '{shown}'"
            ),
            Self::Gt(_) => format!("field '{field}' must be greater than {param}, got '{shown}'"),
            Self::Gte(_) => format!(
                "field '{field}' must be greater than or equal to {param}, got '{shown}'"
            ),
            Self::Lt(_) => format!("field '{field}' must be less than {param}, got '{shown}'"),
            Self::Lte(_) => format!(
                "field '{field}' must be less than or equal to {param}, got '{shown}'"
            ),
            Self::Ne(_) => format!(
                "field '{field}' failed validation rule 'ne' with value '{shown}'"
            ),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let param = self.param();
        if param.is_empty() {
            f.write_str(self.tag())
        } else {
            write!(f, "{}={param}", self.tag())
        }
    }
}

/// The single violation reported by a failed validation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    /// Tag of the violated rule.
    pub tag: String,
    /// The offending value (`null` when missing).
    pub value: Value,
    /// Rule parameter, empty when the rule has none.
    pub param: String,
    /// Human-readable description.
    pub message: String,
}

impl ValidationError {
    /// JSON form for an error response's `data` member.
    pub fn to_value(&self) -> Value {
        json!({
            "field": self.field,
            "tag": self.tag,
            "value": self.value,
            "param": self.param,
            "message": self.message,
        })
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Ordered field rules.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schema {
    fields: Vec<(String, Vec<Rule>)>,
}

impl Schema {
    /// Empty schema; accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append rules for `path`.
    #[must_use]
    pub fn field(mut self, path: impl Into<String>, rules: impl IntoIterator<Item = Rule>) -> Self {
        self.fields.push((path.into(), rules.into_iter().collect()));
        self
    }

    /// Append rules for `path` written in tag syntax.
    pub fn field_tags(self, path: impl Into<String>, tags: &str) -> Result<Self, SchemaError> {
        Ok(self.field(path, Rule::parse_tags(tags)?))
    }

    /// Build a schema from `(path, tags)` pairs.
    pub fn from_tags(pairs: &[(&str, &str)]) -> Result<Self, SchemaError> {
        pairs
            .iter()
            .try_fold(Self::new(), |schema, (path, tags)| schema.field_tags(*path, tags))
    }

    /// Number of fields with rules.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check `value`, stopping at the first violation.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        for (path, rules) in &self.fields {
            let target = lookup(value, path).filter(|v| !v.is_null());
            for rule in rules {
                let ok = match target {
                    Some(v) => rule.check(v),
                    None => !matches!(rule, Rule::Required),
                };
                if !ok {
                    let field = if path.is_empty() { "value" } else { path.as_str() };
                    let value = target.cloned().unwrap_or(Value::Null);
                    return Err(ValidationError {
                        field: field.to_string(),
                        tag: rule.tag().to_string(),
                        message: rule.message(field, &value),
                        param: rule.param(),
                        value,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Validation entry point shared by envelope and method checks.
#[derive(Clone, Debug)]
pub struct Validator {
    envelope: Schema,
}

impl Validator {
    /// Validator with the JSON-RPC 2.0 envelope schema.
    pub fn new() -> Self {
        let envelope = Schema::new()
            .field("jsonrpc", [Rule::Required, Rule::JsonRpcVersion])
            .field("method", [Rule::Required, Rule::Min(1.0)]);
        Self { envelope }
    }

    /// Check `value` against `schema`.
    pub fn validate(&self, schema: &Schema, value: &Value) -> Result<(), ValidationError> {
        schema.validate(value)
    }

    /// Check a lone value against a tag list; the field is reported as `value`.
    pub fn validate_var(&self, value: &Value, tags: &str) -> Result<Result<(), ValidationError>, SchemaError> {
        let schema = Schema::new().field_tags("", tags)?;
        Ok(schema.validate(value))
    }

    /// Check the request envelope: version, method, and id type.
    pub fn validate_request(&self, request: &Request) -> Result<(), ValidationError> {
        let envelope = json!({ "jsonrpc": request.jsonrpc, "method": request.method });
        self.envelope.validate(&envelope)?;

        match &request.id {
            None | Some(Value::String(_) | Value::Number(_)) => Ok(()),
            Some(other) => Err(ValidationError {
                field: "id".to_string(),
                tag: "id".to_string(),
                value: other.clone(),
                param: String::new(),
                message: format!(
                    "field 'id' must be a string or number, got '{}'",
                    display_value(other)
                ),
            }),
        }
    }

    /// Check a session code.
    pub fn validate_session_code(&self, code: &str) -> Result<(), ValidationError> {
        Schema::new()
            .field("", [Rule::Required, Rule::SessionCode])
            .validate(&Value::String(code.to_string()))
    }

    /// Tags understood by the rule parser.
    pub fn supported_tags(&self) -> &'static [&'static str] {
        SUPPORTED_TAGS
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Value helpers ───────────────────────────────────────────────────

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Character count for strings, element count for collections, value for numbers.
#[allow(clippy::cast_precision_loss)]
fn measure(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => Some(s.chars().count() as f64),
        Value::Number(n) => n.as_f64(),
        Value::Array(items) => Some(items.len() as f64),
        Value::Object(map) => Some(map.len() as f64),
        Value::Null | Value::Bool(_) => None,
    }
}

fn equals(value: &Value, param: &str) -> bool {
    match value {
        Value::String(s) => s == param,
        Value::Number(n) => match (n.as_f64(), param.parse::<f64>()) {
            (Some(a), Ok(b)) => (a - b).abs() < f64::EPSILON,
            _ => false,
        },
        Value::Bool(b) => param.parse::<bool>().is_ok_and(|p| p == *b),
        Value::Array(_) | Value::Object(_) => match (measure(value), param.parse::<f64>()) {
            (Some(a), Ok(b)) => (a - b).abs() < f64::EPSILON,
            _ => false,
        },
        Value::Null => false,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_url(s: &str) -> bool {
    url::Url::parse(s).is_ok_and(|u| !u.scheme().is_empty() && (u.has_host() || !u.cannot_be_a_base()))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn format_bound(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}
