//! Calling-convention resolution.
//!
//! A request carries an opaque `content` plus two flags; together they
//! encode how the handler wants to be called. [`CallShape::resolve`] maps
//! the triple onto one invocation shape, checked in a fixed order, so the
//! same envelope always resolves the same way. A flag that contradicts the
//! content shape is a [`ShapeError`]; the dispatch engine marshals it back
//! to the caller as an error reply rather than invoking the handler.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::RequestEnvelope;

/// How the handler gets invoked for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum CallShape {
    /// `handler()`: no payload.
    Empty,
    /// `handler(content)`: single-argument convenience form.
    Single(Value),
    /// `handler(*args)`: a sequence of positional arguments.
    Positional(Vec<Value>),
    /// `handler(**kwargs)`: a keyword-argument mapping.
    Keyword(Map<String, Value>),
    /// `handler(*args, **kwargs)`: positional arguments followed by the
    /// keyword mapping.
    Mixed {
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    /// Raw mode: the whole envelope, metadata included, unresolved.
    Raw(RequestEnvelope),
}

impl CallShape {
    /// Resolve the `(has_args, has_kwargs, content)` triple.
    ///
    /// Checked in order: both flags (mixed), `has_args` (positional),
    /// `has_kwargs` (keyword), then non-empty content (single) or empty
    /// content (no arguments). Raw mode never reaches this function; the
    /// dispatch engine wraps the envelope itself.
    pub fn resolve(envelope: RequestEnvelope) -> Result<Self, ShapeError> {
        match (envelope.has_args, envelope.has_kwargs) {
            (true, true) => match envelope.content {
                Value::Array(mut seq) => match seq.pop() {
                    Some(Value::Object(kwargs)) => Ok(Self::Mixed { args: seq, kwargs }),
                    Some(other) => Err(ShapeError::KwargsTailNotMapping(json_type(&other))),
                    None => Err(ShapeError::MissingKwargsTail),
                },
                other => Err(ShapeError::ArgsNotSequence(json_type(&other))),
            },
            (true, false) => match envelope.content {
                Value::Array(seq) => Ok(Self::Positional(seq)),
                other => Err(ShapeError::ArgsNotSequence(json_type(&other))),
            },
            (false, true) => match envelope.content {
                Value::Object(map) => Ok(Self::Keyword(map)),
                other => Err(ShapeError::KwargsNotMapping(json_type(&other))),
            },
            (false, false) => {
                if is_empty_content(&envelope.content) {
                    Ok(Self::Empty)
                } else {
                    Ok(Self::Single(envelope.content))
                }
            }
        }
    }

    /// Short name for logs and error messages.
    #[must_use]
    pub fn variant(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Single(_) => "single",
            Self::Positional(_) => "positional",
            Self::Keyword(_) => "keyword",
            Self::Mixed { .. } => "mixed",
            Self::Raw(_) => "raw",
        }
    }
}

/// JSON null, an empty sequence, an empty mapping and an empty string all
/// count as "no payload".
fn is_empty_content(content: &Value) -> bool {
    match content {
        Value::Null => true,
        Value::Array(seq) => seq.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

/// The flags promised a content shape the payload does not have.
#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("has_args is set but content is {0}, not a sequence")]
    ArgsNotSequence(&'static str),
    #[error("has_kwargs is set but content is {0}, not a mapping")]
    KwargsNotMapping(&'static str),
    #[error("has_args and has_kwargs are set but the sequence is empty")]
    MissingKwargsTail,
    #[error("has_args and has_kwargs are set but the last element is {0}, not a mapping")]
    KwargsTailNotMapping(&'static str),
}
