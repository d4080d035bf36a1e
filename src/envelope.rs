//! Wire protocol: the request and reply envelopes.
//!
//! Every message this layer exchanges is one JSON-encoded [`Envelope`],
//! internally tagged with `kind` so request and reply traffic can share an
//! address without ambiguity. Payload `content` is an opaque
//! [`serde_json::Value`]; task specifications, parsets and the like are
//! somebody else's schema, this layer only moves them.
//!
//! The calling convention (positional arguments, keyword arguments, both, a
//! single value, or nothing) is encoded by two boolean flags plus a content
//! shape; [`RequestBuilder`] produces it and
//! [`CallShape::resolve`](crate::callshape::CallShape::resolve) consumes it.
//! Bytes that do not decode to an `Envelope`, or decode to the wrong kind
//! for the consumer, are foreign traffic and are rejected, not crashed on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::broker::OutgoingMessage;
use crate::ids::CorrelationId;

/// A message on the wire: request or reply, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// A request published by an RPC caller.
    Request(RequestEnvelope),
    /// A reply published by the dispatch engine.
    Reply(ReplyEnvelope),
}

impl Envelope {
    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the JSON wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A request: opaque payload plus calling-convention flags and reply routing.
///
/// Created by the sender, immutable once published; the dispatch engine
/// treats it as read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Opaque payload. Positional arguments arrive as a JSON array, keyword
    /// arguments as a JSON object; see the flags below.
    #[serde(default)]
    pub content: Value,
    /// Routing key the request was published under (usually the service
    /// name on a topic bus).
    #[serde(default)]
    pub subject: Option<String>,
    /// Address the reply should be published to. Absent for
    /// fire-and-forget notifications.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// `content` is a sequence of positional arguments (or, together with
    /// `has_kwargs`, a sequence whose last element is the keyword map).
    #[serde(default)]
    pub has_args: bool,
    /// `content` is a keyword-argument mapping (or carries one as the last
    /// element of the sequence when `has_args` is also set).
    #[serde(default)]
    pub has_kwargs: bool,
    /// Caller-stamped id copied onto the reply for correlation.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

impl RequestEnvelope {
    /// Package for publishing; the broker-level subject is the envelope's
    /// routing key.
    pub fn into_message(self) -> Result<OutgoingMessage, serde_json::Error> {
        let subject = self.subject.clone();
        Ok(OutgoingMessage {
            payload: Envelope::Request(self).encode()?,
            subject,
        })
    }
}

/// Reply outcome marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// The handler returned a value; `content` carries it.
    Ok,
    /// The handler failed; `error_message` and `backtrace` carry the fault.
    Error,
}

/// A reply: handler result or marshalled failure, created exactly once per
/// handled request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// The handler's return value on success, JSON null on error.
    #[serde(default)]
    pub content: Value,
    /// Success or failure.
    pub status: ReplyStatus,
    /// The remote error's display form; empty on success.
    #[serde(default)]
    pub error_message: String,
    /// Remote backtrace cleaned of dispatch-engine frames; empty on success.
    #[serde(default)]
    pub backtrace: String,
    /// Correlation key derived from the request's `reply_to` by the reply
    /// router; also the broker-level routing key when replying via a bus.
    #[serde(default)]
    pub subject: Option<String>,
    /// Copied verbatim from the request.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

impl ReplyEnvelope {
    /// Build a success reply.
    #[must_use]
    pub fn ok(content: Value, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            content,
            status: ReplyStatus::Ok,
            error_message: String::new(),
            backtrace: String::new(),
            subject: None,
            correlation_id,
        }
    }

    /// Build an error reply carrying a marshalled failure.
    #[must_use]
    pub fn error(
        error_message: String,
        backtrace: String,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self {
            content: Value::Null,
            status: ReplyStatus::Error,
            error_message,
            backtrace,
            subject: None,
            correlation_id,
        }
    }

    /// Whether the remote handler succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// Package for publishing; the broker-level subject is the reply's
    /// correlation subject (set by the reply router).
    pub fn into_message(self) -> Result<OutgoingMessage, serde_json::Error> {
        let subject = self.subject.clone();
        Ok(OutgoingMessage {
            payload: Envelope::Reply(self).encode()?,
            subject,
        })
    }
}

/// Caller-side encoding of the calling convention.
///
/// Accumulates positional and keyword arguments and produces a
/// [`RequestEnvelope`] whose flags and content shape the dispatch engine
/// resolves back into the same invocation:
///
/// ```
/// use busrpc::envelope::RequestBuilder;
///
/// let request = RequestBuilder::new()
///     .arg(1)
///     .arg(2)
///     .kwarg("key", 3)
///     .build();
/// assert!(request.has_args && request.has_kwargs);
/// ```
#[derive(Debug, Default, Clone)]
pub struct RequestBuilder {
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    single: Option<Value>,
    subject: Option<String>,
    reply_to: Option<String>,
    correlation_id: Option<CorrelationId>,
}

impl RequestBuilder {
    /// Start an empty request (`handler()` form).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Add a keyword argument. Later values win on duplicate keys.
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Use the single-argument convenience form (`handler(content)`).
    /// Ignored when positional or keyword arguments are present.
    #[must_use]
    pub fn content(mut self, value: impl Into<Value>) -> Self {
        self.single = Some(value.into());
        self
    }

    /// Set the routing key (the service name on a topic bus).
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the address the reply should be published to.
    #[must_use]
    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Stamp a correlation id.
    #[must_use]
    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Encode the accumulated arguments into the envelope's
    /// flags-plus-content form.
    #[must_use]
    pub fn build(self) -> RequestEnvelope {
        let (content, has_args, has_kwargs) = match (self.args.is_empty(), self.kwargs.is_empty())
        {
            // Mixed form: positional args followed by the keyword map.
            (false, false) => {
                let mut seq = self.args;
                seq.push(Value::Object(self.kwargs));
                (Value::Array(seq), true, true)
            }
            (false, true) => (Value::Array(self.args), true, false),
            (true, false) => (Value::Object(self.kwargs), false, true),
            (true, true) => (self.single.unwrap_or(Value::Null), false, false),
        };
        RequestEnvelope {
            content,
            subject: self.subject,
            reply_to: self.reply_to,
            has_args,
            has_kwargs,
            correlation_id: self.correlation_id,
        }
    }
}
