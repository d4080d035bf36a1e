//! Reply routing and error marshalling.
//!
//! Where a reply goes is decided entirely by the request's `reply_to`,
//! in priority order:
//!
//! 1. `bus/subject;options`: an ad hoc sender on `bus`, the reply's
//!    subject is `subject` with the options stripped; the sender lives
//!    for one send.
//! 2. No slash, shared reply sender configured: the reply goes through
//!    it with the full `reply_to` as subject.
//! 3. No slash, no shared sender: an ad hoc sender straight to the
//!    queue named `reply_to`; the subject stays unset.
//!
//! Every path creates its sender through the connection, so replying to
//! an address the session cannot reach surfaces as a routing error the
//! worker logs; it is never raised into the consume loop.
//!
//! Handler failures cross the wire as `error_message` plus a backtrace
//! cleaned of this engine's own frames, so the caller sees the handler's
//! stack, not ours.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::address::Address;
use crate::broker::OutgoingMessage;
use crate::connection::{Connection, Sender};
use crate::envelope::ReplyEnvelope;
use crate::error::BusError;

const NO_BACKTRACE: &str = "no backtrace captured (set RUST_BACKTRACE=1)";

pub(crate) struct ReplyRouter {
    connection: Connection,
    shared: Option<Arc<Mutex<Sender>>>,
    send_timeout: Duration,
}

impl ReplyRouter {
    pub(crate) fn new(
        connection: Connection,
        shared: Option<Arc<Mutex<Sender>>>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            shared,
            send_timeout,
        }
    }

    /// Send `reply` to the address the request asked for.
    pub(crate) fn route(&self, reply_to: &str, mut reply: ReplyEnvelope) -> Result<(), BusError> {
        if reply_to.contains('/') {
            let address = Address::parse(reply_to)?;
            let Some(bus) = address.bus() else {
                return Err(BusError::InvalidAddress(reply_to.to_string()));
            };
            reply.subject = Some(address.subject().to_string());
            let message = encode_reply(reply, reply_to)?;
            let mut sender = self.connection.add_sender(bus)?;
            sender.send(&message, self.send_timeout)
        } else if let Some(shared) = &self.shared {
            reply.subject = Some(reply_to.to_string());
            let message = encode_reply(reply, reply_to)?;
            shared.lock().send(&message, self.send_timeout)
        } else {
            let message = encode_reply(reply, reply_to)?;
            let mut sender = self.connection.add_sender(reply_to)?;
            sender.send(&message, self.send_timeout)
        }
    }
}

fn encode_reply(reply: ReplyEnvelope, reply_to: &str) -> Result<OutgoingMessage, BusError> {
    reply.into_message().map_err(|err| BusError::Send {
        address: reply_to.to_string(),
        reason: format!("reply encoding failed: {err}"),
    })
}

/// Marshal a handler error into `(error_message, backtrace)` wire fields.
pub(crate) fn marshal_error(err: &anyhow::Error) -> (String, String) {
    let message = err.to_string();
    let mut raw = String::new();
    for cause in err.chain().skip(1) {
        let _ = writeln!(raw, "caused by: {cause}");
    }
    let captured = err.backtrace();
    if captured.status() == BacktraceStatus::Captured {
        let _ = writeln!(raw, "{captured}");
    }
    (message, presentable(&raw))
}

/// Marshal a caught panic the same way; the backtrace is captured at the
/// catch site.
pub(crate) fn marshal_panic(payload: &(dyn Any + Send)) -> (String, String) {
    let message = if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "handler panicked".to_string()
    };
    let raw = Backtrace::force_capture().to_string();
    (message, presentable(&raw))
}

fn presentable(raw: &str) -> String {
    let cleaned = clean_backtrace(raw);
    if cleaned.is_empty() {
        NO_BACKTRACE.to_string()
    } else {
        cleaned
    }
}

/// Drop frames that belong to this engine or to panic/backtrace plumbing,
/// along with their `at file:line` continuation lines, so the caller sees
/// only handler-relevant frames.
pub(crate) fn clean_backtrace(raw: &str) -> String {
    const NOISE: &[&str] = &[
        "busrpc::service",
        "std::panicking",
        "core::panicking",
        "std::panic::",
        "rust_begin_unwind",
        "rust_try",
        "catch_unwind",
        "std::backtrace",
        "std::sys",
        "std::rt::",
        "std::thread::",
    ];
    let mut out = String::new();
    let mut skipping = false;
    for line in raw.lines() {
        if line.trim_start().starts_with("at ") {
            if skipping {
                continue;
            }
        } else {
            skipping = NOISE.iter().any(|noise| line.contains(noise));
            if skipping {
                continue;
            }
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}
