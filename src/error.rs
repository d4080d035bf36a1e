//! Error taxonomy for the bus and RPC layers.
//!
//! Two families, matching who observes the failure:
//!
//! - [`BusError`]: transport-layer failures seen by whoever owns a
//!   [`Connection`](crate::connection::Connection), a receiver or a sender.
//!   Receive timeouts are **not** errors; they are `Ok(None)` returns, so a
//!   polling loop can distinguish "nothing yet" from "the session is broken".
//! - [`RpcError`]: what a synchronous RPC caller sees: either a transport
//!   failure, a deadline, a malformed reply, or the remote handler's own
//!   failure carried across the bus.
//!
//! Failures that concern a single request (handler errors, malformed
//! envelopes) never surface here; the dispatch engine recovers them locally
//! and converts them into ERROR replies. Failures that concern the connection
//! itself propagate to the lifecycle owner.

use std::time::Duration;

use thiserror::Error;

/// Transport-layer errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker is unreachable, the session is closed, or a binding was
    /// refused. Surfaced to whoever called `open()`/`add_receiver()`; never
    /// retried inside this layer.
    #[error("connection error: {0}")]
    Connection(String),

    /// A genuine transport failure while receiving (timeouts are `Ok(None)`,
    /// not this). Retrying the receive loop is the caller's choice.
    #[error("receive failed on '{address}': {reason}")]
    Receive {
        /// Address the receiver is bound to.
        address: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// A transport failure while publishing. The message may have partially
    /// left the process; callers must not blindly retry.
    #[error("send failed on '{address}': {reason}")]
    Send {
        /// Address the sender is bound to.
        address: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// The address string could not be parsed (empty subject or bus part).
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    /// The broker does not implement the requested operation (e.g. a broker
    /// that can only requeue whole sessions reports `Unsupported("nack")`
    /// instead of silently acking).
    #[error("operation not supported by this broker: {0}")]
    Unsupported(&'static str),

    /// A worker thread could not be started; `start_listening` rolls back.
    #[error("failed to spawn worker '{name}': {reason}")]
    Spawn {
        /// Thread name that failed to start.
        name: String,
        /// OS-reported reason.
        reason: String,
    },

    /// The service was stopped; the `Listening` state cannot be re-entered.
    #[error("service already stopped")]
    AlreadyStopped,
}

/// Errors surfaced to RPC callers by [`RpcClient`](crate::client::RpcClient).
#[derive(Debug, Error)]
pub enum RpcError {
    /// The underlying transport failed before a reply could be observed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// No correlated reply arrived within the caller-supplied deadline.
    #[error("no reply from '{service}' within {waited:?}")]
    Timeout {
        /// Service the request was addressed to.
        service: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The remote handler failed; `message` and `backtrace` are carried
    /// verbatim from the ERROR reply envelope.
    #[error("remote handler failed: {message}")]
    Remote {
        /// The remote error's display form.
        message: String,
        /// Remote backtrace, cleaned of dispatch-engine frames.
        backtrace: String,
    },

    /// Something arrived on the private reply queue that does not decode to
    /// a reply envelope.
    #[error("malformed reply: {0}")]
    MalformedReply(String),
}
