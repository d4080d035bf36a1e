//! The broker port: the seam between this crate and a message broker.
//!
//! Everything above this module (connections, the dispatch engine, the RPC
//! client) talks to the broker exclusively through these traits, so the
//! transport can be swapped without touching dispatch logic. The crate
//! ships [`MemoryBroker`] as the in-process reference implementation; a
//! networked broker plugs in by implementing the same four traits.
//!
//! Delivery semantics the port assumes: at-least-once with explicit
//! acknowledgement. A delivery stays outstanding until the receiver acks,
//! nacks (requeue) or rejects (discard) it; unacked deliveries go back to
//! the queue when the receiver goes away.

mod memory;

pub use memory::MemoryBroker;

use std::time::Duration;

use crate::address::Address;
use crate::error::BusError;

/// A broker endpoint that can hand out sessions.
pub trait Broker: Send + Sync {
    /// Establish a session. Fails with [`BusError::Connection`] when the
    /// broker is unreachable.
    fn connect(&self) -> Result<Box<dyn BrokerSession>, BusError>;
}

/// One established session; receivers and senders are created from it and
/// die with it.
pub trait BrokerSession: Send + Sync {
    /// Bind a receiver to an address.
    fn subscribe(
        &self,
        address: &Address,
        options: &ReceiverOptions,
    ) -> Result<Box<dyn BrokerReceiver>, BusError>;

    /// Create a sender for an address.
    fn sender(&self, address: &Address) -> Result<Box<dyn BrokerSender>, BusError>;

    /// Tear the session down. Safe to call more than once; subsequent
    /// operations on the session and its endpoints fail.
    fn close(&self);
}

/// A consuming endpoint. Not thread-safe; owned by exactly one worker.
pub trait BrokerReceiver: Send {
    /// Block up to `timeout` for the next delivery. `Ok(None)` means the
    /// timeout elapsed, which is routine, not an error.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, BusError>;

    /// Mark the delivery handled; the broker may discard it.
    fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError>;

    /// Return the delivery for redelivery. Brokers that cannot requeue
    /// report [`BusError::Unsupported`] instead of degrading to an ack.
    fn nack(&mut self, delivery: &Delivery) -> Result<(), BusError>;

    /// Discard the delivery permanently (foreign or poisonous traffic).
    fn reject(&mut self, delivery: &Delivery) -> Result<(), BusError>;
}

/// A publishing endpoint. Not thread-safe; callers that share one wrap it
/// in a mutex.
pub trait BrokerSender: Send {
    /// Publish one message, blocking up to `timeout` for broker
    /// confirmation where the transport supports it.
    fn send(&mut self, message: &OutgoingMessage, timeout: Duration) -> Result<(), BusError>;
}

/// One inbound message as handed to a receiver.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The raw message body.
    pub payload: Vec<u8>,
    /// Broker-level routing key the message was published under, if any.
    pub subject: Option<String>,
    /// The broker has handed this delivery out before.
    pub redelivered: bool,
    /// Acknowledgement handle, unique per receiver.
    pub tag: u64,
}

/// One outbound message.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// The raw message body.
    pub payload: Vec<u8>,
    /// Broker-level routing key; `None` publishes straight to the queue
    /// the sender is bound to.
    pub subject: Option<String>,
}

/// Subscription tuning passed to [`BrokerSession::subscribe`].
#[derive(Debug, Clone, Copy)]
pub struct ReceiverOptions {
    /// Prefetch window: the broker stops handing out messages while this
    /// many deliveries are unacked. Minimum 1.
    pub capacity: usize,
    /// Join the shared group queue for the subject (competing consumers)
    /// instead of taking a private copy of every message.
    pub exclusive: bool,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            capacity: 1,
            exclusive: false,
        }
    }
}
