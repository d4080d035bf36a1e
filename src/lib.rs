//! # busrpc
//!
//! **busrpc** is a request/reply (RPC) layer built on top of a pub/sub
//! message bus: named services consume requests from a worker pool,
//! invoke plain Rust handlers, and route replies back to the caller with
//! correlation ids and cross-process error marshalling.
//!
//! ## Overview
//!
//! A caller publishes a request envelope carrying a `reply_to` address; a
//! service's receiver delivers it to one idle worker thread (competing
//! consumers); the worker resolves the calling convention from the
//! envelope, invokes the handler, catches any failure, builds an OK or
//! ERROR reply, routes it by the request's own `reply_to`, and only then
//! acknowledges the original message. A crash mid-cycle therefore means
//! redelivery, never a silently lost request.
//!
//! ## Architecture
//!
//! - **[`address`]** - `bus/subject;options` address grammar, parsed once
//! - **[`envelope`]** - the JSON wire protocol: request/reply envelopes
//!   and the calling-convention flags
//! - **[`callshape`]** - deterministic resolution of `(has_args,
//!   has_kwargs, content)` into a handler invocation shape
//! - **[`broker`]** - the transport port (session, receiver, sender
//!   traits) plus [`MemoryBroker`], the in-process reference broker
//! - **[`connection`]** - refcounted session lifecycle and the
//!   receiver/sender endpoints
//! - **[`handler`]** - the handler contract with per-worker lifecycle
//!   hooks
//! - **[`typed`]** - serde-typed handlers (tuples from positional calls,
//!   structs from keyword calls)
//! - **[`service`]** - the dispatch engine: worker pool, reply routing,
//!   metrics, lifecycle
//! - **[`client`]** - the calling side: correlated request/reply with
//!   timeouts
//! - **[`error`]** - transport ([`BusError`]) and call-level
//!   ([`RpcError`]) failures
//! - **[`logging`]** - process-wide tracing setup
//!
//! ## Quick Start
//!
//! ```
//! use busrpc::{typed_fn, Connection, MemoryBroker, RequestBuilder, RpcClient,
//!              Service, ServiceConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let broker = MemoryBroker::new();
//!
//!     // A service named "calc" on the "lofar" bus, two workers.
//!     let config = ServiceConfig::new("calc").with_bus("lofar").with_num_threads(2);
//!     let factory = typed_fn(|(a, b): (i64, i64)| Ok(a + b));
//!     let mut service = Service::new(Connection::new(broker.clone()), config, factory);
//!     service.start_listening()?;
//!
//!     // Call it: add(2, 3).
//!     let client = RpcClient::connect(Connection::new(broker), "calc", Some("lofar".into()))?;
//!     let sum = client.call(RequestBuilder::new().arg(2).arg(3))?;
//!     assert_eq!(sum, serde_json::json!(5));
//!
//!     service.stop_listening();
//!     Ok(())
//! }
//! ```
//!
//! ## Delivery semantics
//!
//! - **At-least-once**: requests are acknowledged only after the reply
//!   was attempted; redelivered requests may execute twice, so handlers
//!   should be idempotent by caller contract.
//! - **Failures are results**: a handler error (or panic) becomes an
//!   ERROR reply carrying the message and a backtrace cleaned of this
//!   engine's frames; the request still acks, the worker lives on.
//! - **Foreign traffic** on a service address is rejected, not crashed
//!   on.
//!
//! ## Runtime Considerations
//!
//! busrpc uses plain OS threads and blocking timed receives; there is no
//! async runtime to integrate with. Worker count, prefetch capacity and
//! receive timeout come from [`ServiceConfig`], overridable via the
//! `BUSRPC_NUM_THREADS`, `BUSRPC_CAPACITY` and `BUSRPC_RECEIVE_TIMEOUT_MS`
//! environment variables. Shutdown latency is bounded by the receive
//! timeout (default 1 s).

pub mod address;
pub mod broker;
pub mod callshape;
pub mod client;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod ids;
pub mod logging;
pub mod service;
pub mod typed;

pub use address::Address;
pub use broker::{
    Broker, BrokerReceiver, BrokerSender, BrokerSession, Delivery, MemoryBroker, OutgoingMessage,
    ReceiverOptions,
};
pub use callshape::{CallShape, ShapeError};
pub use client::RpcClient;
pub use connection::{Connection, Receiver, Sender};
pub use envelope::{Envelope, ReplyEnvelope, ReplyStatus, RequestBuilder, RequestEnvelope};
pub use error::{BusError, RpcError};
pub use handler::{handler_fn, HandlerFactory, ServiceHandler};
pub use ids::CorrelationId;
pub use service::{Service, ServiceConfig, ServiceMetrics};
pub use typed::{typed_fn, Typed, TypedHandler};
