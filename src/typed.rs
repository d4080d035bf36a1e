//! Typed handlers: serde types in, serde types out.
//!
//! [`TypedHandler`] spares business logic the JSON plumbing: the adapter
//! deserializes the resolved call into the handler's request type and
//! serializes its response back into reply content. Positional calls
//! deserialize into tuples, keyword calls into structs, single-value
//! calls into whatever matches:
//!
//! ```
//! use busrpc::typed::typed_fn;
//!
//! // add(2, 3) arrives as a positional call and lands in a tuple.
//! let factory = typed_fn(|(a, b): (i64, i64)| Ok(a + b));
//! # let _ = factory;
//! ```
//!
//! Mixed and raw calls have no single serde shape; handlers that need
//! them implement [`ServiceHandler`] directly.

use std::marker::PhantomData;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::callshape::CallShape;
use crate::handler::{HandlerFactory, ServiceHandler};

/// Request/response business logic with serde at the boundary.
pub trait TypedHandler: Send {
    type Request: DeserializeOwned + Send;
    type Response: Serialize;

    fn handle(&mut self, request: Self::Request) -> anyhow::Result<Self::Response>;
}

/// Adapts a [`TypedHandler`] to the worker-facing [`ServiceHandler`].
pub struct Typed<H> {
    inner: H,
}

impl<H: TypedHandler> Typed<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

impl<H: TypedHandler> ServiceHandler for Typed<H> {
    fn handle_message(&mut self, call: CallShape) -> anyhow::Result<Value> {
        let value = match call {
            CallShape::Empty => Value::Null,
            CallShape::Single(value) => value,
            CallShape::Positional(args) => Value::Array(args),
            CallShape::Keyword(map) => Value::Object(map),
            other @ (CallShape::Mixed { .. } | CallShape::Raw(_)) => {
                anyhow::bail!("typed handlers cannot take a {} call", other.variant())
            }
        };
        let request = serde_json::from_value(value)
            .context("request does not match the handler's request type")?;
        let response = self.inner.handle(request)?;
        serde_json::to_value(response).context("response failed to serialize")
    }
}

/// Lift a typed closure into a [`HandlerFactory`]; each worker gets its
/// own clone.
pub fn typed_fn<Req, Resp, F>(f: F) -> impl HandlerFactory
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + 'static,
    F: FnMut(Req) -> anyhow::Result<Resp> + Clone + Send + Sync + 'static,
{
    TypedFnFactory {
        f,
        _marker: PhantomData,
    }
}

struct TypedFnFactory<Req, Resp, F> {
    f: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> HandlerFactory for TypedFnFactory<Req, Resp, F>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + 'static,
    F: FnMut(Req) -> anyhow::Result<Resp> + Clone + Send + Sync + 'static,
{
    fn new_handler(&self) -> Box<dyn ServiceHandler> {
        Box::new(Typed::new(TypedFn {
            f: self.f.clone(),
            _marker: PhantomData,
        }))
    }
}

struct TypedFn<Req, Resp, F> {
    f: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> TypedHandler for TypedFn<Req, Resp, F>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + 'static,
    F: FnMut(Req) -> anyhow::Result<Resp> + Send + 'static,
{
    type Request = Req;
    type Response = Resp;

    fn handle(&mut self, request: Req) -> anyhow::Result<Resp> {
        (self.f)(request)
    }
}
