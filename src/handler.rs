//! The handler contract: what business logic implements to serve requests.
//!
//! A [`ServiceHandler`] is owned by exactly one worker thread, which calls
//! its lifecycle hooks around every step of the consume loop. Handlers are
//! produced per worker by a [`HandlerFactory`], so handler state is
//! thread-local and never needs locking.
//!
//! Stateless handlers don't need the ceremony; [`handler_fn`] lifts a
//! closure into a factory:
//!
//! ```
//! use busrpc::handler::handler_fn;
//! use busrpc::CallShape;
//! use serde_json::{json, Value};
//!
//! let factory = handler_fn(|call: CallShape| -> anyhow::Result<Value> {
//!     match call {
//!         CallShape::Positional(args) => Ok(json!(args.len())),
//!         other => anyhow::bail!("unexpected {} call", other.variant()),
//!     }
//! });
//! ```

use serde_json::Value;

use crate::callshape::CallShape;

/// Business logic invoked by a worker, one instance per worker thread.
///
/// Only [`handle_message`] is mandatory; the lifecycle hooks default to
/// no-ops. Hook order per worker: `prepare_loop` once, then per iteration
/// `prepare_receive` before the timed receive and `finalize_handling`
/// after a request was handled (with the success flag), then
/// `finalize_loop` once on shutdown.
///
/// [`handle_message`]: ServiceHandler::handle_message
pub trait ServiceHandler: Send {
    /// Runs once before the worker enters its consume loop.
    fn prepare_loop(&mut self) {}

    /// Runs before every receive attempt (lease refresh and the like).
    fn prepare_receive(&mut self) {}

    /// Handle one request. The returned value becomes the reply content;
    /// an error (or a panic) is marshalled to the caller as an ERROR
    /// reply. Failures here are business results, not worker faults.
    fn handle_message(&mut self, call: CallShape) -> anyhow::Result<Value>;

    /// Runs after a request was fully handled (reply sent, message
    /// acked); `succeeded` is false when the handler failed.
    fn finalize_handling(&mut self, succeeded: bool) {
        let _ = succeeded;
    }

    /// Runs once after the worker leaves its consume loop.
    fn finalize_loop(&mut self) {}
}

/// Produces one [`ServiceHandler`] per worker thread.
pub trait HandlerFactory: Send + Sync {
    fn new_handler(&self) -> Box<dyn ServiceHandler>;
}

/// Any `Fn() -> Box<dyn ServiceHandler>` closure is a factory.
impl<F> HandlerFactory for F
where
    F: Fn() -> Box<dyn ServiceHandler> + Send + Sync,
{
    fn new_handler(&self) -> Box<dyn ServiceHandler> {
        self()
    }
}

/// Lift a request-handling closure into a [`HandlerFactory`]. Each worker
/// gets its own clone, so captured state is per thread.
pub fn handler_fn<F>(f: F) -> impl HandlerFactory
where
    F: FnMut(CallShape) -> anyhow::Result<Value> + Clone + Send + Sync + 'static,
{
    FnFactory(f)
}

struct FnFactory<F>(F);

impl<F> HandlerFactory for FnFactory<F>
where
    F: FnMut(CallShape) -> anyhow::Result<Value> + Clone + Send + Sync + 'static,
{
    fn new_handler(&self) -> Box<dyn ServiceHandler> {
        Box::new(FnHandler(self.0.clone()))
    }
}

struct FnHandler<F>(F);

impl<F> ServiceHandler for FnHandler<F>
where
    F: FnMut(CallShape) -> anyhow::Result<Value> + Send + 'static,
{
    fn handle_message(&mut self, call: CallShape) -> anyhow::Result<Value> {
        (self.0)(call)
    }
}
