//! The per-thread consume loop.
//!
//! Each worker owns its receiver and its handler outright. One iteration:
//! `prepare_receive` hook, timed receive, foreign-traffic check, resolve
//! and invoke (panics caught), reply, ack, `finalize_handling` hook. The
//! request is acked only after the reply was attempted, so a worker that
//! dies mid-cycle leaves the message for redelivery instead of losing it.
//! Nothing a handler does can kill the loop; only the running flag (or a
//! dropped transport on shutdown) ends it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::callshape::CallShape;
use crate::connection::Receiver;
use crate::envelope::{Envelope, ReplyEnvelope, RequestEnvelope};
use crate::handler::ServiceHandler;
use crate::service::metrics::ServiceMetrics;
use crate::service::reply::{marshal_error, marshal_panic, ReplyRouter};

/// Pause after a transport-level receive failure before retrying, so a
/// dead broker does not spin the loop.
const RECEIVE_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) struct Worker {
    pub(crate) service_name: String,
    pub(crate) index: usize,
    pub(crate) receiver: Receiver,
    pub(crate) handler: Box<dyn ServiceHandler>,
    pub(crate) router: ReplyRouter,
    pub(crate) metrics: Arc<ServiceMetrics>,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) receive_timeout: Duration,
    pub(crate) parse_full_message: bool,
    pub(crate) verbose: bool,
}

impl Worker {
    pub(crate) fn run(mut self) {
        self.handler.prepare_loop();
        while self.running.load(Ordering::Acquire) {
            self.handler.prepare_receive();

            let delivery = match self.receiver.receive(self.receive_timeout) {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(err) => {
                    warn!(
                        service = %self.service_name,
                        worker = self.index,
                        error = %err,
                        "Receive failed, backing off"
                    );
                    thread::sleep(RECEIVE_BACKOFF);
                    continue;
                }
            };
            self.metrics.record_received();

            let request = match Envelope::decode(&delivery.payload) {
                Ok(Envelope::Request(request)) => request,
                Ok(Envelope::Reply(_)) | Err(_) => {
                    debug!(
                        service = %self.service_name,
                        worker = self.index,
                        "Rejecting foreign message"
                    );
                    if let Err(err) = self.receiver.reject(&delivery) {
                        warn!(
                            service = %self.service_name,
                            worker = self.index,
                            error = %err,
                            "Failed to reject foreign message"
                        );
                    }
                    self.metrics.record_rejected();
                    continue;
                }
            };

            let reply_to = request.reply_to.clone();
            let subject = request.subject.clone();
            let (reply, success) = self.execute(request);

            match &reply_to {
                Some(reply_to) => {
                    // Send failures are logged, never raised: the work is
                    // done, redelivery would duplicate its side effects.
                    if let Err(err) = self.router.route(reply_to, reply) {
                        error!(
                            service = %self.service_name,
                            worker = self.index,
                            reply_to = %reply_to,
                            error = %err,
                            "Failed to send reply"
                        );
                    }
                }
                // No reply_to: a fire-and-forget notification.
                None => drop(reply),
            }

            if let Err(err) = self.receiver.ack(&delivery) {
                error!(
                    service = %self.service_name,
                    worker = self.index,
                    error = %err,
                    "Failed to acknowledge message"
                );
            }

            if success {
                self.metrics.record_handled_ok();
            } else {
                self.metrics.record_handled_error();
            }
            self.handler.finalize_handling(success);

            if self.verbose {
                info!(
                    service = %self.service_name,
                    worker = self.index,
                    subject = subject.as_deref().unwrap_or("-"),
                    success,
                    "Request handled"
                );
            } else {
                debug!(
                    service = %self.service_name,
                    worker = self.index,
                    subject = subject.as_deref().unwrap_or("-"),
                    success,
                    "Request handled"
                );
            }
        }
        self.handler.finalize_loop();
        debug!(service = %self.service_name, worker = self.index, "Worker stopped");
    }

    /// Resolve the calling convention and run the handler; every failure
    /// mode becomes an error reply.
    fn execute(&mut self, request: RequestEnvelope) -> (ReplyEnvelope, bool) {
        let correlation_id = request.correlation_id;
        let call = if self.parse_full_message {
            CallShape::Raw(request)
        } else {
            match CallShape::resolve(request) {
                Ok(call) => call,
                Err(err) => {
                    warn!(
                        service = %self.service_name,
                        worker = self.index,
                        error = %err,
                        "Request flags do not match its content"
                    );
                    let err = anyhow::Error::new(err);
                    let (message, backtrace) = marshal_error(&err);
                    return (
                        ReplyEnvelope::error(message, backtrace, correlation_id),
                        false,
                    );
                }
            }
        };

        match catch_unwind(AssertUnwindSafe(|| self.handler.handle_message(call))) {
            Ok(Ok(content)) => (ReplyEnvelope::ok(content, correlation_id), true),
            Ok(Err(err)) => {
                warn!(
                    service = %self.service_name,
                    worker = self.index,
                    error = %err,
                    "Handler failed"
                );
                let (message, backtrace) = marshal_error(&err);
                (
                    ReplyEnvelope::error(message, backtrace, correlation_id),
                    false,
                )
            }
            Err(payload) => {
                let (message, backtrace) = marshal_panic(payload.as_ref());
                error!(
                    service = %self.service_name,
                    worker = self.index,
                    panic = %message,
                    "Handler panicked"
                );
                (
                    ReplyEnvelope::error(message, backtrace, correlation_id),
                    false,
                )
            }
        }
    }
}
