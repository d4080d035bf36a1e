//! The calling side: correlated request/reply over the bus.
//!
//! An [`RpcClient`] publishes requests to one service and waits for the
//! correlated reply on a private reply address created per call, bound
//! before the request goes out so the reply cannot arrive unheard. Remote
//! handler failures come back as [`RpcError::Remote`] carrying the
//! marshalled message and backtrace.
//!
//! ```no_run
//! use busrpc::{Connection, MemoryBroker, RequestBuilder, RpcClient};
//!
//! # fn main() -> Result<(), busrpc::RpcError> {
//! let connection = Connection::new(MemoryBroker::new());
//! let client = RpcClient::connect(connection, "calc", Some("lofar".into()))?;
//! let sum = client.call(RequestBuilder::new().arg(2).arg(3))?;
//! assert_eq!(sum, serde_json::json!(5));
//! # Ok(())
//! # }
//! ```

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::broker::ReceiverOptions;
use crate::connection::{Connection, Sender};
use crate::envelope::{Envelope, ReplyStatus, RequestBuilder, RequestEnvelope};
use crate::error::{BusError, RpcError};
use crate::ids::CorrelationId;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected caller for one service.
pub struct RpcClient {
    connection: Connection,
    service_name: String,
    bus_name: Option<String>,
    target: String,
    sender: Mutex<Sender>,
    timeout: Duration,
    send_timeout: Duration,
}

impl RpcClient {
    /// Open the connection and bind a sender for `service_name`, routed
    /// over `bus_name` when given, as a plain queue otherwise.
    pub fn connect(
        connection: Connection,
        service_name: impl Into<String>,
        bus_name: Option<String>,
    ) -> Result<Self, RpcError> {
        let service_name = service_name.into();
        connection.open()?;
        let target = match &bus_name {
            Some(bus) => format!("{bus}/{service_name}"),
            None => service_name.clone(),
        };
        let sender = match connection.add_sender(&target) {
            Ok(sender) => sender,
            Err(err) => {
                connection.close();
                return Err(err.into());
            }
        };
        Ok(Self {
            connection,
            service_name,
            bus_name,
            target,
            sender: Mutex::new(sender),
            timeout: DEFAULT_CALL_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        })
    }

    /// Change the default reply wait (10 s).
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a request and wait for its reply.
    pub fn call(&self, request: RequestBuilder) -> Result<Value, RpcError> {
        self.call_with_timeout(request, self.timeout)
    }

    /// Send a request and wait up to `timeout` for its reply.
    pub fn call_with_timeout(
        &self,
        request: RequestBuilder,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let correlation_id = CorrelationId::new();
        let reply_to = match &self.bus_name {
            Some(bus) => format!("{bus}/reply.{correlation_id}"),
            None => format!("reply.{}.{correlation_id}", self.service_name),
        };

        // Bind before sending so the reply cannot beat the subscription.
        let mut replies = self.connection.add_receiver(
            &reply_to,
            ReceiverOptions {
                capacity: 1,
                exclusive: false,
            },
        )?;

        let envelope = self
            .stamp(request)
            .reply_to(reply_to.clone())
            .correlation_id(correlation_id)
            .build();
        self.publish(envelope)?;

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(RpcError::Timeout {
                    service: self.service_name.clone(),
                    waited: timeout,
                });
            }
            let Some(delivery) = replies.receive(deadline - now)? else {
                continue;
            };
            match Envelope::decode(&delivery.payload) {
                Err(err) => {
                    if let Err(ack_err) = replies.ack(&delivery) {
                        debug!(error = %ack_err, "Failed to ack malformed reply");
                    }
                    return Err(RpcError::MalformedReply(err.to_string()));
                }
                Ok(Envelope::Request(_)) => {
                    // Foreign traffic on our private reply address.
                    if let Err(reject_err) = replies.reject(&delivery) {
                        debug!(error = %reject_err, "Failed to reject foreign message");
                    }
                }
                Ok(Envelope::Reply(reply)) => {
                    if reply.correlation_id != Some(correlation_id) {
                        debug!(
                            service = %self.service_name,
                            "Skipping reply with stale correlation id"
                        );
                        if let Err(ack_err) = replies.ack(&delivery) {
                            debug!(error = %ack_err, "Failed to ack stale reply");
                        }
                        continue;
                    }
                    if let Err(ack_err) = replies.ack(&delivery) {
                        debug!(error = %ack_err, "Failed to ack reply");
                    }
                    return match reply.status {
                        ReplyStatus::Ok => Ok(reply.content),
                        ReplyStatus::Error => Err(RpcError::Remote {
                            message: reply.error_message,
                            backtrace: reply.backtrace,
                        }),
                    };
                }
            }
        }
    }

    /// Fire-and-forget: publish without a reply address and return as
    /// soon as the broker takes the message.
    pub fn notify(&self, request: RequestBuilder) -> Result<(), RpcError> {
        let envelope = self.stamp(request).build();
        self.publish(envelope)
    }

    /// On a topic bus the request must carry the service name as its
    /// routing key; on a plain queue the key stays unset.
    fn stamp(&self, request: RequestBuilder) -> RequestBuilder {
        if self.bus_name.is_some() {
            request.subject(self.service_name.clone())
        } else {
            request
        }
    }

    fn publish(&self, envelope: RequestEnvelope) -> Result<(), RpcError> {
        let message = envelope.into_message().map_err(|err| {
            RpcError::Bus(BusError::Send {
                address: self.target.clone(),
                reason: format!("request encoding failed: {err}"),
            })
        })?;
        self.sender.lock().send(&message, self.send_timeout)?;
        Ok(())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.connection.close();
    }
}
