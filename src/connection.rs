//! Connection lifecycle and the receiving/sending endpoints.
//!
//! A [`Connection`] wraps one broker session behind a refcount: `open`
//! increments, `close` decrements, and the session is torn down when the
//! count reaches zero, so several components (a service's workers, its
//! reply sender, an embedded client) can share one transport without
//! coordinating shutdown order. Clones share the refcount.
//!
//! [`Receiver`] and [`Sender`] are deliberately not thread-safe: each
//! worker owns its receiver outright, and the one sender that is shared
//! (the service's reply sender) is serialized behind a mutex by its owner.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::address::Address;
use crate::broker::{
    Broker, BrokerReceiver, BrokerSender, BrokerSession, Delivery, OutgoingMessage,
    ReceiverOptions,
};
use crate::error::BusError;

/// A refcounted handle to one broker session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    broker: Arc<dyn Broker>,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    session: Option<Arc<dyn BrokerSession>>,
    open_count: usize,
}

impl Connection {
    /// Wrap a broker endpoint. No transport work happens until [`open`].
    ///
    /// [`open`]: Connection::open
    pub fn new<B: Broker + 'static>(broker: B) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                broker: Arc::new(broker),
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Establish the session on first call; later calls only bump the
    /// refcount. Fails with [`BusError::Connection`] when the broker is
    /// unreachable; no internal retry.
    pub fn open(&self) -> Result<(), BusError> {
        let mut state = self.inner.state.lock();
        if state.open_count == 0 {
            let session = self.inner.broker.connect()?;
            state.session = Some(Arc::from(session));
            debug!("Connection opened");
        }
        state.open_count += 1;
        Ok(())
    }

    /// Drop one reference to the session; tears the transport down when
    /// the last one goes. Safe to call on a closed connection.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.open_count == 0 {
            return;
        }
        state.open_count -= 1;
        if state.open_count == 0 {
            if let Some(session) = state.session.take() {
                session.close();
                debug!("Connection closed");
            }
        }
    }

    /// Whether the session is currently established.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().open_count > 0
    }

    /// Bind a [`Receiver`] to `address`.
    pub fn add_receiver(
        &self,
        address: &str,
        options: ReceiverOptions,
    ) -> Result<Receiver, BusError> {
        let address = Address::parse(address)?;
        let session = self.current_session()?;
        let receiver = session.subscribe(&address, &options)?;
        Ok(Receiver { receiver, address })
    }

    /// Create a [`Sender`] for `address`.
    pub fn add_sender(&self, address: &str) -> Result<Sender, BusError> {
        let address = Address::parse(address)?;
        let session = self.current_session()?;
        let sender = session.sender(&address)?;
        Ok(Sender { sender, address })
    }

    fn current_session(&self) -> Result<Arc<dyn BrokerSession>, BusError> {
        self.inner
            .state
            .lock()
            .session
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| BusError::Connection("connection not open".to_string()))
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        // Last handle gone: close regardless of refcount so no exit path
        // leaks a session.
        if let Some(session) = self.state.get_mut().session.take() {
            session.close();
        }
    }
}

/// A consuming endpoint bound to one address.
pub struct Receiver {
    receiver: Box<dyn BrokerReceiver>,
    address: Address,
}

impl Receiver {
    /// Wait up to `timeout` for a delivery; `Ok(None)` on timeout.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, BusError> {
        self.receiver.receive(timeout)
    }

    /// Acknowledge a delivery as handled.
    pub fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.receiver.ack(delivery)
    }

    /// Requeue a delivery for redelivery.
    pub fn nack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.receiver.nack(delivery)
    }

    /// Discard a delivery permanently.
    pub fn reject(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.receiver.reject(delivery)
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }
}

/// A publishing endpoint bound to one address.
pub struct Sender {
    sender: Box<dyn BrokerSender>,
    address: Address,
}

impl Sender {
    /// Publish one message.
    pub fn send(&mut self, message: &OutgoingMessage, timeout: Duration) -> Result<(), BusError> {
        self.sender.send(message, timeout)
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }
}
