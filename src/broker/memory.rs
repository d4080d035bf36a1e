//! In-process broker, the behavioral reference for the port.
//!
//! Routing model:
//!
//! - A plain address (`tasks`) is one shared queue. Receivers compete for
//!   its messages; either side creates the queue on first use.
//! - A topic address (`bus/key`) routes by exact key match inside the
//!   `bus` exchange. Exclusive subscribers share one group queue per key
//!   (competing consumers); non-exclusive subscribers each get a private
//!   copy of every message. Publishing to a key nobody is bound to drops
//!   the message.
//! - A sender on a plain address publishes into the exchange of that name
//!   when the outgoing message carries a subject, and straight to the
//!   queue when it does not.
//!
//! Delivery is at-least-once: unacked messages are requeued (marked
//! redelivered) when their receiver is dropped, `nack` requeues at the
//! front, `reject` discards.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::address::Address;
use crate::broker::{
    Broker, BrokerReceiver, BrokerSender, BrokerSession, Delivery, OutgoingMessage,
    ReceiverOptions,
};
use crate::error::BusError;

/// The broker handle. Cloning shares the underlying queues, so every
/// session connected through clones of one `MemoryBroker` sees the same
/// traffic.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Broker for MemoryBroker {
    fn connect(&self) -> Result<Box<dyn BrokerSession>, BusError> {
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

#[derive(Default)]
struct BrokerState {
    queues: DashMap<String, Arc<Queue>>,
    exchanges: DashMap<String, Arc<Exchange>>,
    copy_ids: AtomicU64,
}

#[derive(Default)]
struct Exchange {
    bindings: Mutex<HashMap<String, Binding>>,
}

#[derive(Default)]
struct Binding {
    /// Shared queue for exclusive subscribers; persists once created so
    /// messages published between consumers are not lost.
    group: Option<Arc<Queue>>,
    /// Private fan-out queues, one per non-exclusive subscriber.
    copies: Vec<(u64, Arc<Queue>)>,
}

#[derive(Default)]
struct Queue {
    messages: Mutex<VecDeque<QueuedMessage>>,
    available: Condvar,
}

#[derive(Clone)]
struct QueuedMessage {
    payload: Vec<u8>,
    subject: Option<String>,
    redelivered: bool,
}

impl Queue {
    fn push_back(&self, message: QueuedMessage) {
        self.messages.lock().push_back(message);
        self.available.notify_one();
    }

    fn push_front(&self, message: QueuedMessage) {
        self.messages.lock().push_front(message);
        self.available.notify_one();
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<QueuedMessage> {
        let deadline = Instant::now() + timeout;
        let mut messages = self.messages.lock();
        loop {
            if let Some(message) = messages.pop_front() {
                return Some(message);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let timed_out = self
                .available
                .wait_for(&mut messages, deadline - now)
                .timed_out();
            if timed_out && messages.is_empty() {
                return None;
            }
        }
    }
}

struct MemorySession {
    state: Arc<BrokerState>,
    closed: Arc<AtomicBool>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Connection("session closed".to_string()));
        }
        Ok(())
    }
}

impl BrokerSession for MemorySession {
    fn subscribe(
        &self,
        address: &Address,
        options: &ReceiverOptions,
    ) -> Result<Box<dyn BrokerReceiver>, BusError> {
        self.ensure_open()?;
        let (queue, copy) = match address.bus() {
            Some(bus) => {
                let exchange = self
                    .state
                    .exchanges
                    .entry(bus.to_string())
                    .or_default()
                    .value()
                    .clone();
                let mut bindings = exchange.bindings.lock();
                let binding = bindings.entry(address.subject().to_string()).or_default();
                if options.exclusive {
                    (binding.group.get_or_insert_with(Arc::default).clone(), None)
                } else {
                    let id = self.state.copy_ids.fetch_add(1, Ordering::Relaxed);
                    let queue = Arc::<Queue>::default();
                    binding.copies.push((id, Arc::clone(&queue)));
                    let copy = CopyBinding {
                        bus: bus.to_string(),
                        key: address.subject().to_string(),
                        id,
                    };
                    (queue, Some(copy))
                }
            }
            None => {
                // Plain queue: everyone competes regardless of exclusivity.
                let queue = self
                    .state
                    .queues
                    .entry(address.subject().to_string())
                    .or_default()
                    .value()
                    .clone();
                (queue, None)
            }
        };
        Ok(Box::new(MemoryReceiver {
            state: Arc::clone(&self.state),
            closed: Arc::clone(&self.closed),
            address: address.to_string(),
            queue,
            copy,
            capacity: options.capacity.max(1),
            next_tag: 1,
            unacked: HashMap::new(),
        }))
    }

    fn sender(&self, address: &Address) -> Result<Box<dyn BrokerSender>, BusError> {
        self.ensure_open()?;
        Ok(Box::new(MemorySender {
            state: Arc::clone(&self.state),
            closed: Arc::clone(&self.closed),
            address: address.clone(),
        }))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Identifies a private copy queue for unbinding on receiver drop.
struct CopyBinding {
    bus: String,
    key: String,
    id: u64,
}

struct MemoryReceiver {
    state: Arc<BrokerState>,
    closed: Arc<AtomicBool>,
    address: String,
    queue: Arc<Queue>,
    copy: Option<CopyBinding>,
    capacity: usize,
    next_tag: u64,
    unacked: HashMap<u64, QueuedMessage>,
}

impl MemoryReceiver {
    fn take_unacked(&mut self, tag: u64) -> Result<QueuedMessage, BusError> {
        self.unacked.remove(&tag).ok_or_else(|| BusError::Receive {
            address: self.address.clone(),
            reason: format!("unknown delivery tag {tag}"),
        })
    }
}

impl BrokerReceiver for MemoryReceiver {
    fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Connection("session closed".to_string()));
        }
        // Prefetch window full: acks come from this receiver's own owner,
        // so nothing can free a slot while we wait.
        if self.unacked.len() >= self.capacity {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        let Some(message) = self.queue.pop_timeout(timeout) else {
            return Ok(None);
        };
        let tag = self.next_tag;
        self.next_tag += 1;
        let delivery = Delivery {
            payload: message.payload.clone(),
            subject: message.subject.clone(),
            redelivered: message.redelivered,
            tag,
        };
        self.unacked.insert(tag, message);
        Ok(Some(delivery))
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.take_unacked(delivery.tag).map(drop)
    }

    fn nack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        let mut message = self.take_unacked(delivery.tag)?;
        message.redelivered = true;
        self.queue.push_front(message);
        Ok(())
    }

    fn reject(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.take_unacked(delivery.tag).map(drop)
    }
}

impl Drop for MemoryReceiver {
    fn drop(&mut self) {
        // Put unacked deliveries back in original order, marked redelivered.
        let mut pending: Vec<(u64, QueuedMessage)> = self.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| *tag);
        for (_, mut message) in pending.into_iter().rev() {
            message.redelivered = true;
            self.queue.push_front(message);
        }
        if let Some(copy) = &self.copy {
            if let Some(exchange) = self.state.exchanges.get(&copy.bus) {
                let mut bindings = exchange.bindings.lock();
                if let Some(binding) = bindings.get_mut(&copy.key) {
                    binding.copies.retain(|(id, _)| *id != copy.id);
                    if binding.group.is_none() && binding.copies.is_empty() {
                        bindings.remove(&copy.key);
                    }
                }
            }
        }
    }
}

struct MemorySender {
    state: Arc<BrokerState>,
    closed: Arc<AtomicBool>,
    address: Address,
}

impl MemorySender {
    fn publish_exchange(&self, bus: &str, key: &str, message: &OutgoingMessage) {
        let targets: Vec<Arc<Queue>> = match self.state.exchanges.get(bus) {
            Some(exchange) => {
                let bindings = exchange.bindings.lock();
                match bindings.get(key) {
                    Some(binding) => binding
                        .group
                        .iter()
                        .chain(binding.copies.iter().map(|(_, queue)| queue))
                        .cloned()
                        .collect(),
                    None => Vec::new(),
                }
            }
            None => Vec::new(),
        };
        if targets.is_empty() {
            debug!(bus, key, "No binding for routing key, message dropped");
            return;
        }
        for queue in targets {
            queue.push_back(QueuedMessage {
                payload: message.payload.clone(),
                subject: message.subject.clone(),
                redelivered: false,
            });
        }
    }

    fn publish_queue(&self, name: &str, message: &OutgoingMessage) {
        let queue = self
            .state
            .queues
            .entry(name.to_string())
            .or_default()
            .value()
            .clone();
        queue.push_back(QueuedMessage {
            payload: message.payload.clone(),
            subject: message.subject.clone(),
            redelivered: false,
        });
    }
}

impl BrokerSender for MemorySender {
    fn send(&mut self, message: &OutgoingMessage, _timeout: Duration) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Connection("session closed".to_string()));
        }
        match (self.address.bus(), &message.subject) {
            (Some(bus), Some(key)) => self.publish_exchange(bus, key, message),
            (Some(bus), None) => self.publish_exchange(bus, self.address.subject(), message),
            (None, Some(key)) => self.publish_exchange(self.address.subject(), key, message),
            (None, None) => self.publish_queue(self.address.subject(), message),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(broker: &MemoryBroker) -> Box<dyn BrokerSession> {
        broker.connect().unwrap()
    }

    fn outgoing(payload: &[u8], subject: Option<&str>) -> OutgoingMessage {
        OutgoingMessage {
            payload: payload.to_vec(),
            subject: subject.map(str::to_string),
        }
    }

    fn addr(input: &str) -> Address {
        Address::parse(input).unwrap()
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_plain_queue_receivers_compete() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        let options = ReceiverOptions::default();
        let mut first = session.subscribe(&addr("tasks"), &options).unwrap();
        let mut second = session.subscribe(&addr("tasks"), &options).unwrap();
        let mut sender = session.sender(&addr("tasks")).unwrap();
        sender.send(&outgoing(b"one", None), SHORT).unwrap();
        sender.send(&outgoing(b"two", None), SHORT).unwrap();

        let a = first.receive(SHORT).unwrap().unwrap();
        let b = second.receive(SHORT).unwrap().unwrap();
        assert_eq!(a.payload, b"one");
        assert_eq!(b.payload, b"two");
        assert!(first.receive(SHORT).unwrap().is_none());
    }

    #[test]
    fn test_exclusive_group_shares_one_queue_but_copies_fan_out() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        let exclusive = ReceiverOptions {
            exclusive: true,
            ..ReceiverOptions::default()
        };
        let mut worker_a = session.subscribe(&addr("bus/svc"), &exclusive).unwrap();
        let mut worker_b = session.subscribe(&addr("bus/svc"), &exclusive).unwrap();
        let mut monitor = session
            .subscribe(&addr("bus/svc"), &ReceiverOptions::default())
            .unwrap();
        let mut sender = session.sender(&addr("bus/svc")).unwrap();
        sender.send(&outgoing(b"job", None), SHORT).unwrap();

        // Exactly one group consumer gets it; the monitor gets its copy.
        let took_a = worker_a.receive(SHORT).unwrap();
        let took_b = worker_b.receive(SHORT).unwrap();
        assert!(took_a.is_some() != took_b.is_some());
        assert_eq!(monitor.receive(SHORT).unwrap().unwrap().payload, b"job");
    }

    #[test]
    fn test_unbound_routing_key_drops_message() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        let exclusive = ReceiverOptions {
            exclusive: true,
            ..ReceiverOptions::default()
        };
        let mut bound = session.subscribe(&addr("bus/here"), &exclusive).unwrap();
        let mut sender = session.sender(&addr("bus/elsewhere")).unwrap();
        sender.send(&outgoing(b"lost", None), SHORT).unwrap();
        assert!(bound.receive(SHORT).unwrap().is_none());
    }

    #[test]
    fn test_plain_sender_with_subject_routes_through_exchange() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        let exclusive = ReceiverOptions {
            exclusive: true,
            ..ReceiverOptions::default()
        };
        let mut receiver = session
            .subscribe(&addr("bus/reply.abc"), &exclusive)
            .unwrap();
        // A sender bound to just the bus name, subject per message.
        let mut sender = session.sender(&addr("bus")).unwrap();
        sender
            .send(&outgoing(b"pong", Some("reply.abc")), SHORT)
            .unwrap();
        let delivery = receiver.receive(SHORT).unwrap().unwrap();
        assert_eq!(delivery.payload, b"pong");
        assert_eq!(delivery.subject.as_deref(), Some("reply.abc"));
    }

    #[test]
    fn test_capacity_limits_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        let mut receiver = session
            .subscribe(&addr("q"), &ReceiverOptions::default())
            .unwrap();
        let mut sender = session.sender(&addr("q")).unwrap();
        sender.send(&outgoing(b"one", None), SHORT).unwrap();
        sender.send(&outgoing(b"two", None), SHORT).unwrap();

        let first = receiver.receive(SHORT).unwrap().unwrap();
        assert!(receiver.receive(SHORT).unwrap().is_none());
        receiver.ack(&first).unwrap();
        let second = receiver.receive(SHORT).unwrap().unwrap();
        assert_eq!(second.payload, b"two");
    }

    #[test]
    fn test_nack_requeues_at_the_front() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        let options = ReceiverOptions {
            capacity: 2,
            exclusive: false,
        };
        let mut receiver = session.subscribe(&addr("q"), &options).unwrap();
        let mut sender = session.sender(&addr("q")).unwrap();
        sender.send(&outgoing(b"one", None), SHORT).unwrap();
        sender.send(&outgoing(b"two", None), SHORT).unwrap();

        let first = receiver.receive(SHORT).unwrap().unwrap();
        receiver.nack(&first).unwrap();
        let again = receiver.receive(SHORT).unwrap().unwrap();
        assert_eq!(again.payload, b"one");
        assert!(again.redelivered);
    }

    #[test]
    fn test_dropping_a_receiver_requeues_unacked_as_redelivered() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        let mut receiver = session
            .subscribe(&addr("q"), &ReceiverOptions::default())
            .unwrap();
        let mut sender = session.sender(&addr("q")).unwrap();
        sender.send(&outgoing(b"job", None), SHORT).unwrap();
        let delivery = receiver.receive(SHORT).unwrap().unwrap();
        assert!(!delivery.redelivered);
        drop(receiver);

        let mut successor = session
            .subscribe(&addr("q"), &ReceiverOptions::default())
            .unwrap();
        let redelivery = successor.receive(SHORT).unwrap().unwrap();
        assert_eq!(redelivery.payload, b"job");
        assert!(redelivery.redelivered);
    }

    #[test]
    fn test_reject_discards_and_double_ack_errors() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        let mut receiver = session
            .subscribe(&addr("q"), &ReceiverOptions::default())
            .unwrap();
        let mut sender = session.sender(&addr("q")).unwrap();
        sender.send(&outgoing(b"bad", None), SHORT).unwrap();

        let delivery = receiver.receive(SHORT).unwrap().unwrap();
        receiver.reject(&delivery).unwrap();
        assert!(receiver.receive(SHORT).unwrap().is_none());
        assert!(matches!(
            receiver.ack(&delivery),
            Err(BusError::Receive { .. })
        ));
    }

    #[test]
    fn test_closed_session_fails_every_operation() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        let mut receiver = session
            .subscribe(&addr("q"), &ReceiverOptions::default())
            .unwrap();
        let mut sender = session.sender(&addr("q")).unwrap();
        session.close();

        assert!(matches!(
            receiver.receive(SHORT),
            Err(BusError::Connection(_))
        ));
        assert!(matches!(
            sender.send(&outgoing(b"x", None), SHORT),
            Err(BusError::Connection(_))
        ));
        assert!(session
            .subscribe(&addr("q"), &ReceiverOptions::default())
            .is_err());
        assert!(session.sender(&addr("q")).is_err());
    }

    #[test]
    fn test_sessions_on_one_broker_share_queues() {
        let broker = MemoryBroker::new();
        let sending = session(&broker);
        let receiving = session(&broker);
        let mut receiver = receiving
            .subscribe(&addr("shared"), &ReceiverOptions::default())
            .unwrap();
        let mut sender = sending.sender(&addr("shared")).unwrap();
        sender.send(&outgoing(b"hello", None), SHORT).unwrap();
        assert_eq!(receiver.receive(SHORT).unwrap().unwrap().payload, b"hello");
    }
}
