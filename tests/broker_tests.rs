//! Broker semantics exercised through the connection layer.
//!
//! # Test Coverage
//!
//! - Competing consumers on a shared queue, across separate connections
//! - Topic fan-out: one group queue for exclusive subscribers, private
//!   copies for the rest
//! - Requeue (nack) and redelivery flags
//! - Queue buffering versus topic drop semantics for unconsumed traffic
//! - Unacked deliveries returning to the queue, in order, on receiver drop
//! - Broker options segments carried through subscription addresses
//! - Transport receive failures surfacing as errors, not panics

mod common;

use std::time::Duration;

use busrpc::{BusError, Connection, MemoryBroker, OutgoingMessage, ReceiverOptions};
use common::recording::{Fault, RecordingBroker};

const SHORT: Duration = Duration::from_millis(50);
const NONE: Duration = Duration::from_millis(20);

fn out(text: &str, subject: Option<&str>) -> OutgoingMessage {
    OutgoingMessage {
        payload: text.as_bytes().to_vec(),
        subject: subject.map(str::to_string),
    }
}

fn options(capacity: usize, exclusive: bool) -> ReceiverOptions {
    ReceiverOptions {
        capacity,
        exclusive,
    }
}

#[test]
fn test_two_connections_compete_for_one_queue() {
    let broker = MemoryBroker::new();
    let connection_a = Connection::new(broker.clone());
    let connection_b = Connection::new(broker);
    connection_a.open().unwrap();
    connection_b.open().unwrap();

    let mut receiver_a = connection_a.add_receiver("jobs", options(4, false)).unwrap();
    let mut receiver_b = connection_b.add_receiver("jobs", options(4, false)).unwrap();

    let mut sender = connection_a.add_sender("jobs").unwrap();
    for text in ["j1", "j2", "j3", "j4"] {
        sender.send(&out(text, None), SHORT).unwrap();
    }

    // Queue order is FIFO, so alternating receives split the backlog.
    assert_eq!(receiver_a.receive(SHORT).unwrap().unwrap().payload, b"j1");
    assert_eq!(receiver_b.receive(SHORT).unwrap().unwrap().payload, b"j2");
    assert_eq!(receiver_a.receive(SHORT).unwrap().unwrap().payload, b"j3");
    assert_eq!(receiver_b.receive(SHORT).unwrap().unwrap().payload, b"j4");
    assert!(receiver_a.receive(NONE).unwrap().is_none());
}

#[test]
fn test_topic_fanout_reaches_group_and_copies() {
    let connection = Connection::new(MemoryBroker::new());
    connection.open().unwrap();

    let mut group_a = connection.add_receiver("lofar/task", options(1, true)).unwrap();
    let mut group_b = connection.add_receiver("lofar/task", options(1, true)).unwrap();
    let mut observer = connection.add_receiver("lofar/task", options(1, false)).unwrap();

    let mut sender = connection.add_sender("lofar/task").unwrap();
    sender.send(&out("parset", None), SHORT).unwrap();

    // Exactly one member of the group takes the message; the observer has
    // its own copy regardless.
    let delivery = group_a.receive(SHORT).unwrap().unwrap();
    assert_eq!(delivery.payload, b"parset");
    assert!(group_b.receive(NONE).unwrap().is_none());
    assert_eq!(observer.receive(SHORT).unwrap().unwrap().payload, b"parset");
}

#[test]
fn test_nack_redelivers_with_the_flag_set() {
    let connection = Connection::new(MemoryBroker::new());
    connection.open().unwrap();

    let mut receiver = connection.add_receiver("retry", options(1, false)).unwrap();
    let mut sender = connection.add_sender("retry").unwrap();
    sender.send(&out("once more", None), SHORT).unwrap();

    let first = receiver.receive(SHORT).unwrap().unwrap();
    assert!(!first.redelivered);
    receiver.nack(&first).unwrap();

    let second = receiver.receive(SHORT).unwrap().unwrap();
    assert!(second.redelivered);
    assert_eq!(second.payload, b"once more");
    receiver.ack(&second).unwrap();
}

#[test]
fn test_queues_buffer_unconsumed_traffic_but_topics_drop_it() {
    let connection = Connection::new(MemoryBroker::new());
    connection.open().unwrap();

    // A queue holds messages sent before anyone binds.
    let mut parked = connection.add_sender("parked").unwrap();
    parked.send(&out("waiting", None), SHORT).unwrap();
    let mut receiver = connection.add_receiver("parked", options(1, false)).unwrap();
    assert_eq!(receiver.receive(SHORT).unwrap().unwrap().payload, b"waiting");

    // A topic with no binding drops the message; late subscribers miss it.
    let mut unbound = connection.add_sender("lofar/noone").unwrap();
    unbound.send(&out("lost", None), SHORT).unwrap();
    let mut late = connection.add_receiver("lofar/noone", options(1, true)).unwrap();
    assert!(late.receive(NONE).unwrap().is_none());
}

#[test]
fn test_receiver_drop_returns_pending_messages_in_order() {
    let connection = Connection::new(MemoryBroker::new());
    connection.open().unwrap();

    let mut sender = connection.add_sender("batch").unwrap();
    for text in ["b1", "b2", "b3"] {
        sender.send(&out(text, None), SHORT).unwrap();
    }

    let mut first = connection.add_receiver("batch", options(3, false)).unwrap();
    let d1 = first.receive(SHORT).unwrap().unwrap();
    let _d2 = first.receive(SHORT).unwrap().unwrap();
    let _d3 = first.receive(SHORT).unwrap().unwrap();
    first.ack(&d1).unwrap();
    drop(first);

    let mut second = connection.add_receiver("batch", options(3, false)).unwrap();
    let d2 = second.receive(SHORT).unwrap().unwrap();
    let d3 = second.receive(SHORT).unwrap().unwrap();
    assert_eq!(d2.payload, b"b2");
    assert_eq!(d3.payload, b"b3");
    assert!(d2.redelivered && d3.redelivered);
    assert!(second.receive(NONE).unwrap().is_none());
}

#[test]
fn test_broker_options_ride_along_with_the_address() {
    let connection = Connection::new(MemoryBroker::new());
    connection.open().unwrap();

    let mut receiver = connection
        .add_receiver("lofar/alerts;durable", options(1, true))
        .unwrap();
    assert_eq!(receiver.address().options(), Some("durable"));

    let mut sender = connection.add_sender("lofar/alerts").unwrap();
    sender.send(&out("ping", None), SHORT).unwrap();
    assert_eq!(receiver.receive(SHORT).unwrap().unwrap().payload, b"ping");
}

#[test]
fn test_transport_receive_failures_surface_as_errors() {
    let broker = RecordingBroker::new();
    let connection = Connection::new(broker.clone());
    connection.open().unwrap();

    let mut receiver = connection.add_receiver("faulty", options(1, false)).unwrap();
    let mut sender = connection.add_sender("faulty").unwrap();
    sender.send(&out("still there", None), SHORT).unwrap();

    broker.fail_next(Fault::Receive);
    match receiver.receive(SHORT) {
        Err(BusError::Receive { address, .. }) => assert_eq!(address, "faulty"),
        other => panic!("expected a receive error, got {other:?}"),
    }

    // The fault was one-shot; the message is still on the queue.
    assert_eq!(receiver.receive(SHORT).unwrap().unwrap().payload, b"still there");
}
