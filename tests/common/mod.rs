pub mod recording {
    //! A broker decorator for integration tests: forwards everything to an
    //! in-memory broker, records the operations it sees in call order, and
    //! fails the first operation matching an armed fault.

    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use busrpc::{
        Address, Broker, BrokerReceiver, BrokerSender, BrokerSession, BusError, Delivery,
        MemoryBroker, OutgoingMessage, ReceiverOptions,
    };

    /// One observed broker operation.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Op {
        Subscribe { address: String },
        Send { address: String, subject: Option<String> },
        Receive { address: String },
        Ack { address: String },
        Nack { address: String },
        Reject { address: String },
    }

    /// Which operation the next armed fault should hit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Fault {
        Connect,
        Receive,
        Send,
        Ack,
    }

    #[derive(Default)]
    struct Shared {
        ops: Mutex<Vec<Op>>,
        faults: Mutex<Vec<Fault>>,
    }

    impl Shared {
        fn record(&self, op: Op) {
            self.ops.lock().push(op);
        }

        fn take_fault(&self, fault: Fault) -> bool {
            let mut faults = self.faults.lock();
            match faults.iter().position(|armed| *armed == fault) {
                Some(index) => {
                    faults.remove(index);
                    true
                }
                None => false,
            }
        }
    }

    #[derive(Clone, Default)]
    pub struct RecordingBroker {
        inner: MemoryBroker,
        shared: Arc<Shared>,
    }

    impl RecordingBroker {
        pub fn new() -> Self {
            Self::default()
        }

        /// Arm a one-shot fault; the next matching operation fails once.
        pub fn fail_next(&self, fault: Fault) {
            self.shared.faults.lock().push(fault);
        }

        /// Everything observed so far, in call order.
        pub fn ops(&self) -> Vec<Op> {
            self.shared.ops.lock().clone()
        }

        /// Index of the first op matching `predicate`, if any.
        pub fn position_of(&self, predicate: impl Fn(&Op) -> bool) -> Option<usize> {
            self.shared.ops.lock().iter().position(predicate)
        }

        /// How many observed ops match `predicate`.
        pub fn count_of(&self, predicate: impl Fn(&Op) -> bool) -> usize {
            self.shared.ops.lock().iter().filter(|op| predicate(op)).count()
        }
    }

    impl Broker for RecordingBroker {
        fn connect(&self) -> Result<Box<dyn BrokerSession>, BusError> {
            if self.shared.take_fault(Fault::Connect) {
                return Err(BusError::Connection("injected connect failure".to_string()));
            }
            let inner = self.inner.connect()?;
            Ok(Box::new(RecordingSession {
                inner,
                shared: Arc::clone(&self.shared),
            }))
        }
    }

    struct RecordingSession {
        inner: Box<dyn BrokerSession>,
        shared: Arc<Shared>,
    }

    impl BrokerSession for RecordingSession {
        fn subscribe(
            &self,
            address: &Address,
            options: &ReceiverOptions,
        ) -> Result<Box<dyn BrokerReceiver>, BusError> {
            self.shared.record(Op::Subscribe {
                address: address.to_string(),
            });
            let inner = self.inner.subscribe(address, options)?;
            Ok(Box::new(RecordingReceiver {
                inner,
                address: address.to_string(),
                shared: Arc::clone(&self.shared),
            }))
        }

        fn sender(&self, address: &Address) -> Result<Box<dyn BrokerSender>, BusError> {
            let inner = self.inner.sender(address)?;
            Ok(Box::new(RecordingSender {
                inner,
                address: address.to_string(),
                shared: Arc::clone(&self.shared),
            }))
        }

        fn close(&self) {
            self.inner.close();
        }
    }

    struct RecordingReceiver {
        inner: Box<dyn BrokerReceiver>,
        address: String,
        shared: Arc<Shared>,
    }

    impl BrokerReceiver for RecordingReceiver {
        fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, BusError> {
            if self.shared.take_fault(Fault::Receive) {
                return Err(BusError::Receive {
                    address: self.address.clone(),
                    reason: "injected receive failure".to_string(),
                });
            }
            let delivery = self.inner.receive(timeout)?;
            if delivery.is_some() {
                self.shared.record(Op::Receive {
                    address: self.address.clone(),
                });
            }
            Ok(delivery)
        }

        fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
            if self.shared.take_fault(Fault::Ack) {
                return Err(BusError::Receive {
                    address: self.address.clone(),
                    reason: "injected ack failure".to_string(),
                });
            }
            self.shared.record(Op::Ack {
                address: self.address.clone(),
            });
            self.inner.ack(delivery)
        }

        fn nack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
            self.shared.record(Op::Nack {
                address: self.address.clone(),
            });
            self.inner.nack(delivery)
        }

        fn reject(&mut self, delivery: &Delivery) -> Result<(), BusError> {
            self.shared.record(Op::Reject {
                address: self.address.clone(),
            });
            self.inner.reject(delivery)
        }
    }

    struct RecordingSender {
        inner: Box<dyn BrokerSender>,
        address: String,
        shared: Arc<Shared>,
    }

    impl BrokerSender for RecordingSender {
        fn send(&mut self, message: &OutgoingMessage, timeout: Duration) -> Result<(), BusError> {
            if self.shared.take_fault(Fault::Send) {
                return Err(BusError::Send {
                    address: self.address.clone(),
                    reason: "injected send failure".to_string(),
                });
            }
            self.shared.record(Op::Send {
                address: self.address.clone(),
                subject: message.subject.clone(),
            });
            self.inner.send(message, timeout)
        }
    }
}

pub mod sync {
    use std::time::{Duration, Instant};

    /// Poll `predicate` until it holds or `timeout` elapses.
    pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        predicate()
    }
}
