//! The dispatch engine: a named service consuming requests off the bus.
//!
//! A [`Service`] subscribes to its request address and runs a pool of
//! worker threads, each with its own receiver and its own handler
//! instance, competing for messages. Lifecycle is `Created → Listening →
//! Stopped`: [`start_listening`] is idempotent while listening and an
//! error once stopped, [`stop_listening`] joins every worker (bounded by
//! the receive timeout) and releases the transport. Dropping a listening
//! service stops it.
//!
//! [`start_listening`]: Service::start_listening
//! [`stop_listening`]: Service::stop_listening

mod metrics;
mod reply;
mod worker;

pub use metrics::ServiceMetrics;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::broker::ReceiverOptions;
use crate::connection::{Connection, Sender};
use crate::error::BusError;
use crate::handler::HandlerFactory;
use crate::service::reply::ReplyRouter;
use crate::service::worker::Worker;

/// How a [`Service`] subscribes and dispatches.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Queue name, or routing key when `bus_name` is set.
    pub service_name: String,
    /// Topic bus to subscribe on; `None` consumes a plain queue.
    pub bus_name: Option<String>,
    /// Join the shared group queue (competing consumers) rather than
    /// taking a private copy of every request.
    pub exclusive: bool,
    /// Worker threads; each owns one receiver and one handler.
    pub num_threads: usize,
    /// Per-receiver prefetch window.
    pub capacity: usize,
    /// Receive poll interval; also bounds shutdown latency.
    pub receive_timeout: Duration,
    /// Timeout for reply publishes.
    pub send_timeout: Duration,
    /// Hand handlers the whole request envelope instead of resolving the
    /// calling convention.
    pub parse_full_message: bool,
    /// Log every handled request at info level instead of debug.
    pub verbose: bool,
}

impl ServiceConfig {
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            bus_name: None,
            exclusive: true,
            num_threads: 1,
            capacity: 1,
            receive_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_secs(5),
            parse_full_message: false,
            verbose: false,
        }
    }

    #[must_use]
    pub fn with_bus(mut self, bus_name: impl Into<String>) -> Self {
        self.bus_name = Some(bus_name.into());
        self
    }

    #[must_use]
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_receive_timeout(mut self, receive_timeout: Duration) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }

    #[must_use]
    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    #[must_use]
    pub fn with_parse_full_message(mut self, parse_full_message: bool) -> Self {
        self.parse_full_message = parse_full_message;
        self
    }

    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Apply `BUSRPC_NUM_THREADS`, `BUSRPC_CAPACITY` and
    /// `BUSRPC_RECEIVE_TIMEOUT_MS` from the environment where set and
    /// parseable.
    #[must_use]
    pub fn apply_env(mut self) -> Self {
        if let Some(num_threads) = env_parse::<usize>("BUSRPC_NUM_THREADS") {
            self.num_threads = num_threads;
        }
        if let Some(capacity) = env_parse::<usize>("BUSRPC_CAPACITY") {
            self.capacity = capacity;
        }
        if let Some(millis) = env_parse::<u64>("BUSRPC_RECEIVE_TIMEOUT_MS") {
            self.receive_timeout = Duration::from_millis(millis);
        }
        self
    }

    /// `bus/service` on a topic bus, the bare service name otherwise.
    fn subscription_address(&self) -> String {
        match &self.bus_name {
            Some(bus) => format!("{bus}/{}", self.service_name),
            None => self.service_name.clone(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

enum Lifecycle {
    Created,
    Listening,
    Stopped,
}

/// A request-consuming service: worker pool, reply routing, metrics.
pub struct Service {
    config: ServiceConfig,
    connection: Connection,
    factory: Box<dyn HandlerFactory>,
    metrics: Arc<ServiceMetrics>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    reply_sender: Option<Arc<Mutex<Sender>>>,
    state: Lifecycle,
}

impl Service {
    pub fn new(
        connection: Connection,
        config: ServiceConfig,
        factory: impl HandlerFactory + 'static,
    ) -> Self {
        Self {
            config,
            connection,
            factory: Box::new(factory),
            metrics: Arc::new(ServiceMetrics::default()),
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            reply_sender: None,
            state: Lifecycle::Created,
        }
    }

    /// Open the transport, bind one receiver per worker and spawn the
    /// worker threads. Idempotent while listening; fails with
    /// [`BusError::AlreadyStopped`] after [`stop_listening`].
    ///
    /// Any failure on the way up rolls the service back to released
    /// transport state and returns the error.
    ///
    /// [`stop_listening`]: Service::stop_listening
    pub fn start_listening(&mut self) -> Result<(), BusError> {
        match self.state {
            Lifecycle::Listening => {
                debug!(service = %self.config.service_name, "Already listening");
                return Ok(());
            }
            Lifecycle::Stopped => return Err(BusError::AlreadyStopped),
            Lifecycle::Created => {}
        }

        self.connection.open()?;

        let reply_sender = match &self.config.bus_name {
            Some(bus) => match self.connection.add_sender(bus) {
                Ok(sender) => Some(Arc::new(Mutex::new(sender))),
                Err(err) => {
                    self.connection.close();
                    return Err(err);
                }
            },
            None => None,
        };

        let address = self.config.subscription_address();
        let options = ReceiverOptions {
            capacity: self.config.capacity.max(1),
            exclusive: self.config.exclusive,
        };
        let num_threads = self.config.num_threads.max(1);

        let mut receivers = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            match self.connection.add_receiver(&address, options) {
                Ok(receiver) => receivers.push(receiver),
                Err(err) => {
                    drop(receivers);
                    self.connection.close();
                    return Err(err);
                }
            }
        }

        self.running.store(true, Ordering::Release);
        for (index, receiver) in receivers.into_iter().enumerate() {
            let worker = Worker {
                service_name: self.config.service_name.clone(),
                index,
                receiver,
                handler: self.factory.new_handler(),
                router: ReplyRouter::new(
                    self.connection.clone(),
                    reply_sender.clone(),
                    self.config.send_timeout,
                ),
                metrics: Arc::clone(&self.metrics),
                running: Arc::clone(&self.running),
                receive_timeout: self.config.receive_timeout,
                parse_full_message: self.config.parse_full_message,
                verbose: self.config.verbose,
            };
            let name = format!("{}-worker-{index}", self.config.service_name);
            match thread::Builder::new().name(name.clone()).spawn(move || worker.run()) {
                Ok(handle) => self.workers.push(handle),
                Err(err) => {
                    self.running.store(false, Ordering::Release);
                    self.join_workers();
                    self.connection.close();
                    return Err(BusError::Spawn {
                        name,
                        reason: err.to_string(),
                    });
                }
            }
        }

        self.reply_sender = reply_sender;
        self.state = Lifecycle::Listening;
        info!(
            service = %self.config.service_name,
            address = %address,
            threads = num_threads,
            "Service listening"
        );
        Ok(())
    }

    /// Stop consuming: clear the running flag, join every worker (they
    /// notice within one receive timeout) and release the transport.
    /// Safe to call whether or not the service is listening.
    pub fn stop_listening(&mut self) {
        if !matches!(self.state, Lifecycle::Listening) {
            return;
        }
        self.running.store(false, Ordering::Release);
        self.join_workers();
        self.reply_sender = None;
        self.connection.close();
        self.state = Lifecycle::Stopped;
        info!(service = %self.config.service_name, "Service stopped");
    }

    fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!(service = %self.config.service_name, "Worker thread panicked");
            }
        }
    }

    /// Dispatch counters for this service.
    #[must_use]
    pub fn metrics(&self) -> Arc<ServiceMetrics> {
        Arc::clone(&self.metrics)
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        matches!(self.state, Lifecycle::Listening)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop_listening();
    }
}
