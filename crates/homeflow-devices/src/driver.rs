/*!
 * The generic driver contract.
 *
 * A driver connects devices to one physical or virtual link. Devices push
 * commands through [`Driver::send`]; drivers push decoded inbound events to
 * the [`EventSink`]s that subscribed for an address.
 */
use std::fmt::Debug;
use std::sync::{Mutex, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, trace};

use homeflow_core::config::EngineConfig;
use homeflow_core::types::{Address, Command, DriverId};

/// Receives decoded inbound events from a driver
pub trait EventSink: Send + Sync {
    /// Handle a command decoded for an address
    fn on_event(&self, command: Command, address: &Address, driver: DriverId);
}

/// The driver capability consumed by interface devices
pub trait Driver: Send + Sync + Debug {
    /// Get the driver handle
    fn id(&self) -> DriverId;

    /// Get the driver name
    fn name(&self) -> &str;

    /// Queue a command for an address without waiting for the outcome
    fn send(&self, address: &Address, command: Command);

    /// Ask the hardware at an address to report its state
    fn status(&self, address: &Address);

    /// Deliver events for `address`, or for every address when `None`
    fn subscribe(&self, sink: Weak<dyn EventSink>, address: Option<Address>);
}

/// Link timing options
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Pause after each outbound write
    pub inter_send_delay: Duration,
    /// How long each loop iteration waits for inbound bytes
    pub poll_interval: Duration,
    /// How long to wait for a reply before retrying
    pub response_timeout: Duration,
    /// How many times a timed-out command is re-queued
    pub retry_limit: u32,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl DriverOptions {
    /// Take the link timing from the engine configuration
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            inter_send_delay: config.inter_send_delay(),
            poll_interval: config.poll_interval(),
            response_timeout: config.response_timeout(),
            retry_limit: config.retry_limit,
        }
    }

    /// Set the inter-send delay
    pub fn with_inter_send_delay(mut self, delay: Duration) -> Self {
        self.inter_send_delay = delay;
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the reply timeout
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the retry bound
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }
}

struct Subscription {
    address: Option<Address>,
    sink: Weak<dyn EventSink>,
}

/// The subscriber list of a driver, keyed by address
#[derive(Default)]
pub struct Subscribers {
    entries: RwLock<Vec<Subscription>>,
}

impl Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers").field("count", &self.len()).finish()
    }
}

impl Subscribers {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber
    pub fn add(&self, sink: Weak<dyn EventSink>, address: Option<Address>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.push(Subscription { address, sink });
        }
    }

    /// Number of live subscribers
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .map(|entries| entries.iter().filter(|s| s.sink.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Whether there are no live subscribers
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every subscriber of the address.
    ///
    /// Sinks are collected first and called without holding the list lock,
    /// so a sink may subscribe or send from inside its callback. Dropped
    /// sinks are pruned. Returns how many sinks received the event.
    pub fn dispatch(&self, command: Command, address: &Address, driver: DriverId) -> usize {
        let sinks: Vec<_> = match self.entries.read() {
            Ok(entries) => entries
                .iter()
                .filter(|s| s.address.as_ref().map_or(true, |a| a.matches(address)))
                .filter_map(|s| s.sink.upgrade())
                .collect(),
            Err(_) => return 0,
        };

        if sinks.is_empty() {
            debug!(address = %address, command = %command, "No subscriber for inbound event");
        }
        for sink in &sinks {
            sink.on_event(command, address, driver);
        }

        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|s| s.sink.strong_count() > 0);
        }
        sinks.len()
    }
}

/// A driver with no hardware behind it.
///
/// Outbound commands are recorded and inbound events are injected by hand.
/// Used for virtual devices, demos and tests.
#[derive(Debug)]
pub struct MemoryDriver {
    id: DriverId,
    name: String,
    sent: Mutex<Vec<(Address, Command)>>,
    subscribers: Subscribers,
}

impl MemoryDriver {
    /// Create a new memory driver
    pub fn new<S: AsRef<str>>(name: S) -> Self {
        Self {
            id: DriverId::next(),
            name: name.as_ref().to_string(),
            sent: Mutex::new(Vec::new()),
            subscribers: Subscribers::new(),
        }
    }

    /// Deliver an inbound event as if it had been decoded from the link
    pub fn inject(&self, address: &Address, command: Command) -> usize {
        self.subscribers.dispatch(command, address, self.id)
    }

    /// Everything sent so far, in order
    pub fn sent(&self) -> Vec<(Address, Command)> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Clear the record of sent commands
    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }
}

impl Driver for MemoryDriver {
    fn id(&self) -> DriverId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, address: &Address, command: Command) {
        trace!(driver = %self.name, address = %address, command = %command, "Recording outbound command");
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((address.clone(), command));
        }
    }

    fn status(&self, address: &Address) {
        self.send(address, Command::Status);
    }

    fn subscribe(&self, sink: Weak<dyn EventSink>, address: Option<Address>) {
        self.subscribers.add(sink, address);
    }
}
