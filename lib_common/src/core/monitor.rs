//! # Sensor Monitor
//!
//! The facade collaborators use. It wires one reactor, one registry and the
//! ingestion listener together and keeps the table of subscription endpoints.
//!
//! ## Operations:
//!
//! - Discovery: `list_resources`, `list_metrics`, `find_sensor`, `sensors`.
//! - Subscriptions: `subscribe` returns the port of the (possibly shared)
//!   endpoint for a sensor; `unsubscribe` closes it.
//! - Loop control: `run`, `stop`, `shutdown`.
//!
//! With `auto_subscribe` on, every producer that establishes a sensor makes
//! sure an endpoint exists for it, so subscribers can connect without anyone
//! calling `subscribe` first.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

use super::port_binder::{BindPolicy, PortRange};
use super::reactor::Reactor;
use super::registry::SensorRegistry;
use super::sensor::{Sensor, SensorKey};
use super::subscription::SubscriptionEndpoint;
use crate::error::{MonitorError, MonitorResult};
use crate::ingestors::SensorCollector;

/// # Monitor Settings
///
/// Runtime parameters of a `SensorMonitor`. Built by hand or by
/// `configs::config_monitor::MonitorConfig::monitor_settings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Interface for the ingestion listener and subscription endpoints.
    pub bind_address: IpAddr,
    /// Fixed ingestion port. `0` asks the OS for one.
    pub ingestion_port: u16,
    /// Candidate ports for subscription endpoints.
    pub port_range: PortRange,
    /// Cap on bind attempts per endpoint; `None` retries forever.
    pub max_bind_attempts: Option<usize>,
    /// Open an endpoint for every sensor as soon as its producer attaches.
    pub auto_subscribe: bool,
    /// Bytes read from a producer socket per `read` call.
    pub read_buffer_size: usize,
    /// Longest unterminated message accepted from a producer.
    pub max_message_len: usize,
}

impl MonitorSettings {
    /// Port producers connect to unless configured otherwise.
    pub const DEFAULT_INGESTION_PORT: u16 = 12087;
    /// Default read chunk and message limit.
    pub const DEFAULT_BUFFER_SIZE: usize = 1024;
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ingestion_port: Self::DEFAULT_INGESTION_PORT,
            port_range: PortRange::default(),
            max_bind_attempts: None,
            auto_subscribe: false,
            read_buffer_size: Self::DEFAULT_BUFFER_SIZE,
            max_message_len: Self::DEFAULT_BUFFER_SIZE,
        }
    }
}

/// What a subscriber needs to know to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Endpoint id, used for `unsubscribe`.
    pub id: u64,
    /// Port to connect to.
    pub port: u16,
    /// Resource of the streamed sensor.
    pub resource: String,
    /// Metric of the streamed sensor.
    pub metric: String,
}

impl SubscriptionInfo {
    fn of(endpoint: &SubscriptionEndpoint) -> Self {
        Self {
            id: endpoint.id(),
            port: endpoint.port(),
            resource: endpoint.sensor().resource().to_string(),
            metric: endpoint.sensor().metric().to_string(),
        }
    }
}

/// # Sensor Monitor
pub struct SensorMonitor {
    reactor: Rc<Reactor>,
    registry: Rc<SensorRegistry>,
    collector: Rc<SensorCollector>,
    bind_policy: BindPolicy,
    endpoints: RefCell<Vec<Rc<SubscriptionEndpoint>>>,
}

impl SensorMonitor {
    /// Creates a reactor and starts the monitor on it.
    pub fn start(settings: MonitorSettings) -> MonitorResult<Rc<Self>> {
        let reactor = Rc::new(Reactor::new()?);
        Self::start_on(reactor, settings)
    }

    /// # Start On
    ///
    /// Binds the ingestion listener on an existing reactor. Other channels
    /// (signals, timers) can share the same reactor.
    pub fn start_on(reactor: Rc<Reactor>, settings: MonitorSettings) -> MonitorResult<Rc<Self>> {
        let registry = Rc::new(SensorRegistry::new());
        let collector = SensorCollector::bind(&reactor, &registry, &settings)?;

        let bind_policy = BindPolicy {
            ip: settings.bind_address,
            range: settings.port_range,
            max_attempts: settings.max_bind_attempts,
            reserved: vec![collector.local_addr().port()],
        };

        let monitor = Rc::new(Self {
            reactor,
            registry,
            collector,
            bind_policy,
            endpoints: RefCell::new(Vec::new()),
        });

        if settings.auto_subscribe {
            let weak = Rc::downgrade(&monitor);
            monitor.registry.on_producer_attached(move |sensor: &Sensor| {
                let Some(monitor) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = monitor.subscribe(sensor.resource(), sensor.metric()) {
                    log::error!("Auto-subscription for {} failed: {}", sensor.key(), e);
                }
            });
        }

        Ok(monitor)
    }

    /// The reactor driving this monitor.
    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    /// The sensor registry.
    pub fn registry(&self) -> &Rc<SensorRegistry> {
        &self.registry
    }

    /// Address producers connect to.
    pub fn ingestion_addr(&self) -> SocketAddr {
        self.collector.local_addr()
    }

    /// Number of connected producers.
    pub fn producer_count(&self) -> usize {
        self.collector.producer_count()
    }

    /// Resources with at least one sensor.
    pub fn list_resources(&self) -> Vec<String> {
        self.registry.list_resources()
    }

    /// Metrics known for `resource`.
    pub fn list_metrics(&self, resource: &str) -> Vec<String> {
        self.registry.list_metrics(resource)
    }

    /// Looks a sensor up by identity.
    pub fn find_sensor(&self, resource: &str, metric: &str) -> Option<Sensor> {
        self.registry.find_sensor(resource, metric)
    }

    /// Snapshot of every sensor.
    pub fn sensors(&self) -> Vec<Sensor> {
        self.registry.sensors()
    }

    /// # Subscribe
    ///
    /// Returns the endpoint streaming `resource` / `metric`, opening one if
    /// no valid endpoint exists for that sensor yet.
    pub fn subscribe(&self, resource: &str, metric: &str) -> MonitorResult<SubscriptionInfo> {
        let sensor = self.registry.find_sensor(resource, metric).ok_or_else(|| {
            MonitorError::UnknownSensor {
                resource: resource.to_string(),
                metric: metric.to_string(),
            }
        })?;

        self.prune_closed();
        if let Some(existing) = self.find_endpoint(sensor.key()) {
            return Ok(SubscriptionInfo::of(&existing));
        }

        let endpoint = SubscriptionEndpoint::open(
            &self.reactor,
            &self.registry,
            sensor.key().clone(),
            &self.bind_policy,
        )?;
        let info = SubscriptionInfo::of(&endpoint);
        self.endpoints.borrow_mut().push(endpoint);
        Ok(info)
    }

    /// Closes the endpoint `id`. Returns whether it was known.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = {
            let mut endpoints = self.endpoints.borrow_mut();
            endpoints
                .iter()
                .position(|e| e.id() == id)
                .map(|index| endpoints.remove(index))
        };

        match removed {
            Some(endpoint) => {
                endpoint.close();
                true
            }
            None => false,
        }
    }

    /// Every endpoint still open.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.prune_closed();
        self.endpoints
            .borrow()
            .iter()
            .map(|e| SubscriptionInfo::of(e))
            .collect()
    }

    /// Handle to the open endpoint `id`.
    pub fn endpoint(&self, id: u64) -> Option<Rc<SubscriptionEndpoint>> {
        self.prune_closed();
        self.endpoints
            .borrow()
            .iter()
            .find(|e| e.id() == id)
            .cloned()
    }

    /// Runs the reactor until `stop()`.
    pub fn run(&self) {
        log::info!("Sensor monitor accepting producers on {}", self.ingestion_addr());
        self.reactor.run();
    }

    /// Makes `run()` return after the current dispatch round.
    pub fn stop(&self) {
        self.reactor.stop();
    }

    /// # Shutdown
    ///
    /// Closes every endpoint, every producer connection and the ingestion
    /// socket. The monitor is inert afterwards.
    pub fn shutdown(&self) {
        let endpoints = std::mem::take(&mut *self.endpoints.borrow_mut());
        for endpoint in endpoints {
            endpoint.close();
        }
        self.collector.shutdown();
        log::info!("Sensor monitor shut down");
    }

    fn find_endpoint(&self, key: &SensorKey) -> Option<Rc<SubscriptionEndpoint>> {
        self.endpoints
            .borrow()
            .iter()
            .find(|e| e.sensor() == key && e.is_valid())
            .cloned()
    }

    #[cfg(test)]
    fn tracked_endpoints(&self) -> usize {
        self.endpoints.borrow().len()
    }

    fn prune_closed(&self) {
        self.endpoints.borrow_mut().retain(|e| e.is_valid());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::Duration;

    fn loopback_settings(auto_subscribe: bool) -> MonitorSettings {
        MonitorSettings {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ingestion_port: 0,
            port_range: PortRange::new(20000, 60000).unwrap(),
            max_bind_attempts: Some(200),
            auto_subscribe,
            ..MonitorSettings::default()
        }
    }

    fn pump_until(monitor: &SensorMonitor, mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            monitor
                .reactor()
                .run_once(Some(Duration::from_millis(10)))
                .unwrap();
        }
        assert!(done(), "condition not reached");
    }

    #[test]
    fn test_default_settings() {
        let settings = MonitorSettings::default();
        assert_eq!(settings.ingestion_port, 12087);
        assert_eq!(settings.port_range, PortRange::default());
        assert_eq!(settings.max_bind_attempts, None);
        assert_eq!(settings.max_message_len, 1024);
    }

    #[test]
    fn test_subscribe_unknown_sensor_fails() {
        let monitor = SensorMonitor::start(loopback_settings(false)).unwrap();
        assert!(matches!(
            monitor.subscribe("nope", "none"),
            Err(MonitorError::UnknownSensor { .. })
        ));
        monitor.shutdown();
    }

    #[test]
    fn test_subscribe_reuses_valid_endpoint() {
        let monitor = SensorMonitor::start(loopback_settings(false)).unwrap();
        monitor.registry().make_sensor("host1", "cpu");

        let first = monitor.subscribe("host1", "cpu").unwrap();
        let second = monitor.subscribe("host1", "cpu").unwrap();
        assert_eq!(first, second);
        assert_ne!(first.port, monitor.ingestion_addr().port());
        assert_eq!(monitor.subscriptions().len(), 1);

        assert!(monitor.unsubscribe(first.id));
        assert!(!monitor.unsubscribe(first.id));
        assert!(monitor.endpoint(first.id).is_none());

        let third = monitor.subscribe("host1", "cpu").unwrap();
        assert_ne!(third.id, first.id);
        monitor.shutdown();
    }

    #[test]
    fn test_auto_subscribe_on_producer_attach() {
        let monitor = SensorMonitor::start(loopback_settings(true)).unwrap();
        let mut producer = TcpStream::connect(monitor.ingestion_addr()).unwrap();
        producer.write_all(b"host9#load#2.5\n").unwrap();

        pump_until(&monitor, || monitor.subscriptions().len() == 1);
        let info = &monitor.subscriptions()[0];
        assert_eq!((info.resource.as_str(), info.metric.as_str()), ("host9", "load"));
        assert_eq!(monitor.list_resources(), vec!["host9".to_string()]);
        assert_eq!(monitor.list_metrics("host9"), vec!["load".to_string()]);

        drop(producer);
        pump_until(&monitor, || monitor.subscriptions().is_empty());
        monitor.shutdown();
    }

    #[test]
    fn test_endpoint_lookup_drops_closed_endpoints() {
        let monitor = SensorMonitor::start(loopback_settings(false)).unwrap();
        for round in 0..5 {
            let mut producer = TcpStream::connect(monitor.ingestion_addr()).unwrap();
            producer
                .write_all(format!("rack{}#fan#1\n", round).as_bytes())
                .unwrap();
            pump_until(&monitor, || monitor.sensors().len() == round + 1);

            let info = monitor.subscribe(&format!("rack{}", round), "fan").unwrap();
            let endpoint = monitor.endpoint(info.id).unwrap();
            drop(producer);
            pump_until(&monitor, || !endpoint.is_valid());

            assert!(monitor.endpoint(info.id).is_none());
            assert_eq!(monitor.tracked_endpoints(), 0);
        }
        monitor.shutdown();
    }

    #[test]
    fn test_shutdown_releases_all_channels() {
        let monitor = SensorMonitor::start(loopback_settings(false)).unwrap();
        monitor.registry().make_sensor("a", "b");
        monitor.subscribe("a", "b").unwrap();
        assert_eq!(monitor.reactor().channel_count(), 2);

        monitor.shutdown();
        assert_eq!(monitor.reactor().channel_count(), 0);
        assert!(monitor.subscriptions().is_empty());
    }
}
