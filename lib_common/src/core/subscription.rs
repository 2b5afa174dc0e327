//! # Subscription Endpoint
//!
//! One endpoint per subscribed sensor. It owns a listening socket on a random
//! port, accepts any number of subscribers and writes every update of its
//! sensor to all of them, in connection order.
//!
//! Subscribers are never read from and never registered with the reactor. A
//! subscriber only shows that it has gone away when a write fails, and it is
//! pruned on the spot. Writes are not buffered: `WouldBlock` or a short write
//! drops the subscriber just like a reset would.
//!
//! ## Lifecycle:
//!
//! `open` binds, registers the listening socket with the reactor and the
//! endpoint itself with the registry. Both hold an `Rc` to the endpoint. The
//! cycle is broken by `close()`, which the registry triggers when the
//! producer of the sensor disconnects.

use std::cell::{Cell, RefCell};
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use mio::net::{TcpListener, TcpStream};

use super::port_binder::{bind_with_retry, BindPolicy};
use super::protocol::encode_update;
use super::reactor::{ChannelHandler, Interest, Reactor, Readiness, Token};
use super::registry::{ListenerId, SensorListener, SensorRegistry};
use super::sensor::{Sensor, SensorKey};
use crate::error::{MonitorError, MonitorResult};

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

struct Subscriber {
    stream: TcpStream,
    peer: SocketAddr,
}

/// # Subscription Endpoint
pub struct SubscriptionEndpoint {
    id: u64,
    port: u16,
    sensor: SensorKey,
    reactor: Rc<Reactor>,
    registry: Rc<SensorRegistry>,
    token: Cell<Option<Token>>,
    listener_id: Cell<Option<ListenerId>>,
    server: RefCell<Option<TcpListener>>,
    subscribers: RefCell<Vec<Subscriber>>,
}

impl SubscriptionEndpoint {
    /// # Open
    ///
    /// Binds a port chosen by `policy`, starts accepting subscribers and
    /// starts listening to `sensor`. The sensor does not have to exist yet.
    pub fn open(
        reactor: &Rc<Reactor>,
        registry: &Rc<SensorRegistry>,
        sensor: SensorKey,
        policy: &BindPolicy,
    ) -> MonitorResult<Rc<Self>> {
        let (mut server, port) = bind_with_retry(policy, &mut rand::rng())?;

        let endpoint = Rc::new(Self {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            port,
            sensor,
            reactor: Rc::clone(reactor),
            registry: Rc::clone(registry),
            token: Cell::new(None),
            listener_id: Cell::new(None),
            server: RefCell::new(None),
            subscribers: RefCell::new(Vec::new()),
        });

        let handler: Rc<dyn ChannelHandler> = endpoint.clone();
        let token = reactor
            .register_channel(&mut server, handler, Interest::READABLE)
            .map_err(|source| MonitorError::Register { source })?;
        endpoint.token.set(Some(token));
        *endpoint.server.borrow_mut() = Some(server);

        let listener: Rc<dyn SensorListener> = endpoint.clone();
        let listener_id = registry.add_listener(&endpoint.sensor, listener);
        endpoint.listener_id.set(Some(listener_id));

        log::info!("Subscription {} on port {}", endpoint.sensor, port);
        Ok(endpoint)
    }

    /// Process-unique id, increasing with every endpoint opened.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Port subscribers connect to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The sensor this endpoint streams.
    pub fn sensor(&self) -> &SensorKey {
        &self.sensor
    }

    /// True until `close()`; never true again afterwards.
    pub fn is_valid(&self) -> bool {
        self.server.borrow().is_some()
    }

    /// Number of connected subscribers that have not failed a write yet.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.borrow().len()
    }

    /// # Close
    ///
    /// Stops accepting, drops every subscriber and stops listening to the
    /// sensor. Safe to call any number of times.
    pub fn close(&self) {
        let server = self.server.borrow_mut().take();
        let Some(mut server) = server else {
            return;
        };

        if let Some(token) = self.token.take() {
            self.reactor.unregister_channel(token, &mut server);
        }
        drop(server);

        let subscribers = std::mem::take(&mut *self.subscribers.borrow_mut());
        for subscriber in subscribers {
            let _ = subscriber.stream.shutdown(Shutdown::Both);
        }

        if let Some(listener_id) = self.listener_id.take() {
            self.registry.remove_listener(&self.sensor, listener_id);
        }

        log::info!("Subscription {} on port {} closed", self.sensor, self.port);
    }

    fn accept_pending(&self) {
        loop {
            let accepted = match self.server.borrow().as_ref() {
                Some(server) => server.accept(),
                None => return,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        log::debug!("set_nodelay failed for {}: {}", peer, e);
                    }
                    log::info!("Subscriber {} joined {}", peer, self.sensor);
                    self.subscribers.borrow_mut().push(Subscriber { stream, peer });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Accept failed on port {}: {}", self.port, e);
                    return;
                }
            }
        }
    }
}

impl ChannelHandler for SubscriptionEndpoint {
    fn on_selected(&self, _token: Token, readiness: Readiness) {
        if readiness.wants_read() {
            self.accept_pending();
        }
    }
}

impl SensorListener for SubscriptionEndpoint {
    fn on_update(&self, sensor: &Sensor) {
        if !self.is_valid() {
            return;
        }

        let payload = encode_update(sensor);
        let sensor_key = &self.sensor;
        self.subscribers.borrow_mut().retain_mut(|subscriber| {
            match subscriber.stream.write_all(payload.as_bytes()) {
                Ok(()) => true,
                Err(e) => {
                    log::info!(
                        "Dropping subscriber {} of {}: {}",
                        subscriber.peer,
                        sensor_key,
                        e
                    );
                    let _ = subscriber.stream.shutdown(Shutdown::Both);
                    false
                }
            }
        });
    }

    fn on_disconnected(&self, _sensor: &Sensor) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::port_binder::PortRange;
    use std::io::Read;
    use std::net::{IpAddr, Ipv4Addr, TcpStream as StdTcpStream};
    use std::time::Duration;

    struct Fixture {
        reactor: Rc<Reactor>,
        registry: Rc<SensorRegistry>,
        key: SensorKey,
    }

    fn fixture() -> Fixture {
        let reactor = Rc::new(Reactor::new().unwrap());
        let registry = Rc::new(SensorRegistry::new());
        let key = registry.make_sensor("cpu", "usage");
        Fixture {
            reactor,
            registry,
            key,
        }
    }

    fn loopback_policy() -> BindPolicy {
        BindPolicy {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            range: PortRange::new(20000, 60000).unwrap(),
            max_attempts: Some(200),
            reserved: Vec::new(),
        }
    }

    fn connect(port: u16) -> StdTcpStream {
        let stream = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }

    fn pump_until(reactor: &Reactor, mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            reactor.run_once(Some(Duration::from_millis(10))).unwrap();
        }
        assert!(done(), "condition not reached");
    }

    fn read_payload(stream: &mut StdTcpStream, expected: &str) {
        let mut buf = vec![0u8; expected.len()];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), expected);
    }

    #[test]
    fn test_update_reaches_every_subscriber() {
        let fx = fixture();
        let endpoint =
            SubscriptionEndpoint::open(&fx.reactor, &fx.registry, fx.key.clone(), &loopback_policy())
                .unwrap();

        let mut clients: Vec<StdTcpStream> = (0..3).map(|_| connect(endpoint.port())).collect();
        pump_until(&fx.reactor, || endpoint.subscriber_count() == 3);

        fx.registry.update_measurement(&fx.key, 0.42);
        for client in clients.iter_mut() {
            read_payload(client, "#cpu#usage#0.420000#");
        }
        endpoint.close();
    }

    #[test]
    fn test_failed_subscriber_is_pruned_others_keep_receiving() {
        let fx = fixture();
        let endpoint =
            SubscriptionEndpoint::open(&fx.reactor, &fx.registry, fx.key.clone(), &loopback_policy())
                .unwrap();

        let gone = connect(endpoint.port());
        let mut alive = connect(endpoint.port());
        pump_until(&fx.reactor, || endpoint.subscriber_count() == 2);
        drop(gone);

        // The first write to a closed peer may still succeed; the reset
        // surfaces on a later one.
        let mut updates = 0;
        while endpoint.subscriber_count() == 2 && updates < 50 {
            fx.registry.update_measurement(&fx.key, 1.0);
            updates += 1;
            std::thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(endpoint.subscriber_count(), 1);
        for _ in 0..updates {
            read_payload(&mut alive, "#cpu#usage#1.000000#");
        }
        endpoint.close();
    }

    #[test]
    fn test_close_is_idempotent_and_releases_everything() {
        let fx = fixture();
        let endpoint =
            SubscriptionEndpoint::open(&fx.reactor, &fx.registry, fx.key.clone(), &loopback_policy())
                .unwrap();
        let port = endpoint.port();
        assert!(endpoint.is_valid());
        assert_eq!(fx.registry.listener_count(&fx.key), 1);
        assert_eq!(fx.reactor.channel_count(), 1);

        endpoint.close();
        endpoint.close();

        assert!(!endpoint.is_valid());
        assert_eq!(fx.registry.listener_count(&fx.key), 0);
        assert_eq!(fx.reactor.channel_count(), 0);
        assert!(StdTcpStream::connect(("127.0.0.1", port)).is_err());
    }

    #[test]
    fn test_disconnect_notification_closes_endpoint() {
        let fx = fixture();
        let endpoint =
            SubscriptionEndpoint::open(&fx.reactor, &fx.registry, fx.key.clone(), &loopback_policy())
                .unwrap();
        let mut client = connect(endpoint.port());
        pump_until(&fx.reactor, || endpoint.subscriber_count() == 1);

        fx.registry.notify_disconnected(&fx.key);

        assert!(!endpoint.is_valid());
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    }

    #[test]
    fn test_endpoints_get_distinct_ports_and_ids() {
        let fx = fixture();
        let mut policy = loopback_policy();
        policy.reserved.push(12087);

        let endpoints: Vec<Rc<SubscriptionEndpoint>> = (0..5)
            .map(|_| {
                SubscriptionEndpoint::open(&fx.reactor, &fx.registry, fx.key.clone(), &policy)
                    .unwrap()
            })
            .collect();

        let mut ports: Vec<u16> = endpoints.iter().map(|e| e.port()).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 5);
        assert!(!ports.contains(&12087));
        assert!(endpoints.windows(2).all(|w| w[0].id() < w[1].id()));

        for endpoint in &endpoints {
            endpoint.close();
        }
    }
}
