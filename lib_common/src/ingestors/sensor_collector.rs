//! # Sensor Collector
//!
//! Listens on the ingestion port and turns producer connections into sensor
//! updates. Each accepted connection gets its own `ProducerConnection`, which
//! runs the small state machine below:
//!
//! ```text
//! AwaitingIdentity --first valid message--> Streaming(key) --EOF/error--> Closed
//!         \-------------------------EOF/error--------------------------/
//! ```
//!
//! The first valid message establishes the sensor (created in the registry if
//! new). Every valid message, including the first, records a measurement and
//! synchronously notifies the listeners of that sensor. A malformed message
//! closes the connection through the same path as end of stream.

use std::cell::{Cell, RefCell};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use mio::net::{TcpListener, TcpStream};

use crate::core::monitor::MonitorSettings;
use crate::core::protocol::{is_blank, next_line, DecodeError, SensorReading};
use crate::core::reactor::{ChannelHandler, Interest, Reactor, Readiness, Token};
use crate::core::registry::SensorRegistry;
use crate::core::sensor::SensorKey;
use crate::error::{MonitorError, MonitorResult};

/// State of a producer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, no valid message yet.
    AwaitingIdentity,
    /// Bound to a sensor by its first valid message.
    Streaming(SensorKey),
    /// Socket released; nothing more happens on this connection.
    Closed,
}

impl ConnectionState {
    /// The sensor established by this connection, if any.
    pub fn sensor(&self) -> Option<&SensorKey> {
        match self {
            ConnectionState::Streaming(key) => Some(key),
            _ => None,
        }
    }
}

/// # Producer Connection
///
/// One accepted ingestion socket.
pub struct ProducerConnection {
    peer: SocketAddr,
    reactor: Rc<Reactor>,
    registry: Rc<SensorRegistry>,
    stream: RefCell<Option<TcpStream>>,
    token: Cell<Option<Token>>,
    state: RefCell<ConnectionState>,
    pending: RefCell<Vec<u8>>,
    read_buffer_size: usize,
    max_message_len: usize,
}

impl ProducerConnection {
    /// Remote address of the producer.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// True once the connection went through `close()`.
    pub fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Closed)
    }

    /// # Close
    ///
    /// Unregisters and drops the socket. If a sensor had been established,
    /// its listeners are told the producer disconnected. Idempotent.
    pub fn close(&self) {
        let previous = self.state.replace(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return;
        }

        let stream = self.stream.borrow_mut().take();
        if let Some(mut stream) = stream {
            if let Some(token) = self.token.take() {
                self.reactor.unregister_channel(token, &mut stream);
            }
        }
        self.pending.borrow_mut().clear();

        match previous {
            ConnectionState::Streaming(key) => {
                log::info!("Producer {} of {} disconnected", self.peer, key);
                self.registry.notify_disconnected(&key);
            }
            _ => log::info!("Producer {} disconnected", self.peer),
        }
    }

    fn reject(&self, error: DecodeError) {
        log::warn!("Dropping producer {}: {}", self.peer, error);
        self.close();
    }

    /// End of stream: an unterminated remainder still counts as a message.
    fn finish(&self) {
        let remainder = std::mem::take(&mut *self.pending.borrow_mut());
        if !is_blank(&remainder) {
            if let Err(e) = self.handle_message(&remainder) {
                log::warn!("Discarding final message from {}: {}", self.peer, e);
            }
        }
        self.close();
    }

    fn drain_lines(&self) -> Result<(), DecodeError> {
        loop {
            if self.is_closed() {
                return Ok(());
            }
            let line = next_line(&mut self.pending.borrow_mut());
            let Some(line) = line else {
                break;
            };
            if is_blank(&line) {
                continue;
            }
            self.handle_message(&line)?;
        }

        let len = self.pending.borrow().len();
        if len > self.max_message_len {
            return Err(DecodeError::MessageTooLong {
                len,
                max: self.max_message_len,
            });
        }
        Ok(())
    }

    fn handle_message(&self, line: &[u8]) -> Result<(), DecodeError> {
        let reading = SensorReading::decode(line)?;

        let established = self.state.borrow().sensor().cloned();
        let key = match established {
            // The first message fixes the sensor; later names are not checked.
            Some(established) => {
                if !established.matches(&reading.resource, &reading.metric) {
                    log::debug!(
                        "Producer {} named {}, recording on {}",
                        self.peer,
                        reading.key(),
                        established
                    );
                }
                established
            }
            None => {
                let key = self.registry.make_sensor(&reading.resource, &reading.metric);
                *self.state.borrow_mut() = ConnectionState::Streaming(key.clone());
                log::info!("Producer {} streaming {}", self.peer, key);
                self.registry.notify_attached(&key);
                key
            }
        };

        log::trace!("{} = {}", key, reading.value);
        self.registry.update_measurement(&key, reading.value);
        Ok(())
    }
}

impl ChannelHandler for ProducerConnection {
    fn on_selected(&self, _token: Token, readiness: Readiness) {
        if !readiness.wants_read() {
            return;
        }

        let mut chunk = vec![0u8; self.read_buffer_size];
        loop {
            let read = {
                let mut stream = self.stream.borrow_mut();
                let Some(stream) = stream.as_mut() else {
                    return;
                };
                stream.read(&mut chunk)
            };

            match read {
                Ok(0) => {
                    self.finish();
                    return;
                }
                Ok(n) => {
                    self.pending.borrow_mut().extend_from_slice(&chunk[..n]);
                    if let Err(e) = self.drain_lines() {
                        self.reject(e);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Read from producer {} failed: {}", self.peer, e);
                    self.close();
                    return;
                }
            }
        }
    }
}

/// # Sensor Collector
///
/// The ingestion listener.
pub struct SensorCollector {
    reactor: Rc<Reactor>,
    registry: Rc<SensorRegistry>,
    local_addr: SocketAddr,
    listener: RefCell<Option<TcpListener>>,
    token: Cell<Option<Token>>,
    producers: RefCell<Vec<Weak<ProducerConnection>>>,
    read_buffer_size: usize,
    max_message_len: usize,
}

impl SensorCollector {
    /// # Bind
    ///
    /// Binds the ingestion port from `settings` and registers it with the
    /// reactor. Errors here are startup failures.
    pub fn bind(
        reactor: &Rc<Reactor>,
        registry: &Rc<SensorRegistry>,
        settings: &MonitorSettings,
    ) -> MonitorResult<Rc<Self>> {
        let addr = SocketAddr::new(settings.bind_address, settings.ingestion_port);
        let mut listener =
            TcpListener::bind(addr).map_err(|source| MonitorError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let collector = Rc::new(Self {
            reactor: Rc::clone(reactor),
            registry: Rc::clone(registry),
            local_addr,
            listener: RefCell::new(None),
            token: Cell::new(None),
            producers: RefCell::new(Vec::new()),
            read_buffer_size: settings.read_buffer_size.max(1),
            max_message_len: settings.max_message_len,
        });

        let handler: Rc<dyn ChannelHandler> = collector.clone();
        let token = reactor
            .register_channel(&mut listener, handler, Interest::READABLE)
            .map_err(|source| MonitorError::Register { source })?;
        collector.token.set(Some(token));
        *collector.listener.borrow_mut() = Some(listener);

        log::info!("Ingestion listener started on {}", local_addr);
        Ok(collector)
    }

    /// Address the ingestion socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True while the ingestion socket is open.
    pub fn is_listening(&self) -> bool {
        self.listener.borrow().is_some()
    }

    /// Number of producer connections not yet closed.
    pub fn producer_count(&self) -> usize {
        self.live_producers().len()
    }

    /// # Shutdown
    ///
    /// Closes the ingestion socket and every producer connection. Producers
    /// that had established a sensor trigger their disconnect notifications.
    pub fn shutdown(&self) {
        let listener = self.listener.borrow_mut().take();
        if let Some(mut listener) = listener {
            if let Some(token) = self.token.take() {
                self.reactor.unregister_channel(token, &mut listener);
            }
            log::info!("Ingestion listener on {} stopped", self.local_addr);
        }

        for producer in self.live_producers() {
            producer.close();
        }
        self.producers.borrow_mut().clear();
    }

    #[cfg(test)]
    fn tracked_producers(&self) -> usize {
        self.producers.borrow().len()
    }

    fn live_producers(&self) -> Vec<Rc<ProducerConnection>> {
        let mut producers = self.producers.borrow_mut();
        producers.retain(|weak| weak.upgrade().is_some_and(|p| !p.is_closed()));
        producers.iter().filter_map(Weak::upgrade).collect()
    }

    fn attach(&self, mut stream: TcpStream, peer: SocketAddr) {
        let producer = Rc::new(ProducerConnection {
            peer,
            reactor: Rc::clone(&self.reactor),
            registry: Rc::clone(&self.registry),
            stream: RefCell::new(None),
            token: Cell::new(None),
            state: RefCell::new(ConnectionState::AwaitingIdentity),
            pending: RefCell::new(Vec::new()),
            read_buffer_size: self.read_buffer_size,
            max_message_len: self.max_message_len,
        });

        let handler: Rc<dyn ChannelHandler> = producer.clone();
        match self
            .reactor
            .register_channel(&mut stream, handler, Interest::READABLE)
        {
            Ok(token) => {
                producer.token.set(Some(token));
                *producer.stream.borrow_mut() = Some(stream);
                let mut producers = self.producers.borrow_mut();
                producers.retain(|weak| weak.upgrade().is_some_and(|p| !p.is_closed()));
                producers.push(Rc::downgrade(&producer));
                log::info!("Producer {} connected", peer);
            }
            Err(e) => log::error!("Dropping producer {}: {}", peer, e),
        }
    }
}

impl ChannelHandler for SensorCollector {
    fn on_selected(&self, _token: Token, readiness: Readiness) {
        if !readiness.wants_read() {
            return;
        }

        loop {
            let accepted = match self.listener.borrow().as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };

            match accepted {
                Ok((stream, peer)) => self.attach(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Accept failed on {}: {}", self.local_addr, e);
                    return;
                }
            }
        }
    }
}
