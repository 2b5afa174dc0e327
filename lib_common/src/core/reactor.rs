//! # Single-Threaded Reactor
//!
//! The `Reactor` owns the one `mio::Poll` instance of the process. Every socket
//! in the system (the ingestion listener, producer connections, subscription
//! listeners, signal sources) is registered here together with a
//! `ChannelHandler`. A single dispatch loop waits for readiness and calls the
//! handlers. No other component waits or blocks.
//!
//! ## Dispatch rules:
//!
//! - Handlers are invoked once per ready token per iteration, in the order the
//!   channels were registered.
//! - Dispatch walks a snapshot of the records taken after the poll returns.
//!   A handler may register or unregister any channel (itself included).
//!   A record removed earlier in the same iteration is skipped.
//! - Tokens are never reused, so a stale readiness event can never reach a
//!   channel registered later under the same slot.
//! - `mio` readiness is edge-triggered. Handlers must drain their source until
//!   `WouldBlock`, otherwise the remaining data is not reported again.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use mio::event::{Event, Source};
use mio::{Events, Poll, Registry};

pub use mio::{Interest, Token};

/// Capacity of the event buffer handed to `Poll::poll`.
const EVENTS_CAPACITY: usize = 256;

/// # Readiness
///
/// The readiness reported for one token in one iteration. Several `mio`
/// events for the same token are merged into one value before dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data (or a pending connection, for listeners) can be read.
    pub readable: bool,
    /// The socket can be written to.
    pub writable: bool,
    /// The peer closed its writing half.
    pub read_closed: bool,
    /// The writing half is closed.
    pub write_closed: bool,
    /// The source reported an error condition.
    pub error: bool,
}

impl Readiness {
    fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            error: event.is_error(),
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            readable: self.readable || other.readable,
            writable: self.writable || other.writable,
            read_closed: self.read_closed || other.read_closed,
            write_closed: self.write_closed || other.write_closed,
            error: self.error || other.error,
        }
    }

    /// True when a read (or accept) should be attempted: readable, closed by
    /// the peer, or in error. The last two are surfaced by the read itself.
    pub fn wants_read(&self) -> bool {
        self.readable || self.read_closed || self.error
    }
}

/// # Channel Handler
///
/// Callback attached to a registered channel. Implementors own their socket
/// and use interior mutability, since the reactor only holds a shared `Rc`.
pub trait ChannelHandler {
    /// Called when the channel registered under `token` is ready.
    fn on_selected(&self, token: Token, readiness: Readiness);
}

impl<F> ChannelHandler for F
where
    F: Fn(Token, Readiness),
{
    fn on_selected(&self, token: Token, readiness: Readiness) {
        self(token, readiness)
    }
}

struct ChannelRecord {
    token: Token,
    handler: Rc<dyn ChannelHandler>,
}

/// # Reactor
///
/// Shared by `Rc` between every component that needs to register sockets.
/// Deliberately `!Send`: all I/O happens on the thread that created it.
pub struct Reactor {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    registry: Registry,
    records: RefCell<Vec<ChannelRecord>>,
    next_token: Cell<usize>,
    stop_requested: Cell<bool>,
}

impl Reactor {
    /// Creates the multiplexer. Failure here is fatal to startup.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            poll: RefCell::new(poll),
            events: RefCell::new(Events::with_capacity(EVENTS_CAPACITY)),
            registry,
            records: RefCell::new(Vec::new()),
            next_token: Cell::new(0),
            stop_requested: Cell::new(false),
        })
    }

    /// # Register Channel
    ///
    /// Attaches `source` with the requested interest and associates `handler`
    /// with the returned token. `mio` sources are always in non-blocking mode.
    /// A source converted from `std` must have `set_nonblocking(true)` applied
    /// by the caller first.
    ///
    /// An error means the channel is unusable. Callers treat it as fatal for
    /// that channel.
    pub fn register_channel<S>(
        &self,
        source: &mut S,
        handler: Rc<dyn ChannelHandler>,
        interest: Interest,
    ) -> io::Result<Token>
    where
        S: Source + ?Sized,
    {
        let token = Token(self.next_token.get());
        self.next_token.set(token.0 + 1);

        self.registry.register(source, token, interest).map_err(|e| {
            log::error!("Unable to register channel: {}", e);
            e
        })?;

        self.records.borrow_mut().push(ChannelRecord { token, handler });
        log::trace!("Registered channel {:?} with interest {:?}", token, interest);
        Ok(token)
    }

    /// # Unregister Channel
    ///
    /// Detaches `source` and drops the handler association. Calling it for a
    /// token that is not registered (anymore) does nothing.
    pub fn unregister_channel<S>(&self, token: Token, source: &mut S)
    where
        S: Source + ?Sized,
    {
        let removed = {
            let mut records = self.records.borrow_mut();
            match records.iter().position(|r| r.token == token) {
                Some(index) => Some(records.remove(index)),
                None => None,
            }
        };

        if removed.is_some() {
            if let Err(e) = self.registry.deregister(source) {
                log::debug!("Deregistering channel {:?} failed: {}", token, e);
            }
            log::trace!("Unregistered channel {:?}", token);
        }
        // `removed` (and the handler it holds) is dropped here, outside the borrow.
    }

    /// True while `token` has a live registration.
    pub fn is_registered(&self, token: Token) -> bool {
        self.records.borrow().iter().any(|r| r.token == token)
    }

    /// Number of live registrations.
    pub fn channel_count(&self) -> usize {
        self.records.borrow().len()
    }

    /// # Run Once
    ///
    /// Waits up to `timeout` (forever with `None`) for readiness, then
    /// dispatches. Returns the number of handler invocations.
    pub fn run_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let ready: HashMap<Token, Readiness> = {
            let mut poll = self.poll.borrow_mut();
            let mut events = self.events.borrow_mut();
            poll.poll(&mut events, timeout)?;

            let mut ready: HashMap<Token, Readiness> = HashMap::new();
            for event in events.iter() {
                let readiness = Readiness::from_event(event);
                ready
                    .entry(event.token())
                    .and_modify(|r| *r = r.merge(readiness))
                    .or_insert(readiness);
            }
            ready
        };

        if ready.is_empty() {
            return Ok(0);
        }

        let snapshot: Vec<(Token, Rc<dyn ChannelHandler>)> = self
            .records
            .borrow()
            .iter()
            .filter(|r| ready.contains_key(&r.token))
            .map(|r| (r.token, Rc::clone(&r.handler)))
            .collect();

        let mut dispatched = 0;
        for (token, handler) in snapshot {
            // A handler earlier in this round may have removed this record.
            if !self.is_registered(token) {
                continue;
            }
            handler.on_selected(token, ready[&token]);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// # Run
    ///
    /// Dispatch loop. Returns after `stop()` has been called. Multiplexer
    /// failures are logged and the loop keeps going. Only the failing round is
    /// lost.
    pub fn run(&self) {
        self.stop_requested.set(false);
        log::debug!("Reactor loop started with {} channels", self.channel_count());

        while !self.stop_requested.get() {
            match self.run_once(None) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => log::error!("Readiness wait failed: {}", e),
            }
        }

        log::debug!("Reactor loop stopped");
    }

    /// Asks `run()` to return once the current round has been dispatched.
    pub fn stop(&self) {
        self.stop_requested.set(true);
    }

    /// True once `stop()` has been requested and `run()` has not restarted.
    pub fn is_stopping(&self) -> bool {
        self.stop_requested.get()
    }
}
