//! SIGINT / SIGTERM as a reactor channel. The signal-hook handler only
//! writes to a self-pipe; the reactor reads it like any other socket, so no
//! extra thread is needed.

use lib_common::core::{ChannelHandler, Interest, Reactor, Readiness, Token};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;
use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

pub struct ShutdownSignals {
    reactor: Rc<Reactor>,
    signals: RefCell<Signals>,
    token: Cell<Option<Token>>,
    received: Cell<Option<i32>>,
}

impl ShutdownSignals {
    pub fn install(reactor: &Rc<Reactor>) -> io::Result<Rc<Self>> {
        let signals = Signals::new([SIGINT, SIGTERM])?;
        let shutdown = Rc::new(Self {
            reactor: Rc::clone(reactor),
            signals: RefCell::new(signals),
            token: Cell::new(None),
            received: Cell::new(None),
        });

        let handler: Rc<dyn ChannelHandler> = shutdown.clone();
        let token = reactor.register_channel(
            &mut *shutdown.signals.borrow_mut(),
            handler,
            Interest::READABLE,
        )?;
        shutdown.token.set(Some(token));
        Ok(shutdown)
    }

    /// The signal that stopped the reactor, if any.
    pub fn received(&self) -> Option<i32> {
        self.received.get()
    }

    pub fn uninstall(&self) {
        if let Some(token) = self.token.take() {
            self.reactor
                .unregister_channel(token, &mut *self.signals.borrow_mut());
        }
    }
}

fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        _ => "signal",
    }
}

impl ChannelHandler for ShutdownSignals {
    fn on_selected(&self, _token: Token, _readiness: Readiness) {
        let pending: Vec<i32> = self.signals.borrow_mut().pending().collect();
        for signal in pending {
            log::info!("{} received, initiating shutdown.", signal_name(signal));
            self.received.set(Some(signal));
        }
        if self.received.get().is_some() {
            self.reactor.stop();
        }
    }
}
