use std::{collections::HashMap, io, os::fd::RawFd, time::Duration};

use bitflags::bitflags;
use mio::{Events, Interest, Poll, Registry, Token, unix::SourceFd};
use tracing::{debug, trace};

bitflags! {
    /// Readiness conditions a handler waits on or is woken with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ready: u8 {
        const IN = 0b01;
        const OUT = 0b10;
    }
}

impl Ready {
    fn interest(self) -> Interest {
        // mio has no empty interest; read-only is the resting default.
        match (self.contains(Self::IN), self.contains(Self::OUT)) {
            (_, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (true, true) => Interest::READABLE | Interest::WRITABLE,
        }
    }
}

/// An object owned and driven by the [`Looper`].
///
/// Readiness is edge-triggered: a handler must drive its I/O to
/// `WouldBlock` before parking, or it will not be woken again.
pub trait LooperHandler {
    /// Fd the loop polls for this handler.
    fn raw_fd(&self) -> RawFd;
    /// React to readiness. Returning `false` destroys the handler.
    fn handle(&mut self, ctl: &mut LooperCtl<'_>, ready: Ready) -> bool;
}

/// Capabilities a handler gets while being dispatched. Interest changes are
/// applied immediately; handlers registered here join the loop before the
/// next `wait`.
pub struct LooperCtl<'a> {
    registry: &'a Registry,
    token: Token,
    fd: RawFd,
    pending: &'a mut Vec<(Token, Box<dyn LooperHandler>)>,
    next_token: &'a mut usize,
}

impl LooperCtl<'_> {
    /// Token of the handler being dispatched.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Change the dispatched handler's own interest mask.
    pub fn set_interest(&self, ready: Ready) -> io::Result<()> {
        self.registry.reregister(&mut SourceFd(&self.fd), self.token, ready.interest())
    }

    /// Adopt a new handler into the loop.
    pub fn register_handler(
        &mut self,
        ready: Ready,
        handler: Box<dyn LooperHandler>,
    ) -> io::Result<Token> {
        let token = Token(*self.next_token);
        *self.next_token += 1;
        let fd = handler.raw_fd();
        self.registry.register(&mut SourceFd(&fd), token, ready.interest())?;
        self.pending.push((token, handler));
        Ok(token)
    }

    /// Re-arm another handler's fd. Used by the notification broker to
    /// extend a subscribed connection's mask with `OUT` when its queue
    /// goes non-empty.
    pub fn rearm(&self, fd: RawFd, token: Token, ready: Ready) -> io::Result<()> {
        self.registry.reregister(&mut SourceFd(&fd), token, ready.interest())
    }
}

/// Single-threaded readiness loop over `mio::Poll`.
///
/// Handlers are owned by the loop and dispatched one at a time; a handler
/// whose `handle` returns `false` is deregistered and dropped before the
/// next event is processed, so its teardown never races other handlers.
pub struct Looper {
    poll: Poll,
    events: Events,
    handlers: HashMap<Token, Box<dyn LooperHandler>>,
    pending: Vec<(Token, Box<dyn LooperHandler>)>,
    next_token: usize,
    scratch: Vec<(Token, Ready)>,
}

impl Looper {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            handlers: HashMap::new(),
            pending: Vec::new(),
            next_token: 0,
            scratch: Vec::new(),
        })
    }

    pub fn register_handler(
        &mut self,
        ready: Ready,
        handler: Box<dyn LooperHandler>,
    ) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        let fd = handler.raw_fd();
        self.poll.registry().register(&mut SourceFd(&fd), token, ready.interest())?;
        self.handlers.insert(token, handler);
        Ok(token)
    }

    pub fn modify_handler(&mut self, token: Token, ready: Ready) -> io::Result<()> {
        let Some(handler) = self.handlers.get(&token) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no handler for token"));
        };
        let fd = handler.raw_fd();
        self.poll.registry().reregister(&mut SourceFd(&fd), token, ready.interest())
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Block up to `timeout` (`None` = forever) and dispatch every ready
    /// handler once. Returns the number of dispatches.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut work = std::mem::take(&mut self.scratch);
        for event in &self.events {
            let mut ready = Ready::empty();
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                ready |= Ready::IN;
            }
            if event.is_writable() || event.is_write_closed() {
                ready |= Ready::OUT;
            }
            if !ready.is_empty() {
                work.push((event.token(), ready));
            }
        }

        let mut dispatched = 0;
        for &(token, ready) in &work {
            dispatched += usize::from(self.dispatch(token, ready));
        }
        work.clear();
        self.scratch = work;

        // Handlers adopted mid-dispatch join the table now; their fds were
        // registered when `LooperCtl::register_handler` ran.
        for (token, handler) in self.pending.drain(..) {
            self.handlers.insert(token, handler);
        }

        Ok(dispatched)
    }

    fn dispatch(&mut self, token: Token, ready: Ready) -> bool {
        // Taken out of the table for the duration of the call so the
        // handler can adopt new handlers through the ctl.
        let Some(mut handler) = self.handlers.remove(&token) else {
            trace!(?token, "event for departed handler");
            return false;
        };
        let fd = handler.raw_fd();
        let mut ctl = LooperCtl {
            registry: self.poll.registry(),
            token,
            fd,
            pending: &mut self.pending,
            next_token: &mut self.next_token,
        };

        if handler.handle(&mut ctl, ready) {
            self.handlers.insert(token, handler);
        } else {
            if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                debug!(?err, ?token, "deregister on teardown failed");
            }
            debug!(?token, "handler destroyed");
        }
        true
    }
}
