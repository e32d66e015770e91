use std::{
    io,
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
    rc::Rc,
};

use mio::net::TcpListener;
use tracing::debug;

use crate::{
    connection::{FsConnection, SharedNotify, SharedRegistry},
    looper::{LooperCtl, LooperHandler, Ready},
};

/// Accepts clients and adopts a fresh connection handler for each.
pub struct Listener {
    listener: TcpListener,
    registry: SharedRegistry,
    notify: SharedNotify,
}

impl Listener {
    pub fn new(listener: TcpListener, registry: SharedRegistry, notify: SharedNotify) -> Self {
        Self { listener, registry, notify }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl LooperHandler for Listener {
    fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn handle(&mut self, ctl: &mut LooperCtl<'_>, _ready: Ready) -> bool {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "client connected");
                    let conn = FsConnection::new(
                        stream,
                        Rc::clone(&self.registry),
                        Rc::clone(&self.notify),
                    );
                    if let Err(err) = ctl.register_handler(Ready::IN, Box::new(conn)) {
                        debug!(%err, %peer, "client registration failed");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(%err, "accept failed");
                    break;
                }
            }
        }
        true
    }
}
