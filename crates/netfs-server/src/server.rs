use std::{
    cell::RefCell,
    io,
    net::SocketAddr,
    rc::Rc,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use mio::net::TcpListener;
use netfs_fs::{BackendRegistry, FilesystemBackend as _, SharedBackend};
use tracing::info;

use crate::{
    connection::{SharedNotify, SharedRegistry},
    listener::Listener,
    looper::{Looper, Ready},
    notify::{BackendWatcher, NotifySystem},
};

/// The assembled service: one loop driving the listener, every live
/// connection, and one watcher per notification-capable backend. Everything
/// runs on the calling thread.
pub struct NetfsServer {
    looper: Looper,
    registry: SharedRegistry,
    notify: SharedNotify,
    local_addr: SocketAddr,
}

impl NetfsServer {
    pub const DEFAULT_PORT: u16 = 7070;

    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let mut looper = Looper::new()?;
        let registry: SharedRegistry = Rc::new(RefCell::new(BackendRegistry::new()));
        let notify: SharedNotify = Rc::new(RefCell::new(NotifySystem::new()));

        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        looper.register_handler(
            Ready::IN,
            Box::new(Listener::new(listener, Rc::clone(&registry), Rc::clone(&notify))),
        )?;
        info!(%local_addr, "listening");

        Ok(Self { looper, registry, notify, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Install a backend under `protocol`. Safe to call while the server is
    /// live (between `poll`s); notification-capable backends get a watcher
    /// on the loop and become subscribable immediately.
    pub fn register_backend(&mut self, protocol: &str, backend: SharedBackend) -> io::Result<()> {
        self.registry.borrow_mut().install(protocol, Rc::clone(&backend));

        let fd = backend.borrow().notification_fd();
        if let Some(fd) = fd {
            self.notify.borrow_mut().adopt(protocol, Rc::clone(&backend));
            let watcher =
                BackendWatcher::new(protocol.to_owned(), backend, fd, Rc::clone(&self.notify));
            self.looper.register_handler(Ready::IN, Box::new(watcher))?;
        }
        info!(protocol, "backend registered");
        Ok(())
    }

    /// One loop iteration; returns the number of handlers dispatched.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.looper.wait(timeout)
    }

    /// Drive the loop until `stop` flips.
    pub fn run_until(&mut self, stop: &AtomicBool) -> io::Result<()> {
        while !stop.load(Ordering::Relaxed) {
            self.poll(Some(Duration::from_millis(200)))?;
        }
        Ok(())
    }

    /// Subscriptions currently outstanding across all connections.
    pub fn subscription_count(&self) -> usize {
        self.notify.borrow().total_subscriptions()
    }
}
