use std::{cell::RefCell, collections::VecDeque, os::fd::RawFd, rc::Rc};

use indexmap::{IndexMap, IndexSet};
use mio::Token;
use netfs_fs::{FilesystemBackend as _, NotifyEvent, NotifyHandle, SharedBackend};
use netfs_wire::{CHUNK_NOTIFICATION, FrameBuffer, STATUS_OK};
use tracing::{debug, info, warn};

use crate::{
    looper::{LooperCtl, LooperHandler, Ready},
    sock::SocketWriter,
};

/// A reply or notification frame queued on a connection, carrying its own
/// write progress so a partially sent frame resumes where it stopped.
pub struct PendingReply {
    pub frame: FrameBuffer,
    pub writer: SocketWriter,
}

impl PendingReply {
    pub fn new(frame: FrameBuffer) -> Self {
        let mut writer = SocketWriter::default();
        writer.start(frame.len());
        Self { frame, writer }
    }
}

/// Outbound frame queue of one connection, shared with the broker.
pub type OutboundQueue = Rc<RefCell<VecDeque<PendingReply>>>;

/// Where the broker delivers frames for one subscription.
pub struct SubscriberSink {
    pub token: Token,
    pub fd: RawFd,
    pub queue: OutboundQueue,
}

struct ProtocolSubs {
    backend: SharedBackend,
    sinks: IndexMap<NotifyHandle, SubscriberSink>,
    by_conn: IndexMap<Token, IndexSet<NotifyHandle>>,
}

/// Routes backend change events to subscribed connections and guarantees
/// that a dying connection leaves no handle behind on any backend.
#[derive(Default)]
pub struct NotifySystem {
    protocols: IndexMap<String, ProtocolSubs>,
}

impl NotifySystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a notification-capable backend under `protocol`.
    pub fn adopt(&mut self, protocol: &str, backend: SharedBackend) {
        self.protocols.insert(
            protocol.to_owned(),
            ProtocolSubs { backend, sinks: IndexMap::new(), by_conn: IndexMap::new() },
        );
    }

    /// Install a subscription on behalf of a connection. Returns the backend
    /// handle, or -1 when the protocol is unknown or the backend refuses;
    /// either way the caller reports the value to the client as a normal
    /// reply.
    pub fn install(&mut self, protocol: &str, path: &str, sink: SubscriberSink) -> NotifyHandle {
        let Some(subs) = self.protocols.get_mut(protocol) else {
            debug!(protocol, "subscription for unknown protocol");
            return -1;
        };
        match subs.backend.borrow_mut().install_notification(path) {
            Ok(handle) => {
                subs.by_conn.entry(sink.token).or_default().insert(handle);
                subs.sinks.insert(handle, sink);
                handle
            }
            Err(err) => {
                warn!(%err, protocol, path, "notification install failed");
                -1
            }
        }
    }

    /// Release `handle` if it belongs to `token` under `protocol`; silent
    /// no-op otherwise.
    pub fn uninstall(&mut self, token: Token, protocol: &str, handle: NotifyHandle) {
        let Some(subs) = self.protocols.get_mut(protocol) else { return };
        let owned = subs.by_conn.get_mut(&token).is_some_and(|set| set.swap_remove(&handle));
        if !owned {
            return;
        }
        subs.sinks.swap_remove(&handle);
        subs.backend.borrow_mut().uninstall_notification(handle);
    }

    /// Release every subscription of a connection. Called on teardown.
    pub fn uninstall_all(&mut self, token: Token) {
        for subs in self.protocols.values_mut() {
            let Some(handles) = subs.by_conn.swap_remove(&token) else { continue };
            let mut backend = subs.backend.borrow_mut();
            for handle in handles {
                subs.sinks.swap_remove(&handle);
                backend.uninstall_notification(handle);
            }
        }
    }

    /// Outstanding subscriptions across all protocols.
    pub fn total_subscriptions(&self) -> usize {
        self.protocols.values().map(|subs| subs.sinks.len()).sum()
    }

    /// Route drained backend events into subscriber queues, arming write
    /// interest on every queue that goes empty → non-empty.
    pub fn dispatch(&mut self, protocol: &str, events: Vec<NotifyEvent>, ctl: &LooperCtl<'_>) {
        let Some(subs) = self.protocols.get(protocol) else { return };
        for event in events {
            let Some(sink) = subs.sinks.get(&event.handle) else { continue };

            let mut frame = FrameBuffer::new();
            frame.add_u32(CHUNK_NOTIFICATION);
            frame.add_u32(STATUS_OK);
            frame.add_u64(event.path.len() as u64 + 8);
            frame.add_string(&event.path);
            frame.add_u32(event.kind as u32);

            let mut queue = sink.queue.borrow_mut();
            let was_empty = queue.is_empty();
            queue.push_back(PendingReply::new(frame));
            drop(queue);

            if was_empty {
                if let Err(err) = ctl.rearm(sink.fd, sink.token, Ready::IN | Ready::OUT) {
                    debug!(%err, token = ?sink.token, "arming subscriber for write failed");
                }
            }
        }
    }
}

/// Loop handler bridging one backend's notification fd into the broker.
/// Readable means the backend has queued change events; draining them
/// synchronously invokes the routing above on the loop thread.
pub struct BackendWatcher {
    protocol: String,
    backend: SharedBackend,
    fd: RawFd,
    notify: Rc<RefCell<NotifySystem>>,
}

impl BackendWatcher {
    pub fn new(
        protocol: String,
        backend: SharedBackend,
        fd: RawFd,
        notify: Rc<RefCell<NotifySystem>>,
    ) -> Self {
        info!(protocol, "watching backend notifications");
        Self { protocol, backend, fd, notify }
    }
}

impl LooperHandler for BackendWatcher {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn handle(&mut self, ctl: &mut LooperCtl<'_>, ready: Ready) -> bool {
        if ready.contains(Ready::IN) {
            let events = self.backend.borrow_mut().poll_notifications();
            if !events.is_empty() {
                self.notify.borrow_mut().dispatch(&self.protocol, events, ctl);
            }
        }
        true
    }
}
