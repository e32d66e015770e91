mod connection;
mod listener;
mod looper;
mod notify;
mod server;
mod sock;

pub use connection::{FsConnection, SharedNotify, SharedRegistry};
pub use listener::Listener;
pub use looper::{Looper, LooperCtl, LooperHandler, Ready};
pub use notify::{BackendWatcher, NotifySystem, OutboundQueue, PendingReply, SubscriberSink};
pub use server::NetfsServer;
pub use sock::{IoOutcome, SocketReader, SocketWriter};
