mod local;
mod registry;

pub use local::LocalBackend;
pub use registry::{BackendRegistry, DEFAULT_PROTOCOL, SharedBackend, split_protocol};

use std::{io, os::fd::RawFd};

use netfs_wire::{NotifyKind, PathKind};
use thiserror::Error;

/// Opaque id of one installed change notification. Non-negative once
/// installed; the wire reserves -1 for "install failed".
pub type NotifyHandle = i64;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("path escapes the served root: {0:?}")]
    InvalidPath(String),
    #[error("unknown protocol: {0:?}")]
    UnknownProtocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    pub kind: PathKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub path: String,
    pub kind: PathKind,
}

/// One filesystem change, tagged with the notification handle it was
/// installed under. A change on a path with several installed handles is
/// reported once per handle.
#[derive(Debug, Clone)]
pub struct NotifyEvent {
    pub handle: NotifyHandle,
    pub path: String,
    pub kind: NotifyKind,
}

/// An opened backend file. Bulk transfer goes through owned mappings: `map`
/// materialises the full contents, `map_write` hands out a fresh region of
/// exactly the requested size, and `unmap` returns the region, flushing it
/// to the backing store for write-mode files.
pub trait BackendFile {
    /// Size of the flushed backing store contents.
    fn size(&self) -> u64;
    fn map(&mut self) -> io::Result<Vec<u8>>;
    fn map_write(&mut self, len: usize) -> io::Result<Vec<u8>>;
    fn unmap(&mut self, region: Vec<u8>) -> io::Result<()>;
}

/// Filesystem capabilities of one protocol.
///
/// Change notifications are readiness-driven: when `notification_fd`
/// becomes readable, `poll_notifications` drains the pending kernel events
/// and reports them per installed handle. Backends without a notification
/// source return `None` and never produce events.
pub trait FilesystemBackend {
    fn open(&mut self, path: &str, mode: FileMode) -> Result<Box<dyn BackendFile>, FsError>;
    fn stat(&self, path: &str) -> Result<FileStat, FsError>;
    /// One directory level.
    fn list(&self, path: &str) -> Result<Vec<ListEntry>, FsError>;
    /// Recursive listing.
    fn walk(&self, path: &str) -> Result<Vec<ListEntry>, FsError>;

    fn notification_fd(&self) -> Option<RawFd>;
    fn install_notification(&mut self, path: &str) -> Result<NotifyHandle, FsError>;
    fn uninstall_notification(&mut self, handle: NotifyHandle);
    fn poll_notifications(&mut self) -> Vec<NotifyEvent>;
}
