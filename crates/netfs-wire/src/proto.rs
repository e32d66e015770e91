/// Magic opening a client request chunk.
pub const CHUNK_REQUEST: u32 = u32::from_le_bytes(*b"NREQ");
/// Magic opening a command reply chunk.
pub const CHUNK_REPLY: u32 = u32::from_le_bytes(*b"NREP");
/// Magic opening an unsolicited change-notification chunk.
pub const CHUNK_NOTIFICATION: u32 = u32::from_le_bytes(*b"NNOT");

pub const STATUS_OK: u32 = 0;
pub const STATUS_IO: u32 = 1;

/// Bytes of the leading command id field of a request.
pub const COMMAND_SIZE: usize = 4;
/// Bytes of a chunk preamble: a u32 followed by a u64 payload length.
pub const PREAMBLE_SIZE: usize = 12;

/// Request command ids. The numeric assignment is part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Walk = 1,
    List = 2,
    ReadFile = 3,
    WriteFile = 4,
    Stat = 5,
    Notification = 6,
    RegisterNotification = 7,
    UnregisterNotification = 8,
}

impl Command {
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Walk),
            2 => Some(Self::List),
            3 => Some(Self::ReadFile),
            4 => Some(Self::WriteFile),
            5 => Some(Self::Stat),
            6 => Some(Self::Notification),
            7 => Some(Self::RegisterNotification),
            8 => Some(Self::UnregisterNotification),
            _ => None,
        }
    }
}

/// What a path resolves to on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PathKind {
    Plain = 0,
    Directory = 1,
    Special = 2,
}

impl PathKind {
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Plain),
            1 => Some(Self::Directory),
            2 => Some(Self::Special),
            _ => None,
        }
    }
}

/// Kind of a filesystem change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NotifyKind {
    Created = 0,
    Deleted = 1,
    Changed = 2,
}

impl NotifyKind {
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Created),
            1 => Some(Self::Deleted),
            2 => Some(Self::Changed),
            _ => None,
        }
    }
}
