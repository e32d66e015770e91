mod frame;
mod proto;

pub use frame::{FrameBuffer, WireError};
pub use proto::{
    CHUNK_NOTIFICATION, CHUNK_REPLY, CHUNK_REQUEST, COMMAND_SIZE, Command, NotifyKind, PREAMBLE_SIZE,
    PathKind, STATUS_IO, STATUS_OK,
};
