use std::{
    cell::RefCell,
    collections::VecDeque,
    os::fd::{AsRawFd, RawFd},
    rc::Rc,
};

use mio::{Token, net::TcpStream};
use netfs_fs::{
    BackendFile, BackendRegistry, FileMode, FilesystemBackend as _, FsError, ListEntry,
};
use netfs_wire::{
    CHUNK_REPLY, CHUNK_REQUEST, COMMAND_SIZE, Command, FrameBuffer, PREAMBLE_SIZE, STATUS_IO,
    STATUS_OK,
};
use tracing::debug;

use crate::{
    looper::{LooperCtl, LooperHandler, Ready},
    notify::{NotifySystem, OutboundQueue, PendingReply, SubscriberSink},
    sock::{IoOutcome, SocketReader, SocketWriter},
};

pub type SharedRegistry = Rc<RefCell<BackendRegistry>>;
pub type SharedNotify = Rc<RefCell<NotifySystem>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadCommand,
    ReadChunkSize,
    ReadChunkData,
    ReadChunkSize2,
    ReadChunkData2,
    WriteReplyChunk,
    WriteReplyData,
    NotificationLoop,
    NotificationLoopRegister,
    NotificationLoopUnregister,
}

impl State {
    /// States in which the outbound queue may hold frames.
    fn notification_family(self) -> bool {
        matches!(
            self,
            Self::NotificationLoop | Self::NotificationLoopRegister | Self::NotificationLoopUnregister
        )
    }
}

enum Step {
    Continue,
    Yield,
    Close,
}

/// One client connection: a state machine over a single nonblocking socket
/// that interleaves request parsing, reply streaming, and asynchronously
/// queued notification frames.
///
/// Transfer states always attempt their I/O when dispatched and park on
/// `WouldBlock`; the interest mask tracks which direction can make
/// progress, and the broker widens it when it queues a frame.
pub struct FsConnection {
    stream: TcpStream,
    registry: SharedRegistry,
    notify: SharedNotify,
    token: Option<Token>,
    state: State,
    frame: FrameBuffer,
    reader: SocketReader,
    writer: SocketWriter,
    command: Option<Command>,
    /// Set once by the notification handshake; scopes register/unregister.
    protocol: Option<String>,
    file: Option<Box<dyn BackendFile>>,
    mapped: Option<Vec<u8>>,
    queue: OutboundQueue,
}

impl FsConnection {
    pub fn new(stream: TcpStream, registry: SharedRegistry, notify: SharedNotify) -> Self {
        let _ = stream.set_nodelay(true);
        let mut conn = Self {
            stream,
            registry,
            notify,
            token: None,
            state: State::ReadCommand,
            frame: FrameBuffer::new(),
            reader: SocketReader::default(),
            writer: SocketWriter::default(),
            command: None,
            protocol: None,
            file: None,
            mapped: None,
            queue: Rc::new(RefCell::new(VecDeque::new())),
        };
        conn.begin_frame_read(COMMAND_SIZE);
        conn
    }

    fn begin_frame_read(&mut self, n: usize) {
        self.frame.begin_read(n);
        self.reader.start(n);
    }

    /// Arm the writer on the just-built reply and switch to write-only
    /// interest.
    fn to_write_state(&mut self, ctl: &LooperCtl<'_>) -> Step {
        self.writer.start(self.frame.len());
        self.state = State::WriteReplyChunk;
        match ctl.set_interest(Ready::OUT) {
            Ok(()) => Step::Continue,
            Err(err) => {
                debug!(%err, "interest change failed");
                Step::Close
            }
        }
    }

    fn io_error_reply(&mut self) {
        self.frame.begin();
        self.frame.add_u32(CHUNK_REPLY);
        self.frame.add_u32(STATUS_IO);
        self.frame.add_u64(0);
    }

    fn read_command(&mut self) -> Step {
        match self.reader.process(&mut self.stream, self.frame.as_mut_slice()) {
            IoOutcome::Closed => Step::Close,
            _ if self.reader.complete() => self.parse_command(),
            _ => Step::Yield,
        }
    }

    fn parse_command(&mut self) -> Step {
        let Ok(raw) = self.frame.read_u32() else { return Step::Close };
        match Command::from_wire(raw) {
            Some(
                cmd @ (Command::Walk |
                Command::List |
                Command::ReadFile |
                Command::WriteFile |
                Command::Stat |
                Command::Notification),
            ) => {
                self.command = Some(cmd);
                self.begin_frame_read(PREAMBLE_SIZE);
                self.state = State::ReadChunkSize;
                Step::Continue
            }
            _ => {
                debug!(raw, "unknown command id");
                Step::Close
            }
        }
    }

    fn read_chunk_size(&mut self) -> Step {
        match self.reader.process(&mut self.stream, self.frame.as_mut_slice()) {
            IoOutcome::Closed => Step::Close,
            _ if self.reader.complete() => {
                if self.frame.read_u32() != Ok(CHUNK_REQUEST) {
                    debug!("bad request magic");
                    return Step::Close;
                }
                let Ok(size) = self.frame.read_u64() else { return Step::Close };
                if size == 0 {
                    debug!("zero-length request payload");
                    return Step::Close;
                }
                self.begin_frame_read(size as usize);
                self.state = State::ReadChunkData;
                Step::Continue
            }
            _ => Step::Yield,
        }
    }

    fn read_chunk_data(&mut self, ctl: &LooperCtl<'_>) -> Step {
        match self.reader.process(&mut self.stream, self.frame.as_mut_slice()) {
            IoOutcome::Closed => Step::Close,
            _ if self.reader.complete() => {
                let Ok(arg) = self.frame.read_remaining_string() else { return Step::Close };
                match self.command {
                    Some(Command::ReadFile) => {
                        self.begin_read_file(&arg);
                        self.to_write_state(ctl)
                    }
                    Some(Command::WriteFile) => self.begin_write_file(ctl, &arg),
                    Some(Command::Stat) => {
                        self.begin_stat(&arg);
                        self.to_write_state(ctl)
                    }
                    Some(Command::List) => {
                        self.begin_listing(&arg, false);
                        self.to_write_state(ctl)
                    }
                    Some(Command::Walk) => {
                        self.begin_listing(&arg, true);
                        self.to_write_state(ctl)
                    }
                    Some(Command::Notification) => {
                        self.protocol = Some(arg);
                        if ctl.set_interest(Ready::IN).is_err() {
                            return Step::Close;
                        }
                        self.begin_frame_read(PREAMBLE_SIZE);
                        self.state = State::NotificationLoop;
                        Step::Continue
                    }
                    _ => Step::Close,
                }
            }
            _ => Step::Yield,
        }
    }

    fn open_mapped(&mut self, path: &str) -> Result<(Box<dyn BackendFile>, Vec<u8>), FsError> {
        let (backend, rel) = self.registry.borrow().resolve(path)?;
        let mut file = backend.borrow_mut().open(rel, FileMode::Read)?;
        let mapped = file.map()?;
        Ok((file, mapped))
    }

    fn begin_read_file(&mut self, path: &str) {
        match self.open_mapped(path) {
            Ok((file, mapped)) => {
                self.frame.begin();
                self.frame.add_u32(CHUNK_REPLY);
                self.frame.add_u32(STATUS_OK);
                self.frame.add_u64(mapped.len() as u64);
                self.file = Some(file);
                self.mapped = Some(mapped);
            }
            Err(err) => {
                debug!(%err, path, "read open failed");
                self.io_error_reply();
            }
        }
    }

    fn begin_write_file(&mut self, ctl: &LooperCtl<'_>, path: &str) -> Step {
        let opened = self
            .registry
            .borrow()
            .resolve(path)
            .and_then(|(backend, rel)| backend.borrow_mut().open(rel, FileMode::Write));
        match opened {
            Ok(file) => {
                self.file = Some(file);
                self.begin_frame_read(PREAMBLE_SIZE);
                self.state = State::ReadChunkSize2;
                Step::Continue
            }
            Err(err) => {
                debug!(%err, path, "write open failed");
                self.io_error_reply();
                self.to_write_state(ctl)
            }
        }
    }

    fn begin_stat(&mut self, path: &str) {
        let stat = self
            .registry
            .borrow()
            .resolve(path)
            .and_then(|(backend, rel)| backend.borrow().stat(rel));
        self.frame.begin();
        self.frame.add_u32(CHUNK_REPLY);
        match stat {
            Ok(stat) => {
                self.frame.add_u32(STATUS_OK);
                self.frame.add_u64(8 + 4);
                self.frame.add_u64(stat.size);
                self.frame.add_u32(stat.kind as u32);
            }
            Err(err) => {
                debug!(%err, path, "stat failed");
                self.frame.add_u32(STATUS_IO);
                self.frame.add_u64(0);
            }
        }
    }

    fn begin_listing(&mut self, path: &str, recurse: bool) {
        let entries = self.registry.borrow().resolve(path).and_then(|(backend, rel)| {
            let backend = backend.borrow();
            if recurse { backend.walk(rel) } else { backend.list(rel) }
        });
        match entries {
            Ok(entries) => self.write_entry_list(&entries),
            Err(err) => {
                debug!(%err, path, "listing failed");
                self.io_error_reply();
            }
        }
    }

    fn write_entry_list(&mut self, entries: &[ListEntry]) {
        self.frame.begin();
        self.frame.add_u32(CHUNK_REPLY);
        self.frame.add_u32(STATUS_OK);
        let size_at = self.frame.add_u64(0);
        self.frame.add_u32(entries.len() as u32);
        for entry in entries {
            self.frame.add_string(&entry.path);
            self.frame.add_u32(entry.kind as u32);
        }
        let payload = self.frame.len() - (size_at + 8);
        self.frame.poke_u64(size_at, payload as u64);
    }

    fn read_chunk_size2(&mut self, ctl: &LooperCtl<'_>) -> Step {
        match self.reader.process(&mut self.stream, self.frame.as_mut_slice()) {
            IoOutcome::Closed => Step::Close,
            _ if self.reader.complete() => {
                if self.frame.read_u32() != Ok(CHUNK_REQUEST) {
                    debug!("bad body magic");
                    return Step::Close;
                }
                let Ok(size) = self.frame.read_u64() else { return Step::Close };
                if size == 0 {
                    debug!("zero-length write body");
                    return Step::Close;
                }
                let Some(file) = self.file.as_mut() else { return Step::Close };
                match file.map_write(size as usize) {
                    Ok(region) => {
                        // Body bytes land directly in the mapped region.
                        self.mapped = Some(region);
                        self.reader.start(size as usize);
                        self.state = State::ReadChunkData2;
                        Step::Continue
                    }
                    Err(err) => {
                        debug!(%err, "write mapping failed");
                        self.io_error_reply();
                        self.to_write_state(ctl)
                    }
                }
            }
            _ => Step::Yield,
        }
    }

    fn read_chunk_data2(&mut self, ctl: &LooperCtl<'_>) -> Step {
        let Some(region) = self.mapped.as_mut() else { return Step::Close };
        match self.reader.process(&mut self.stream, region) {
            IoOutcome::Closed => Step::Close,
            _ if self.reader.complete() => {
                // The backend reports flushed bytes only, and the region is
                // flushed after this reply drains, so the size here is what
                // was on disk before the write.
                let size = self.file.as_ref().map_or(0, |file| file.size());
                self.frame.begin();
                self.frame.add_u32(CHUNK_REPLY);
                self.frame.add_u32(STATUS_OK);
                self.frame.add_u64(size);
                self.to_write_state(ctl)
            }
            _ => Step::Yield,
        }
    }

    fn write_reply_chunk(&mut self) -> Step {
        match self.writer.process(&mut self.stream, self.frame.as_slice()) {
            IoOutcome::Closed => Step::Close,
            _ if self.writer.complete() => match self.command {
                Some(Command::ReadFile) => {
                    if let Some(region) = self.mapped.as_ref() {
                        self.writer.start(region.len());
                        self.state = State::WriteReplyData;
                        Step::Continue
                    } else {
                        Step::Close
                    }
                }
                Some(Command::WriteFile) => {
                    self.finish_write();
                    Step::Close
                }
                _ => Step::Close,
            },
            _ => Step::Yield,
        }
    }

    /// Flush the received region to the backend. The connection is done
    /// after a write; it closes once this returns.
    fn finish_write(&mut self) {
        if let (Some(mut file), Some(region)) = (self.file.take(), self.mapped.take()) {
            if let Err(err) = file.unmap(region) {
                debug!(%err, "write flush failed");
            }
        }
    }

    fn write_reply_data(&mut self) -> Step {
        let Some(region) = self.mapped.as_ref() else { return Step::Close };
        match self.writer.process(&mut self.stream, region) {
            IoOutcome::Closed => Step::Close,
            _ if self.writer.complete() => Step::Close,
            _ => Step::Yield,
        }
    }

    fn notification_read(&mut self) -> Step {
        match self.reader.process(&mut self.stream, self.frame.as_mut_slice()) {
            IoOutcome::Closed => Step::Close,
            _ if self.reader.complete() => {
                let Ok(raw) = self.frame.read_u32() else { return Step::Close };
                let Ok(size) = self.frame.read_u64() else { return Step::Close };
                if size == 0 {
                    debug!("zero-length subscription payload");
                    return Step::Close;
                }
                match Command::from_wire(raw) {
                    Some(Command::RegisterNotification) => {
                        self.begin_frame_read(size as usize);
                        self.state = State::NotificationLoopRegister;
                        Step::Continue
                    }
                    Some(Command::UnregisterNotification) => {
                        self.begin_frame_read(size as usize);
                        self.state = State::NotificationLoopUnregister;
                        Step::Continue
                    }
                    _ => {
                        debug!(raw, "unexpected command in notification mode");
                        Step::Close
                    }
                }
            }
            _ => Step::Yield,
        }
    }

    fn notification_register(&mut self, ctl: &LooperCtl<'_>) -> Step {
        match self.reader.process(&mut self.stream, self.frame.as_mut_slice()) {
            IoOutcome::Closed => Step::Close,
            _ if self.reader.complete() => {
                let Ok(path) = self.frame.read_remaining_string() else { return Step::Close };
                let sink = SubscriberSink {
                    token: ctl.token(),
                    fd: self.stream.as_raw_fd(),
                    queue: Rc::clone(&self.queue),
                };
                let protocol = self.protocol.as_deref().unwrap_or_default();
                let handle = self.notify.borrow_mut().install(protocol, &path, sink);

                let mut reply = FrameBuffer::new();
                reply.add_u32(CHUNK_REPLY);
                reply.add_u32(STATUS_OK);
                reply.add_u64(8);
                reply.add_u64(handle as u64);
                self.queue.borrow_mut().push_back(PendingReply::new(reply));

                self.back_to_notification_loop(ctl)
            }
            _ => Step::Yield,
        }
    }

    fn notification_unregister(&mut self, ctl: &LooperCtl<'_>) -> Step {
        match self.reader.process(&mut self.stream, self.frame.as_mut_slice()) {
            IoOutcome::Closed => Step::Close,
            _ if self.reader.complete() => {
                let Ok(handle) = self.frame.read_u64() else { return Step::Close };
                let protocol = self.protocol.as_deref().unwrap_or_default();
                self.notify.borrow_mut().uninstall(ctl.token(), protocol, handle as i64);

                let mut reply = FrameBuffer::new();
                reply.add_u32(CHUNK_REPLY);
                reply.add_u32(STATUS_OK);
                reply.add_u64(0);
                self.queue.borrow_mut().push_back(PendingReply::new(reply));

                self.back_to_notification_loop(ctl)
            }
            _ => Step::Yield,
        }
    }

    fn back_to_notification_loop(&mut self, ctl: &LooperCtl<'_>) -> Step {
        if ctl.set_interest(Ready::IN | Ready::OUT).is_err() {
            return Step::Close;
        }
        self.begin_frame_read(PREAMBLE_SIZE);
        self.state = State::NotificationLoop;
        Step::Continue
    }

    /// Drain the outbound queue head-first. Narrows interest back to `IN`
    /// once empty; keeps `OUT` armed while the kernel pushes back.
    fn flush_queue(&mut self, ctl: &LooperCtl<'_>) -> bool {
        loop {
            let mut queue = self.queue.borrow_mut();
            let Some(head) = queue.front_mut() else { break };
            match head.writer.process(&mut self.stream, head.frame.as_slice()) {
                IoOutcome::Closed => return false,
                _ if head.writer.complete() => {
                    queue.pop_front();
                }
                _ => return true,
            }
        }
        ctl.set_interest(Ready::IN).is_ok()
    }
}

impl LooperHandler for FsConnection {
    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn handle(&mut self, ctl: &mut LooperCtl<'_>, ready: Ready) -> bool {
        if self.token.is_none() {
            self.token = Some(ctl.token());
        }

        // The notification sub-channel writes are independent of the read
        // machine: service them first so queued frames drain even while a
        // register/unregister payload is still trickling in.
        if self.state.notification_family() &&
            ready.contains(Ready::OUT) &&
            !self.flush_queue(ctl)
        {
            return false;
        }

        loop {
            let step = match self.state {
                State::ReadCommand => self.read_command(),
                State::ReadChunkSize => self.read_chunk_size(),
                State::ReadChunkData => self.read_chunk_data(ctl),
                State::ReadChunkSize2 => self.read_chunk_size2(ctl),
                State::ReadChunkData2 => self.read_chunk_data2(ctl),
                State::WriteReplyChunk => self.write_reply_chunk(),
                State::WriteReplyData => self.write_reply_data(),
                State::NotificationLoop => self.notification_read(),
                State::NotificationLoopRegister => self.notification_register(ctl),
                State::NotificationLoopUnregister => self.notification_unregister(ctl),
            };
            match step {
                Step::Continue => {}
                Step::Yield => return true,
                Step::Close => return false,
            }
        }
    }
}

impl Drop for FsConnection {
    fn drop(&mut self) {
        if let Some(token) = self.token {
            self.notify.borrow_mut().uninstall_all(token);
        }
        self.queue.borrow_mut().clear();
    }
}
