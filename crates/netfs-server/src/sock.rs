use std::io::{self, Read, Write};

use mio::net::TcpStream;
use tracing::debug;

/// Result of a single nonblocking transfer attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum IoOutcome {
    Progress(usize),
    WouldBlock,
    /// Peer gone or the socket failed; the connection must be torn down.
    Closed,
}

/// Tracks partial progress of a read into a caller-supplied buffer.
///
/// `start(n)` arms a fresh window of `n` bytes; each `process` call pulls as
/// many bytes as the kernel will give without blocking. The buffer is passed
/// per call, so the same cursor serves the frame buffer and a file mapping.
#[derive(Debug, Default)]
pub struct SocketReader {
    done: usize,
    target: usize,
}

impl SocketReader {
    pub fn start(&mut self, target: usize) {
        self.done = 0;
        self.target = target;
    }

    pub fn complete(&self) -> bool {
        self.done == self.target
    }

    pub fn process(&mut self, stream: &mut TcpStream, buf: &mut [u8]) -> IoOutcome {
        let mut moved = 0;
        while self.done < self.target {
            match stream.read(&mut buf[self.done..self.target]) {
                Ok(0) => return IoOutcome::Closed,
                Ok(n) => {
                    self.done += n;
                    moved += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if moved > 0 { IoOutcome::Progress(moved) } else { IoOutcome::WouldBlock };
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "socket read failed");
                    return IoOutcome::Closed;
                }
            }
        }
        IoOutcome::Progress(moved)
    }
}

/// Write-side twin of [`SocketReader`].
#[derive(Debug, Default)]
pub struct SocketWriter {
    done: usize,
    target: usize,
}

impl SocketWriter {
    pub fn start(&mut self, target: usize) {
        self.done = 0;
        self.target = target;
    }

    pub fn complete(&self) -> bool {
        self.done == self.target
    }

    pub fn process(&mut self, stream: &mut TcpStream, buf: &[u8]) -> IoOutcome {
        let mut moved = 0;
        while self.done < self.target {
            match stream.write(&buf[self.done..self.target]) {
                Ok(0) => return IoOutcome::Closed,
                Ok(n) => {
                    self.done += n;
                    moved += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if moved > 0 { IoOutcome::Progress(moved) } else { IoOutcome::WouldBlock };
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "socket write failed");
                    return IoOutcome::Closed;
                }
            }
        }
        IoOutcome::Progress(moved)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write as _,
        net::{TcpListener as StdListener, TcpStream as StdStream},
        thread,
        time::Duration,
    };

    use super::*;

    fn pair() -> (TcpStream, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    #[test]
    fn reader_accumulates_across_partial_arrivals() {
        let (mut stream, mut peer) = pair();
        let mut reader = SocketReader::default();
        reader.start(6);
        let mut buf = vec![0u8; 6];

        assert_eq!(reader.process(&mut stream, &mut buf), IoOutcome::WouldBlock);

        peer.write_all(b"abc").unwrap();
        for _ in 0..200 {
            if reader.done > 0 {
                break;
            }
            reader.process(&mut stream, &mut buf);
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!reader.complete());

        peer.write_all(b"def").unwrap();
        for _ in 0..200 {
            if reader.complete() {
                break;
            }
            reader.process(&mut stream, &mut buf);
            thread::sleep(Duration::from_millis(1));
        }
        assert!(reader.complete());
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn reader_reports_peer_close() {
        let (mut stream, peer) = pair();
        drop(peer);

        let mut reader = SocketReader::default();
        reader.start(4);
        let mut buf = vec![0u8; 4];
        let mut outcome = IoOutcome::WouldBlock;
        for _ in 0..200 {
            outcome = reader.process(&mut stream, &mut buf);
            if outcome == IoOutcome::Closed {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(outcome, IoOutcome::Closed);
    }

    #[test]
    fn writer_completes_and_is_idempotent_when_done() {
        let (mut stream, mut peer) = pair();
        let mut writer = SocketWriter::default();
        let data = b"hello";
        writer.start(data.len());

        assert_eq!(writer.process(&mut stream, data), IoOutcome::Progress(5));
        assert!(writer.complete());
        assert_eq!(writer.process(&mut stream, data), IoOutcome::Progress(0));

        let mut got = [0u8; 5];
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        std::io::Read::read_exact(&mut peer, &mut got).unwrap();
        assert_eq!(&got, data);
    }
}
