//! Accepted client connection.
//!
//! Holds the non-blocking socket and its receive buffer. The server's session
//! table owns each connection; the session computation only borrows it through
//! an `Rc`, so the socket is closed exactly once, when the table drops it.

use crate::protocol::{DecodeResult, FrameHeader};
use crate::runtime::buffer::RecvBuffer;
use mio::net::TcpStream;
use std::cell::RefCell;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    recv: RefCell<RecvBuffer>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, recv_capacity: usize) -> Self {
        Self {
            stream,
            peer,
            recv: RefCell::new(RecvBuffer::with_capacity(recv_capacity)),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Bytes buffered for the frame currently being received.
    pub fn buffered(&self) -> usize {
        self.recv.borrow().len()
    }

    /// One non-blocking read of at most `up_to` bytes into the receive buffer.
    pub fn fill(&self, up_to: usize) -> io::Result<usize> {
        self.recv.borrow_mut().fill_from(&mut &self.stream, up_to)
    }

    /// One non-blocking write.
    pub fn send(&self, data: &[u8]) -> io::Result<usize> {
        (&self.stream).write(data)
    }

    pub fn parse_header(&self) -> Option<FrameHeader> {
        self.recv.borrow_mut().parse_header()
    }

    pub fn take_frame(&self, max_frame_size: usize) -> DecodeResult {
        self.recv.borrow_mut().take_frame(max_frame_size)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd())
            .field("peer", &self.peer)
            .field("buffered", &self.buffered())
            .finish()
    }
}
