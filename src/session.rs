//! Per-connection protocol loop.
//!
//! A session repeatedly reads one frame, passes it to the handler and writes
//! the response back, suspending on socket readiness whenever the socket
//! would block. It never closes its own socket: the server's reaper owns
//! teardown once the session's task has completed.

use crate::handler::Handler;
use crate::protocol::{encode_frame, DecodeResult, Frame, ProtocolError, HEADER_LEN};
use crate::runtime::{Connection, Runtime, TaskError, Wakeup};
use bytes::Bytes;
use std::fmt;
use std::io;
use std::rc::Rc;
use tracing::{debug, trace};

/// Result of a framed read that did not fail.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// The peer closed its side before a complete frame arrived.
    PeerClosed,
    /// The wait for readiness was cancelled or the runtime shut down.
    Stopped(Wakeup),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Flushed,
    Stopped(Wakeup),
}

/// Errors that end a session.
#[derive(Debug)]
pub enum SessionError {
    Io(io::Error),
    Protocol(ProtocolError),
    Task(TaskError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "I/O error: {}", e),
            SessionError::Protocol(e) => write!(f, "protocol error: {}", e),
            SessionError::Task(e) => write!(f, "task error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(e) => Some(e),
            SessionError::Protocol(e) => Some(e),
            SessionError::Task(e) => Some(e),
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

impl From<TaskError> for SessionError {
    fn from(e: TaskError) -> Self {
        SessionError::Task(e)
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    PeerClosed,
    Stopped(Wakeup),
    Failed(SessionError),
}

enum Filled {
    Done,
    PeerClosed,
    Stopped(Wakeup),
}

/// Read until `target` bytes are buffered, never reading past it.
async fn fill_to(rt: &Runtime, conn: &Connection, target: usize) -> Result<Filled, SessionError> {
    loop {
        let buffered = conn.buffered();
        if buffered >= target {
            return Ok(Filled::Done);
        }
        let res = conn.fill(target - buffered);
        match res {
            Ok(0) => return Ok(Filled::PeerClosed),
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(fd = conn.fd(), "waiting for read readiness");
                match rt.readable(conn.fd()).await {
                    Wakeup::Ready => {}
                    stop => return Ok(Filled::Stopped(stop)),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Read one complete frame: the header first, then exactly the payload
/// length it declares. An oversized declaration fails before any payload
/// byte is read.
pub async fn read_frame(
    rt: Runtime,
    conn: Rc<Connection>,
    max_frame_size: usize,
) -> Result<ReadOutcome, SessionError> {
    match fill_to(&rt, &conn, HEADER_LEN).await? {
        Filled::Done => {}
        Filled::PeerClosed => return Ok(ReadOutcome::PeerClosed),
        Filled::Stopped(wakeup) => return Ok(ReadOutcome::Stopped(wakeup)),
    }

    let header = conn
        .parse_header()
        .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
    let payload_len = header.payload_len(max_frame_size)?;

    match fill_to(&rt, &conn, HEADER_LEN + payload_len).await? {
        Filled::Done => {}
        Filled::PeerClosed => return Ok(ReadOutcome::PeerClosed),
        Filled::Stopped(wakeup) => return Ok(ReadOutcome::Stopped(wakeup)),
    }

    match conn.take_frame(max_frame_size) {
        DecodeResult::Complete(frame, _) => Ok(ReadOutcome::Frame(frame)),
        DecodeResult::Incomplete => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
        DecodeResult::Error(e) => Err(e.into()),
    }
}

/// Write all of `data`, suspending while the socket would block.
pub async fn write_frame(
    rt: Runtime,
    conn: Rc<Connection>,
    data: Bytes,
) -> Result<WriteOutcome, SessionError> {
    let mut written = 0;
    while written < data.len() {
        let res = conn.send(&data[written..]);
        match res {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(fd = conn.fd(), written, "waiting for write readiness");
                match rt.writable(conn.fd()).await {
                    Wakeup::Ready => {}
                    stop => return Ok(WriteOutcome::Stopped(stop)),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(WriteOutcome::Flushed)
}

/// Serve one connection until the peer closes, the runtime stops it, or an
/// error occurs.
pub async fn run_session(
    rt: Runtime,
    conn: Rc<Connection>,
    handler: Rc<dyn Handler>,
    max_frame_size: usize,
) -> SessionEnd {
    match serve(&rt, &conn, handler.as_ref(), max_frame_size).await {
        Ok(end) => end,
        Err(e) => SessionEnd::Failed(e),
    }
}

async fn serve(
    rt: &Runtime,
    conn: &Rc<Connection>,
    handler: &dyn Handler,
    max_frame_size: usize,
) -> Result<SessionEnd, SessionError> {
    loop {
        let read = rt.spawn(read_frame(rt.clone(), Rc::clone(conn), max_frame_size));
        let frame = match read.await?? {
            ReadOutcome::Frame(frame) => frame,
            ReadOutcome::PeerClosed => return Ok(SessionEnd::PeerClosed),
            ReadOutcome::Stopped(wakeup) => return Ok(SessionEnd::Stopped(wakeup)),
        };

        let header = frame.header;
        debug!(
            fd = conn.fd(),
            msg_id = header.msg_id,
            msg_type = ?header.msg_type,
            len = header.data_len,
            "frame received"
        );

        let response = handler.handle(header.msg_type, &frame.payload);
        let encoded = encode_frame(header.msg_id, header.msg_type, &response)?;

        let write = rt.spawn(write_frame(rt.clone(), Rc::clone(conn), encoded));
        match write.await?? {
            WriteOutcome::Flushed => {
                debug!(fd = conn.fd(), msg_id = header.msg_id, len = response.len(), "response sent");
            }
            WriteOutcome::Stopped(wakeup) => return Ok(SessionEnd::Stopped(wakeup)),
        }
    }
}
