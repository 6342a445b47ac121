//! Frame server.
//!
//! Owns the listening socket, the runtime and the session table. The accept
//! loop runs as a task that drains pending connections and then waits for
//! the listener to become readable again. Each accepted connection gets a
//! session task. The server loop alternates between a runtime tick and a
//! reaping pass; reaping is the only place a connection is deregistered and
//! closed.

use crate::config::ServerConfig;
use crate::handler::Handler;
use crate::runtime::{Connection, Runtime, Task, TaskError, Wakeup};
use crate::session::{run_session, SessionEnd, SessionError};
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use tracing::{debug, error, info, warn};

/// Initial receive buffer capacity; it grows up to one full frame.
const RECV_CAPACITY: usize = 4096;

/// Listener setup step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    Address,
    Socket,
    NonBlocking,
    ReuseAddr,
    NoDelay,
    Bind,
    Listen,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::Address => "address",
            SetupStage::Socket => "socket",
            SetupStage::NonBlocking => "nonblocking",
            SetupStage::ReuseAddr => "reuseaddr",
            SetupStage::NoDelay => "nodelay",
            SetupStage::Bind => "bind",
            SetupStage::Listen => "listen",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum ServerError {
    Setup { stage: SetupStage, source: io::Error },
    Runtime(io::Error),
    Task(TaskError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Setup { stage, source } => {
                write!(f, "listener setup failed at {}: {}", stage, source)
            }
            ServerError::Runtime(e) => write!(f, "runtime error: {}", e),
            ServerError::Task(e) => write!(f, "server task failed: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Setup { source, .. } => Some(source),
            ServerError::Runtime(e) => Some(e),
            ServerError::Task(e) => Some(e),
        }
    }
}

fn at(stage: SetupStage) -> impl FnOnce(io::Error) -> ServerError {
    move |source| ServerError::Setup { stage, source }
}

struct Session {
    conn: Rc<Connection>,
    task: Task<SessionEnd>,
}

/// State shared between the server loop and the accept task.
struct ServerState {
    running: Cell<bool>,
    sessions: RefCell<HashMap<RawFd, Session>>,
    handler: Rc<dyn Handler>,
    max_frame_size: usize,
    max_sessions: usize,
}

impl ServerState {
    fn admit(&self, rt: &Runtime, stream: TcpStream, peer: SocketAddr) {
        let active = self.sessions.borrow().len();
        if active >= self.max_sessions {
            warn!(peer = %peer, max_sessions = self.max_sessions, "Connection limit reached, closing");
            return;
        }

        let conn = Rc::new(Connection::new(stream, peer, RECV_CAPACITY));
        let fd = conn.fd();
        info!(fd, peer = %peer, "Accepted connection");

        let task = rt.spawn(run_session(
            rt.clone(),
            Rc::clone(&conn),
            Rc::clone(&self.handler),
            self.max_frame_size,
        ));
        self.sessions.borrow_mut().insert(fd, Session { conn, task });
    }
}

async fn accept_loop(rt: Runtime, listener: Rc<TcpListener>, state: Rc<ServerState>) {
    let fd = listener.as_raw_fd();
    loop {
        if !state.running.get() {
            break;
        }
        drain_accepts(&rt, &listener, &state);

        match rt.readable(fd).await {
            Wakeup::Ready => {}
            wakeup => {
                debug!(?wakeup, "Accept loop stopping");
                break;
            }
        }
    }
}

/// Accept until the listener would block.
fn drain_accepts(rt: &Runtime, listener: &TcpListener, state: &ServerState) {
    loop {
        let res = listener.accept();
        match res {
            Ok((stream, peer)) => state.admit(rt, stream, peer),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) =>
            {
                continue
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                break;
            }
        }
    }
}

fn create_listener(config: &ServerConfig) -> Result<std::net::TcpListener, ServerError> {
    let addr = config
        .listen_addr()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
        .map_err(at(SetupStage::Address))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(at(SetupStage::Socket))?;
    socket
        .set_nonblocking(true)
        .map_err(at(SetupStage::NonBlocking))?;
    socket
        .set_reuse_address(true)
        .map_err(at(SetupStage::ReuseAddr))?;
    socket.set_nodelay(true).map_err(at(SetupStage::NoDelay))?;
    socket.bind(&addr.into()).map_err(at(SetupStage::Bind))?;
    socket
        .listen(config.backlog)
        .map_err(at(SetupStage::Listen))?;

    Ok(socket.into())
}

pub struct Server {
    runtime: Runtime,
    listener: Option<Rc<TcpListener>>,
    local_addr: SocketAddr,
    state: Rc<ServerState>,
    accept_task: Option<Task<()>>,
    stopped: bool,
}

impl Server {
    /// Create the listening socket and start accepting.
    pub fn bind(config: &ServerConfig, handler: Rc<dyn Handler>) -> Result<Self, ServerError> {
        let runtime = Runtime::new(config.poll_interval).map_err(ServerError::Runtime)?;

        let setup = {
            let config = config.clone();
            runtime.spawn(async move { create_listener(&config) })
        };
        let listener = runtime.block_on(setup).map_err(ServerError::Task)??;
        let listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr().map_err(ServerError::Runtime)?;
        let listener = Rc::new(listener);

        let state = Rc::new(ServerState {
            running: Cell::new(true),
            sessions: RefCell::new(HashMap::new()),
            handler,
            max_frame_size: config.max_frame_size,
            max_sessions: config.max_sessions,
        });

        let accept_task = runtime.spawn(accept_loop(
            runtime.clone(),
            Rc::clone(&listener),
            Rc::clone(&state),
        ));

        info!(
            addr = %local_addr,
            backlog = config.backlog,
            max_frame_size = config.max_frame_size,
            max_sessions = config.max_sessions,
            "Server listening"
        );

        Ok(Self {
            runtime,
            listener: Some(listener),
            local_addr,
            state,
            accept_task: Some(accept_task),
            stopped: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sessions currently in the table, finished or not.
    pub fn session_count(&self) -> usize {
        self.state.sessions.borrow().len()
    }

    /// One tick followed by a reaping pass. Returns the number of sessions reaped.
    pub fn turn(&mut self) -> usize {
        let extra = self.listener.as_ref().map(|l| l.as_raw_fd());
        self.runtime.tick(extra);
        self.reap()
    }

    /// Serve until `should_stop` returns true, then stop.
    pub fn run_until<F>(&mut self, mut should_stop: F) -> Result<(), ServerError>
    where
        F: FnMut() -> bool,
    {
        while self.state.running.get() && !should_stop() {
            self.turn();
            if self.accept_task.as_ref().map_or(true, |task| task.is_done()) {
                warn!("Accept loop exited");
                break;
            }
        }
        self.stop()
    }

    /// Tear down every finished session.
    fn reap(&mut self) -> usize {
        let finished: Vec<RawFd> = self
            .state
            .sessions
            .borrow()
            .iter()
            .filter(|(_, session)| session.task.is_done())
            .map(|(fd, _)| *fd)
            .collect();

        for &fd in &finished {
            let session = self.state.sessions.borrow_mut().remove(&fd);
            if let Some(session) = session {
                self.teardown(fd, session);
            }
        }
        finished.len()
    }

    /// Drop the session task, deregister the fd, then close the socket.
    fn teardown(&self, fd: RawFd, session: Session) {
        let Session { conn, mut task } = session;
        let peer = conn.peer();
        let end = task.try_take();
        drop(task);
        self.runtime.cancel(fd);

        match end {
            Some(Ok(SessionEnd::PeerClosed)) => debug!(fd, peer = %peer, "Connection closed by peer"),
            Some(Ok(SessionEnd::Stopped(wakeup))) => {
                info!(fd, peer = %peer, ?wakeup, "Session stopped")
            }
            Some(Ok(SessionEnd::Failed(SessionError::Protocol(e)))) => {
                warn!(fd, peer = %peer, error = %e, "Protocol error, closing connection")
            }
            Some(Ok(SessionEnd::Failed(e))) => {
                warn!(fd, peer = %peer, error = %e, "Connection error")
            }
            Some(Err(e)) => error!(fd, peer = %peer, error = %e, "Session task failed"),
            None => debug!(fd, peer = %peer, "Session abandoned"),
        }
        drop(conn);
    }

    /// Stop accepting, wake every suspended task with the shutdown outcome and
    /// close all connections. Calling it again does nothing.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.state.running.set(false);

        let woken = self.runtime.shutdown();
        let accept_result = self.accept_task.take().and_then(|mut task| task.try_take());

        let sessions: Vec<(RawFd, Session)> = self.state.sessions.borrow_mut().drain().collect();
        let closed = sessions.len();
        for (fd, session) in sessions {
            self.teardown(fd, session);
        }

        if let Some(listener) = self.listener.take() {
            self.runtime.cancel(listener.as_raw_fd());
        }

        let leftover = self.runtime.scheduler().len();
        if !self.runtime.scheduler().is_empty() {
            warn!(tasks = leftover, "Tasks still pending after stop");
        }
        let queries = self.runtime.selector().borrow().queries();
        info!(sessions = closed, woken, queries, "Server stopped");
        match accept_result {
            Some(Err(e)) => Err(ServerError::Task(e)),
            _ => Ok(()),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "Error while stopping server");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ConfirmHandler;
    use crate::protocol::{encode_frame, FrameHeader, MsgType, HEADER_LEN};
    use std::io::{Read, Write};
    use std::net::TcpStream as StdStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn test_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        }
    }

    struct Running {
        addr: SocketAddr,
        stop: Arc<AtomicBool>,
        handle: thread::JoinHandle<Result<(), String>>,
    }

    impl Running {
        fn connect(&self) -> StdStream {
            let stream = StdStream::connect(self.addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            stream
        }

        fn shutdown(self) {
            self.stop.store(true, Ordering::SeqCst);
            self.handle.join().unwrap().unwrap();
        }
    }

    fn start(config: ServerConfig) -> Running {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let mut server = Server::bind(&config, Rc::new(ConfirmHandler::new())).unwrap();
            tx.send(server.local_addr()).unwrap();
            server
                .run_until(|| flag.load(Ordering::SeqCst))
                .map_err(|e| e.to_string())
        });
        Running {
            addr: rx.recv().unwrap(),
            stop,
            handle,
        }
    }

    fn read_response(stream: &mut StdStream) -> (FrameHeader, Vec<u8>) {
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).unwrap();
        let header = FrameHeader::decode(&header).unwrap();
        let mut payload = vec![0u8; header.data_len as usize];
        stream.read_exact(&mut payload).unwrap();
        (header, payload)
    }

    fn closed_by_server(stream: &mut StdStream) -> bool {
        let mut buf = [0u8; 16];
        match stream.read(&mut buf) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => e.kind() == io::ErrorKind::ConnectionReset,
        }
    }

    #[test]
    fn test_single_request() {
        let server = start(test_config());
        let mut client = server.connect();

        client.write_all(&encode_frame(7, MsgType::Req, b"x").unwrap()).unwrap();
        let (header, payload) = read_response(&mut client);
        assert_eq!(header.msg_id, 7);
        assert_eq!(header.msg_type, MsgType::Req);
        assert_eq!(payload[0], 1);
        assert_eq!(
            &payload[1..],
            b"receive request, reqMsg: x, the request num is: 1"
        );

        server.shutdown();
    }

    #[test]
    fn test_sessions_do_not_share_buffers() {
        let server = start(test_config());
        let mut a = server.connect();
        let mut b = server.connect();

        let frame_a = encode_frame(1, MsgType::Msg, b"from-a").unwrap();
        let frame_b = encode_frame(2, MsgType::Msg, b"from-b").unwrap();

        // A stalls halfway through its header while B completes a request.
        a.write_all(&frame_a[..6]).unwrap();
        b.write_all(&frame_b).unwrap();
        let (header, payload) = read_response(&mut b);
        assert_eq!(header.msg_id, 2);
        assert_eq!(&payload[1..], b"receive msg, msg: from-b, and its confirm response");

        a.write_all(&frame_a[6..]).unwrap();
        let (header, payload) = read_response(&mut a);
        assert_eq!(header.msg_id, 1);
        assert_eq!(&payload[1..], b"receive msg, msg: from-a, and its confirm response");

        server.shutdown();
    }

    #[test]
    fn test_many_clients() {
        let server = start(test_config());
        let mut clients: Vec<StdStream> = (0..8).map(|_| server.connect()).collect();

        for (i, client) in clients.iter_mut().enumerate() {
            let body = format!("client-{}", i);
            client
                .write_all(&encode_frame(i as u32, MsgType::Msg, body.as_bytes()).unwrap())
                .unwrap();
        }
        for (i, client) in clients.iter_mut().enumerate() {
            let (header, payload) = read_response(client);
            assert_eq!(header.msg_id, i as u32);
            let expected = format!("receive msg, msg: client-{}, and its confirm response", i);
            assert_eq!(&payload[1..], expected.as_bytes());
        }

        server.shutdown();
    }

    #[test]
    fn test_unknown_type_is_echoed() {
        let server = start(test_config());
        let mut client = server.connect();

        let mut raw = encode_frame(5, MsgType::Req, b"?").unwrap().to_vec();
        raw[4..8].copy_from_slice(&42u32.to_ne_bytes());
        client.write_all(&raw).unwrap();

        let (header, payload) = read_response(&mut client);
        assert_eq!(header.msg_id, 5);
        assert_eq!(header.msg_type, MsgType::Unknown);
        assert_eq!(payload[0], 0);

        server.shutdown();
    }

    #[test]
    fn test_oversized_frame_closes_connection() {
        let mut config = test_config();
        config.max_frame_size = 16;
        let server = start(config);
        let mut client = server.connect();

        let mut raw = Vec::new();
        raw.extend_from_slice(&9u32.to_ne_bytes());
        raw.extend_from_slice(&MsgType::Req.as_raw().to_ne_bytes());
        raw.extend_from_slice(&17u32.to_ne_bytes());
        client.write_all(&raw).unwrap();

        assert!(closed_by_server(&mut client));
        server.shutdown();
    }

    #[test]
    fn test_session_limit() {
        let mut config = test_config();
        config.max_sessions = 1;
        let server = start(config);

        let mut first = server.connect();
        first.write_all(&encode_frame(1, MsgType::Msg, b"a").unwrap()).unwrap();
        read_response(&mut first);

        let mut second = server.connect();
        assert!(closed_by_server(&mut second));

        first.write_all(&encode_frame(2, MsgType::Msg, b"b").unwrap()).unwrap();
        let (header, _) = read_response(&mut first);
        assert_eq!(header.msg_id, 2);

        server.shutdown();
    }

    #[test]
    fn test_stop_closes_open_sessions() {
        let server = start(test_config());
        let mut client = server.connect();
        client.write_all(&encode_frame(1, MsgType::Msg, b"hi").unwrap()).unwrap();
        read_response(&mut client);

        server.shutdown();
        assert!(closed_by_server(&mut client));
    }

    #[test]
    fn test_reaper_removes_closed_sessions() {
        let mut server = Server::bind(&test_config(), Rc::new(ConfirmHandler::new())).unwrap();
        let client = StdStream::connect(server.local_addr()).unwrap();

        for _ in 0..500 {
            if server.session_count() == 1 {
                break;
            }
            server.turn();
        }
        assert_eq!(server.session_count(), 1);

        drop(client);
        let mut reaped = 0;
        for _ in 0..500 {
            reaped += server.turn();
            if server.session_count() == 0 {
                break;
            }
        }
        assert_eq!(reaped, 1);
        assert_eq!(server.session_count(), 0);

        server.stop().unwrap();
        server.stop().unwrap();
    }

    #[test]
    fn test_peer_close_mid_header_is_not_logged_as_error() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let path = std::env::temp_dir().join(format!("coop-frame-peer-close-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let sink = crate::logging::init(&crate::config::LoggingConfig {
            level: "debug".to_string(),
            file: Some(path.clone()),
            ..crate::config::LoggingConfig::default()
        });

        let mut server = Server::bind(&test_config(), Rc::new(ConfirmHandler::new())).unwrap();
        let mut client = StdStream::connect(server.local_addr()).unwrap();
        client.write_all(&[1, 0, 0, 0, 2]).unwrap();
        drop(client);

        let mut reaped = 0;
        for _ in 0..500 {
            reaped += server.turn();
            if reaped == 1 {
                break;
            }
        }
        assert_eq!(reaped, 1);
        server.stop().unwrap();
        drop(server);
        sink.shutdown();

        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(contents.contains("Connection closed by peer"), "{}", contents);
        for line in contents.lines() {
            assert!(!line.contains("WARN") && !line.contains("ERROR"), "{}", line);
        }
    }

    #[test]
    fn test_bind_errors_name_the_stage() {
        let first = Server::bind(&test_config(), Rc::new(ConfirmHandler::new())).unwrap();

        let mut taken = test_config();
        taken.port = first.local_addr().port();
        match Server::bind(&taken, Rc::new(ConfirmHandler::new())) {
            Err(ServerError::Setup { stage, .. }) => assert_eq!(stage, SetupStage::Bind),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("second bind succeeded"),
        }

        let mut bogus = test_config();
        bogus.host = "not-an-address".to_string();
        match Server::bind(&bogus, Rc::new(ConfirmHandler::new())) {
            Err(ServerError::Setup { stage, .. }) => assert_eq!(stage, SetupStage::Address),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("bind succeeded"),
        }
    }
}
