//! Stream adapter: TCP, and Unix domain sockets on Unix.
//!
//! A [`TcpSocket`] is a cheap handle around shared state. Once it connects
//! (or is accepted), one driver task owns the OS stream and runs a loop:
//!
//! 1. lock the core, frame buffered bytes against the active read, arm and
//!    check deadlines, collect events
//! 2. unlock and dispatch the events to the callback
//! 3. wait for the next of: a wake-up from a handle, inbound bytes, the
//!    active write making progress, or the earliest deadline
//!
//! Listening sockets run an accept loop instead. Each accepted peer becomes
//! its own `TcpSocket` with its own driver, announced to the listener's
//! callback as [`SocketEvent::Accepted`].

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{any_addr, bind_tcp_listener, far_future, validate_port, TransportKind};
use crate::config::SocketConfig;
use crate::engine::{Engine, SocketState, Timeout};
use crate::error::{Result, SocketError};
use crate::event::{Callback, Dispatcher, SocketEvent, Tag};
use crate::framing::{FramingSpec, ReceiveBuffer};
use crate::socket::{Socket, SocketInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Listener,
    Accepted,
}

/// Result of one locked pass over the core.
struct Turn {
    events: Vec<SocketEvent>,
    finished: bool,
    want_read: bool,
    write: Option<Bytes>,
    deadline: Option<Instant>,
}

struct StreamCore {
    engine: Engine,
    buffer: ReceiveBuffer,
    role: Role,
    /// A driver task owns dispatch for this socket.
    driver_attached: bool,
    eof: bool,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    unix_path: Option<String>,
    /// Accepted connections (listeners only).
    clients: Vec<TcpSocket>,
}

impl StreamCore {
    fn new(config: &SocketConfig) -> Self {
        Self {
            engine: Engine::new(config.default_timeout),
            buffer: ReceiveBuffer::with_capacity(config.effective_read_chunk_size()),
            role: Role::Client,
            driver_attached: false,
            eof: false,
            local_addr: None,
            peer_addr: None,
            unix_path: None,
            clients: Vec::new(),
        }
    }

    /// Frame buffered bytes, finish empty writes, arm and check deadlines.
    fn pump(&mut self, now: Instant) {
        self.engine.activate(now);

        while let Some(op) = self.engine.active_read() {
            let Some(frame) = self.buffer.try_extract(&op.body.spec) else {
                break;
            };
            self.engine.complete_read(frame, None);
            self.engine.activate(now);
        }

        while self
            .engine
            .active_write()
            .is_some_and(|op| op.body.is_done())
        {
            self.engine.advance_write(0);
            self.engine.activate(now);
        }

        self.engine.expire(now);
    }

    fn turn(&mut self, now: Instant, max_read_ahead: usize) -> Turn {
        self.pump(now);

        let reading = self.engine.is_servicing()
            && self.engine.state() == SocketState::Connected
            && !self.eof;
        let want_read = reading
            && (self.engine.active_read().is_some() || self.buffer.len() < max_read_ahead);

        Turn {
            events: self.engine.take_events(),
            finished: self.engine.is_terminated(),
            want_read,
            write: self.engine.active_write().map(|op| op.body.remaining()),
            deadline: self.engine.next_deadline(),
        }
    }

    fn on_read(&mut self, result: io::Result<usize>, chunk: &mut BytesMut) {
        match result {
            Ok(0) => self.on_eof(),
            Ok(n) => {
                tracing::trace!("Received {} bytes", n);
                self.buffer.extend(&chunk[..]);
                chunk.clear();
            }
            Err(e) => {
                tracing::error!("Stream read error: {}", e);
                self.engine.terminate(e.into());
            }
        }
    }

    /// Peer closed: a `ToEof` read gets the rest, everything else is cancelled.
    fn on_eof(&mut self) {
        tracing::debug!("Peer closed the stream");
        self.eof = true;

        let wants_rest = self
            .engine
            .active_read()
            .is_some_and(|op| op.body.spec == FramingSpec::ToEof);
        if wants_rest {
            let rest = self.buffer.take_all();
            self.engine.complete_read(rest, None);
        }
        self.engine.terminate(SocketError::ConnectionClosed);
    }

    fn on_write(&mut self, result: io::Result<usize>) {
        match result {
            Ok(0) => {
                let err = io::Error::new(io::ErrorKind::WriteZero, "write returned 0");
                self.engine.terminate(err.into());
            }
            Ok(n) => {
                tracing::trace!("Sent {} bytes", n);
                self.engine.advance_write(n);
            }
            Err(e) => {
                tracing::error!("Stream write error: {}", e);
                self.engine.terminate(e.into());
            }
        }
    }

    fn live_clients(&mut self) -> Vec<TcpSocket> {
        self.clients.retain(|c| !c.is_terminated());
        self.clients.clone()
    }
}

struct Shared {
    core: Mutex<StreamCore>,
    wake: Notify,
    dispatcher: Dispatcher,
    config: SocketConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, StreamCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatch whatever the engine has queued.
    fn flush(&self) {
        let events = self.lock().engine.take_events();
        self.dispatcher.dispatch_all(events);
    }

    /// Drop the callback once `Disconnected` is out. A callback that captured
    /// a handle to its own socket would otherwise keep the socket alive.
    fn release(&self) {
        self.dispatcher.set(None);
    }

    /// Resolves once the socket has been closed or failed.
    async fn terminated(&self) {
        loop {
            let done = self.lock().engine.is_terminated();
            if done {
                return;
            }
            self.wake.notified().await;
        }
    }

    fn shutdown(&self, graceful: bool) {
        let (events, clients, released) = {
            let mut core = self.lock();
            if graceful {
                core.engine.begin_disconnect();
            } else {
                core.engine.terminate(SocketError::ConnectionClosed);
            }
            let clients = if core.engine.is_terminated() {
                std::mem::take(&mut core.clients)
            } else {
                Vec::new()
            };
            let events = if core.driver_attached {
                Vec::new()
            } else {
                core.engine.take_events()
            };
            let released = !core.driver_attached && core.engine.is_terminated();
            (events, clients, released)
        };

        self.wake.notify_one();
        for client in clients {
            if graceful {
                client.close_after_writing();
            } else {
                client.close();
            }
        }
        self.dispatcher.dispatch_all(events);
        if released {
            self.release();
        }
    }
}

/// Closes the socket when the last user handle goes away.
struct Handle {
    shared: Arc<Shared>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.shutdown(false);
    }
}

/// Asynchronous byte-stream socket with tag-annotated, framed reads.
///
/// Cloning yields another handle to the same socket. The socket is closed
/// when [`Socket::close`] is called, when the connection fails, or when the
/// last handle is dropped. A handle captured by the socket's own callback
/// counts, so such a socket lives until it is closed or fails; the callback
/// is dropped right after `Disconnected` is delivered, which breaks the cycle.
/// `connect`, `listen` and their Unix variants must be called from within a
/// tokio runtime.
#[derive(Clone)]
pub struct TcpSocket {
    handle: Arc<Handle>,
}

enum Target {
    Own,
    Clients(Vec<TcpSocket>),
}

impl TcpSocket {
    /// Create an unconnected socket using the process-wide defaults.
    pub fn new() -> Self {
        Self::with_config(SocketConfig::default())
    }

    /// Create an unconnected socket with an explicit configuration.
    pub fn with_config(config: SocketConfig) -> Self {
        Self::build(config, None)
    }

    fn build(config: SocketConfig, callback: Option<Callback>) -> Self {
        let shared = Shared {
            core: Mutex::new(StreamCore::new(&config)),
            wake: Notify::new(),
            dispatcher: Dispatcher::new(callback),
            config,
        };
        Self {
            handle: Arc::new(Handle {
                shared: Arc::new(shared),
            }),
        }
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.handle.shared
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.shared().lock().engine.is_terminated()
    }

    fn claim_for_driver(&self, role: Role) -> Result<()> {
        let mut core = self.shared().lock();
        core.engine.begin_connect()?;
        core.role = role;
        core.driver_attached = true;
        Ok(())
    }

    fn ensure_unconnected(&self) -> Result<()> {
        match self.shared().lock().engine.state() {
            SocketState::Unconnected => Ok(()),
            SocketState::Disconnecting | SocketState::Disconnected => {
                Err(SocketError::ConnectionClosed)
            }
            _ => Err(SocketError::AlreadyConnected),
        }
    }

    /// Start connecting to `host:port`. Emits `Connected`, or `Error` then
    /// `Disconnected`. The socket default timeout also bounds the connect.
    pub fn connect(&self, host: &str, port: u32) -> Result<&Self> {
        let port = validate_port(port)?;
        self.claim_for_driver(Role::Client)?;
        tracing::debug!("Connecting to {}:{}", host, port);

        let shared = self.shared().clone();
        let host = host.to_owned();
        tokio::spawn(async move {
            let label = format!("{}:{}", host, port);
            connect_and_run(shared, label, TcpStream::connect((host.as_str(), port))).await;
        });
        Ok(self)
    }

    /// Connect to a Unix domain socket at `path`.
    #[cfg(unix)]
    pub fn connect_unix(&self, path: impl AsRef<Path>) -> Result<&Self> {
        let path = path.as_ref().to_path_buf();
        self.claim_for_driver(Role::Client)?;
        self.shared().lock().unix_path = Some(path.display().to_string());

        let shared = self.shared().clone();
        tokio::spawn(async move {
            let label = path.display().to_string();
            connect_and_run(shared, label, tokio::net::UnixStream::connect(&path)).await;
        });
        Ok(self)
    }

    /// Listen on `0.0.0.0:port` (0 picks a free port). Binding happens
    /// immediately; bind errors are returned here and leave the socket
    /// unconnected.
    ///
    /// A listener never reads or writes itself, so operations queued before
    /// `listen` fail with `NoClients` right after `Connected`. Accepted
    /// connections start with the listener's callback; replace it from the
    /// `Accepted` handler to route their events elsewhere.
    pub fn listen(&self, port: u32) -> Result<&Self> {
        let port = validate_port(port)?;
        self.ensure_unconnected()?;

        let listener = bind_tcp_listener(any_addr(port), &self.shared().config)?;
        let local = listener.local_addr().ok();
        tracing::debug!("Listening on {:?}", local);

        self.claim_for_driver(Role::Listener)?;
        {
            let mut core = self.shared().lock();
            core.local_addr = local;
            core.engine.mark_connected(true);
            core.engine.cancel_queued(SocketError::NoClients);
        }
        tokio::spawn(run_listener(self.shared().clone(), listener));
        Ok(self)
    }

    /// Listen on a Unix domain socket. A stale socket file at `path` is
    /// replaced, and the file is removed when the listener shuts down.
    #[cfg(unix)]
    pub fn listen_unix(&self, path: impl AsRef<Path>) -> Result<&Self> {
        let path = path.as_ref().to_path_buf();
        self.ensure_unconnected()?;

        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        tracing::debug!("Listening on {}", path.display());

        self.claim_for_driver(Role::Listener)?;
        {
            let mut core = self.shared().lock();
            core.unix_path = Some(path.display().to_string());
            core.engine.mark_connected(true);
            core.engine.cancel_queued(SocketError::NoClients);
        }
        let acceptor = UnixAcceptor { listener, path };
        tokio::spawn(run_listener(self.shared().clone(), acceptor));
        Ok(self)
    }

    /// Stop reading, let queued writes finish, then disconnect.
    pub fn close_after_writing(&self) {
        self.shared().shutdown(true);
    }

    /// Live accepted clients for a listener; otherwise 1 when connected.
    pub fn connections(&self) -> usize {
        let mut core = self.shared().lock();
        match core.role {
            Role::Listener => core.live_clients().len(),
            _ => usize::from(core.engine.state() == SocketState::Connected),
        }
    }

    /// Accepted clients still alive (listeners only).
    pub fn clients(&self) -> Vec<TcpSocket> {
        self.shared().lock().live_clients()
    }

    pub fn is_listening(&self) -> bool {
        let core = self.shared().lock();
        core.role == Role::Listener && !core.engine.is_terminated()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared().lock().local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared().lock().peer_addr
    }

    /// Listeners forward reads and writes to every live client.
    fn target(&self) -> Result<Target> {
        let mut core = self.shared().lock();
        if core.role != Role::Listener {
            return Ok(Target::Own);
        }
        if core.engine.is_terminated() {
            return Err(SocketError::ConnectionClosed);
        }
        Ok(Target::Clients(core.live_clients()))
    }

    fn fan_out(clients: Vec<TcpSocket>, op: impl Fn(&TcpSocket) -> Result<()>) -> Result<()> {
        let delivered = clients.iter().filter(|client| op(client).is_ok()).count();
        if delivered == 0 {
            Err(SocketError::NoClients)
        } else {
            Ok(())
        }
    }
}

impl Default for TcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("TcpSocket");
        // try_lock: Debug may run while the core is held
        if let Ok(core) = self.shared().core.try_lock() {
            s.field("state", &core.engine.state())
                .field("role", &core.role)
                .field("local_addr", &core.local_addr)
                .field("peer_addr", &core.peer_addr);
        }
        s.finish_non_exhaustive()
    }
}

impl Socket for TcpSocket {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn read_with_timeout(
        &self,
        spec: FramingSpec,
        tag: impl Into<Tag>,
        timeout: Timeout,
    ) -> Result<&Self> {
        spec.check_for(TransportKind::Stream)?;
        let tag = tag.into();

        match self.target()? {
            Target::Own => {
                self.shared().lock().engine.enqueue_read(spec, tag, timeout)?;
                self.shared().wake.notify_one();
            }
            Target::Clients(clients) => Self::fan_out(clients, |client| {
                client
                    .read_with_timeout(spec.clone(), tag.clone(), timeout)
                    .map(|_| ())
            })?,
        }
        Ok(self)
    }

    fn write_with_timeout(
        &self,
        payload: impl Into<Bytes>,
        tag: impl Into<Tag>,
        timeout: Timeout,
    ) -> Result<&Self> {
        let payload = payload.into();
        let tag = tag.into();

        match self.target()? {
            Target::Own => {
                self.shared()
                    .lock()
                    .engine
                    .enqueue_write(payload, None, tag, timeout)?;
                self.shared().wake.notify_one();
            }
            Target::Clients(clients) => Self::fan_out(clients, |client| {
                client
                    .write_with_timeout(payload.clone(), tag.clone(), timeout)
                    .map(|_| ())
            })?,
        }
        Ok(self)
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> &Self {
        self.shared().lock().engine.set_default_timeout(timeout);
        self.shared().wake.notify_one();
        self
    }

    fn timeout(&self) -> Option<Duration> {
        self.shared().lock().engine.default_timeout()
    }

    fn set_shared_callback(&self, callback: Option<Callback>) -> &Self {
        self.shared().dispatcher.set(callback);
        self
    }

    fn close(&self) {
        self.shared().shutdown(false);
    }

    fn state(&self) -> SocketState {
        self.shared().lock().engine.state()
    }

    fn info(&self) -> SocketInfo {
        let connections = self.connections();
        let core = self.shared().lock();
        SocketInfo {
            kind: TransportKind::Stream,
            state: core.engine.state(),
            listening: core.role == Role::Listener && !core.engine.is_terminated(),
            local_addr: core.local_addr,
            peer_addr: core.peer_addr,
            unix_path: core.unix_path.clone(),
            default_timeout: core.engine.default_timeout(),
            connections,
            pending_reads: core.engine.pending_reads(),
            pending_writes: core.engine.pending_writes(),
            buffered: core.buffer.len(),
        }
    }
}

/// Await the connect future (bounded by the default timeout), then drive the stream.
async fn connect_and_run<S, F>(shared: Arc<Shared>, label: String, connect: F)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: Future<Output = io::Result<S>> + Send,
{
    let limit = shared.lock().engine.default_timeout();
    let attempt = async {
        let stream = match limit {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| SocketError::TimedOut)??,
            None => connect.await?,
        };
        Ok::<S, SocketError>(stream)
    };

    let result = tokio::select! {
        result = attempt => result,
        _ = shared.terminated() => {
            tracing::debug!("Connect to {} abandoned: socket closed", label);
            shared.flush();
            shared.release();
            return;
        }
    };

    match result {
        Ok(stream) => {
            tracing::debug!("Connected to {}", label);
            shared.lock().engine.mark_connected(true);
            run_stream(shared, stream).await;
        }
        Err(e) => {
            tracing::debug!("Connect to {} failed: {}", label, e);
            shared.lock().engine.fail(e);
            shared.flush();
            shared.release();
        }
    }
}

/// Driver loop for one connected stream.
async fn run_stream<S>(shared: Arc<Shared>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let chunk_size = shared.config.effective_read_chunk_size();
    let max_read_ahead = shared.config.max_read_ahead;
    let mut chunk = BytesMut::with_capacity(chunk_size);

    loop {
        let turn = shared.lock().turn(Instant::now(), max_read_ahead);
        shared.dispatcher.dispatch_all(turn.events);
        if turn.finished {
            break;
        }

        if chunk.capacity() < chunk_size {
            chunk.reserve(chunk_size);
        }
        let pending = turn.write.clone().unwrap_or_default();
        let deadline = turn.deadline.unwrap_or_else(far_future);

        tokio::select! {
            _ = shared.wake.notified() => {}
            result = reader.read_buf(&mut chunk), if turn.want_read => {
                shared.lock().on_read(result, &mut chunk);
            }
            result = writer.write(&pending), if turn.write.is_some() => {
                shared.lock().on_write(result);
            }
            _ = tokio::time::sleep_until(deadline), if turn.deadline.is_some() => {}
        }
    }

    shared.release();
    let _ = writer.shutdown().await;
    tracing::debug!("Stream driver finished");
}

/// A freshly accepted connection.
struct Incoming<S> {
    stream: S,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

trait Acceptor: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn accept_stream(&self) -> impl Future<Output = io::Result<Incoming<Self::Stream>>> + Send;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept_stream(&self) -> io::Result<Incoming<TcpStream>> {
        let (stream, peer) = self.accept().await?;
        let local = stream.local_addr().ok();
        Ok(Incoming {
            stream,
            peer: Some(peer),
            local,
        })
    }
}

/// Unix listener that removes its socket file on drop.
#[cfg(unix)]
struct UnixAcceptor {
    listener: tokio::net::UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
impl Acceptor for UnixAcceptor {
    type Stream = tokio::net::UnixStream;

    async fn accept_stream(&self) -> io::Result<Incoming<tokio::net::UnixStream>> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(Incoming {
            stream,
            peer: None,
            local: None,
        })
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Wrap an accepted stream in a new socket that inherits the listener's
/// callback and default timeout. The caller starts its driver.
fn adopt_accepted<S>(parent: &Shared, incoming: Incoming<S>) -> (TcpSocket, S)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (timeout, listen_addr, unix_path) = {
        let core = parent.lock();
        (
            core.engine.default_timeout(),
            core.local_addr,
            core.unix_path.clone(),
        )
    };
    let config = parent.config.clone().with_timeout(timeout);
    let socket = TcpSocket::build(config, parent.dispatcher.current());
    {
        let mut core = socket.shared().lock();
        core.role = Role::Accepted;
        core.peer_addr = incoming.peer;
        core.local_addr = incoming.local.or(listen_addr);
        core.unix_path = unix_path;
        core.driver_attached = true;
        core.engine.mark_connected(false);
    }
    (socket, incoming.stream)
}

/// Accept loop for a listening socket.
///
/// A child's driver starts only after its `Accepted` event has been
/// dispatched, so the listener's callback sees `Accepted` before any event
/// of that child and can swap the child's callback first.
async fn run_listener<A: Acceptor>(shared: Arc<Shared>, acceptor: A) {
    let mut starting: Vec<(Arc<Shared>, A::Stream)> = Vec::new();
    loop {
        let (events, finished) = {
            let mut core = shared.lock();
            (core.engine.take_events(), core.engine.is_terminated())
        };
        shared.dispatcher.dispatch_all(events);
        for (child, stream) in starting.drain(..) {
            tokio::spawn(run_stream(child, stream));
        }
        if finished {
            break;
        }

        tokio::select! {
            _ = shared.wake.notified() => {}
            result = acceptor.accept_stream() => match result {
                Ok(incoming) => {
                    tracing::debug!("Accepted connection from {:?}", incoming.peer);
                    let peer = incoming.peer;
                    let (child, stream) = adopt_accepted(&shared, incoming);
                    starting.push((child.shared().clone(), stream));

                    let orphaned = {
                        let mut core = shared.lock();
                        if core.engine.is_terminated() {
                            true
                        } else {
                            core.clients.retain(|c| !c.is_terminated());
                            core.clients.push(child.clone());
                            core.engine.push_event(SocketEvent::Accepted {
                                socket: child.clone(),
                                peer,
                            });
                            false
                        }
                    };
                    if orphaned {
                        child.close();
                    }
                }
                Err(e) if is_transient_accept_error(&e) => {
                    tracing::debug!("Transient accept error: {}", e);
                }
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    shared.lock().engine.terminate(e.into());
                }
            },
        }
    }
    shared.release();
    tracing::debug!("Listener finished");
}
