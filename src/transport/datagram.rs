//! Datagram adapter: UDP.
//!
//! Every packet is a whole frame; only `OneMessage` reads are accepted.
//! Each write carries its own destination, or falls back to the peer set
//! by [`UdpSocket::connect`]. Packets that arrive with no active read go to
//! continuous-receive mode, then to the optional backlog, and are dropped
//! otherwise.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{any_addr, bind_udp_socket, far_future, resolve, validate_port, TransportKind};
use crate::config::SocketConfig;
use crate::engine::{Engine, SocketState, Timeout};
use crate::error::{Result, SocketError};
use crate::event::{Callback, Dispatcher, SocketEvent, Tag};
use crate::framing::FramingSpec;
use crate::socket::{Socket, SocketInfo};

struct Turn {
    events: Vec<SocketEvent>,
    finished: bool,
    want_recv: bool,
    /// Remaining payload and explicit destination of the active write.
    write: Option<(Bytes, Option<SocketAddr>)>,
    deadline: Option<Instant>,
}

struct UdpCore {
    engine: Engine,
    backlog: VecDeque<(Bytes, SocketAddr)>,
    /// Tag for continuous-receive mode, when enabled.
    continuous: Option<Tag>,
    socket: Option<Arc<tokio::net::UdpSocket>>,
    local_addr: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    connect_pending: bool,
    broadcast: bool,
    driver_attached: bool,
}

impl UdpCore {
    fn new(config: &SocketConfig) -> Self {
        Self {
            engine: Engine::new(config.default_timeout),
            backlog: VecDeque::new(),
            continuous: None,
            socket: None,
            local_addr: None,
            peer: None,
            connect_pending: false,
            broadcast: config.broadcast,
            driver_attached: false,
        }
    }

    fn pump(&mut self, now: Instant) {
        self.engine.activate(now);

        while self.engine.active_read().is_some() {
            let Some((packet, from)) = self.backlog.pop_front() else {
                break;
            };
            self.engine.complete_read(packet, Some(from));
            self.engine.activate(now);
        }

        if let Some(tag) = &self.continuous {
            if self.engine.active_read().is_none() {
                for (packet, from) in self.backlog.drain(..) {
                    self.engine
                        .push_event(SocketEvent::data(packet, tag.clone(), Some(from)));
                }
            }
        }

        self.engine.expire(now);
    }

    fn turn(&mut self, now: Instant) -> Turn {
        self.pump(now);

        let peer = self.peer;
        let write = self.engine.active_write().and_then(|op| {
            match (op.body.destination, peer) {
                (Some(dest), _) => Some((op.body.remaining(), Some(dest))),
                (None, Some(_)) => Some((op.body.remaining(), None)),
                // connect still resolving
                (None, None) => None,
            }
        });

        Turn {
            events: self.engine.take_events(),
            finished: self.engine.is_terminated(),
            want_recv: self.engine.is_servicing() && self.engine.state() == SocketState::Connected,
            write,
            deadline: self.engine.next_deadline(),
        }
    }

    fn on_packet(&mut self, result: io::Result<(usize, SocketAddr)>, buf: &[u8], backlog_cap: usize) {
        match result {
            Ok((n, from)) => {
                let packet = Bytes::copy_from_slice(&buf[..n]);
                if self.engine.active_read().is_some() {
                    self.engine.complete_read(packet, Some(from));
                } else if let Some(tag) = &self.continuous {
                    self.engine
                        .push_event(SocketEvent::data(packet, tag.clone(), Some(from)));
                } else if self.backlog.len() < backlog_cap {
                    self.backlog.push_back((packet, from));
                } else {
                    tracing::trace!("Dropping {} byte datagram from {}: no active read", n, from);
                }
            }
            // ICMP feedback from an earlier send; the socket itself is fine
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
            ) =>
            {
                tracing::warn!("Datagram receive error: {}", e);
                self.engine.push_event(SocketEvent::Error {
                    reason: e.into(),
                    tag: None,
                });
            }
            Err(e) => {
                tracing::error!("Datagram receive failed: {}", e);
                self.engine.terminate(e.into());
            }
        }
    }

    fn on_sent(&mut self, result: io::Result<usize>, len: usize) {
        match result {
            Ok(n) => {
                if n < len {
                    tracing::warn!("Datagram truncated: sent {} of {} bytes", n, len);
                }
                self.engine.advance_write(len);
            }
            Err(e) => {
                tracing::error!("Datagram send failed: {}", e);
                self.engine.terminate(e.into());
            }
        }
    }
}

struct UdpShared {
    core: Mutex<UdpCore>,
    wake: Notify,
    dispatcher: Dispatcher,
    config: SocketConfig,
}

impl UdpShared {
    fn lock(&self) -> MutexGuard<'_, UdpCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shutdown(&self, graceful: bool) {
        let (events, released) = {
            let mut core = self.lock();
            if graceful {
                core.engine.begin_disconnect();
            } else {
                core.engine.terminate(SocketError::ConnectionClosed);
            }
            if core.engine.is_terminated() {
                core.socket = None;
                core.backlog.clear();
                core.continuous = None;
            }
            if core.driver_attached {
                (Vec::new(), false)
            } else {
                (core.engine.take_events(), core.engine.is_terminated())
            }
        };
        self.wake.notify_one();
        self.dispatcher.dispatch_all(events);
        if released {
            self.release();
        }
    }

    /// Drop the callback after `Disconnected`, breaking any cycle through a
    /// handle it captured.
    fn release(&self) {
        self.dispatcher.set(None);
    }
}

struct Handle {
    shared: Arc<UdpShared>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.shutdown(false);
    }
}

/// Asynchronous UDP socket with tag-annotated reads and writes.
///
/// Binding (explicit, or implicit on the first write) must happen from
/// within a tokio runtime. The socket closes when the last handle is
/// dropped; a handle held by its own callback keeps it open until it is
/// closed or fails, after which the callback is dropped.
#[derive(Clone)]
pub struct UdpSocket {
    handle: Arc<Handle>,
}

impl UdpSocket {
    pub fn new() -> Self {
        Self::with_config(SocketConfig::default())
    }

    pub fn with_config(config: SocketConfig) -> Self {
        let shared = UdpShared {
            core: Mutex::new(UdpCore::new(&config)),
            wake: Notify::new(),
            dispatcher: Dispatcher::default(),
            config,
        };
        Self {
            handle: Arc::new(Handle {
                shared: Arc::new(shared),
            }),
        }
    }

    fn shared(&self) -> &Arc<UdpShared> {
        &self.handle.shared
    }

    /// Bind to `0.0.0.0:port` (0 picks a free port) and start receiving.
    /// Emits `Connected`.
    pub fn bind(&self, port: u32) -> Result<&Self> {
        let port = validate_port(port)?;
        self.bind_addr(any_addr(port))?;
        Ok(self)
    }

    /// Same as [`UdpSocket::bind`].
    pub fn listen(&self, port: u32) -> Result<&Self> {
        self.bind(port)
    }

    fn bind_addr(&self, addr: SocketAddr) -> Result<()> {
        let broadcast = {
            let core = self.shared().lock();
            if core.engine.is_terminated() {
                return Err(SocketError::ConnectionClosed);
            }
            if core.socket.is_some() || core.engine.state() != SocketState::Unconnected {
                return Err(SocketError::AlreadyConnected);
            }
            core.broadcast
        };

        let config = self.shared().config.clone().with_broadcast(broadcast);
        let socket = Arc::new(bind_udp_socket(addr, &config)?);
        let local = socket.local_addr().ok();

        {
            let mut core = self.shared().lock();
            core.engine.begin_connect()?;
            core.engine.mark_connected(true);
            core.socket = Some(socket.clone());
            core.local_addr = local;
            core.driver_attached = true;
        }
        tracing::debug!("Datagram socket bound to {:?}", local);

        tokio::spawn(run_datagram(self.shared().clone(), socket));
        Ok(())
    }

    /// Bind an ephemeral port unless already bound.
    fn ensure_bound(&self) -> Result<()> {
        if self.shared().lock().socket.is_some() {
            return Ok(());
        }
        match self.bind_addr(any_addr(0)) {
            Ok(()) | Err(SocketError::AlreadyConnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Set the default peer for writes without a destination.
    ///
    /// Resolution and association happen asynchronously; writes queued in
    /// the meantime wait for them. A failure is reported as `Error` then
    /// `Disconnected`.
    pub fn connect(&self, host: &str, port: u32) -> Result<&Self> {
        let port = validate_port(port)?;
        {
            let mut core = self.shared().lock();
            if core.engine.is_terminated() {
                return Err(SocketError::ConnectionClosed);
            }
            if core.peer.is_some() || core.connect_pending {
                return Err(SocketError::AlreadyConnected);
            }
            core.connect_pending = true;
        }

        let socket = self
            .ensure_bound()
            .and_then(|()| self.shared().lock().socket.clone().ok_or(SocketError::ConnectionClosed));
        let socket = match socket {
            Ok(socket) => socket,
            Err(e) => {
                self.shared().lock().connect_pending = false;
                return Err(e);
            }
        };

        let shared = self.shared().clone();
        let host = host.to_owned();
        tokio::spawn(async move {
            let result = async {
                let addr = resolve(&host, port).await?;
                socket.connect(addr).await?;
                Ok::<_, SocketError>(addr)
            }
            .await;

            {
                let mut core = shared.lock();
                core.connect_pending = false;
                match result {
                    Ok(addr) => {
                        tracing::debug!("Datagram peer set to {}", addr);
                        core.peer = Some(addr);
                    }
                    Err(e) => {
                        tracing::debug!("Datagram connect to {}:{} failed: {}", host, port, e);
                        core.engine.fail(e);
                    }
                }
            }
            shared.wake.notify_one();
        });
        Ok(self)
    }

    /// Queue a datagram to `dest`, or to the connected peer when `None`.
    pub fn send_to(
        &self,
        payload: impl Into<Bytes>,
        tag: impl Into<Tag>,
        dest: Option<SocketAddr>,
    ) -> Result<&Self> {
        self.send_with_timeout(payload.into(), tag.into(), dest, Timeout::Default)?;
        Ok(self)
    }

    fn send_with_timeout(
        &self,
        payload: Bytes,
        tag: Tag,
        dest: Option<SocketAddr>,
        timeout: Timeout,
    ) -> Result<()> {
        {
            let core = self.shared().lock();
            if !core.engine.state().accepts_operations() {
                return Err(SocketError::ConnectionClosed);
            }
            if dest.is_none() && core.peer.is_none() && !core.connect_pending {
                return Err(SocketError::MissingDestination);
            }
        }
        self.ensure_bound()?;

        self.shared()
            .lock()
            .engine
            .enqueue_write(payload, dest, tag, timeout)?;
        self.shared().wake.notify_one();
        Ok(())
    }

    /// Deliver every packet that arrives while no read is active as
    /// `DataRead` with `tag`, until [`UdpSocket::pause`].
    pub fn receive_continuous(&self, tag: impl Into<Tag>) -> Result<&Self> {
        {
            let mut core = self.shared().lock();
            if !core.engine.state().accepts_operations() {
                return Err(SocketError::ConnectionClosed);
            }
            core.continuous = Some(tag.into());
        }
        self.shared().wake.notify_one();
        Ok(self)
    }

    /// Leave continuous-receive mode.
    pub fn pause(&self) -> &Self {
        self.shared().lock().continuous = None;
        self
    }

    pub fn is_receiving_continuously(&self) -> bool {
        self.shared().lock().continuous.is_some()
    }

    /// Toggle `SO_BROADCAST`, now if bound, otherwise at bind time.
    pub fn set_broadcast(&self, enabled: bool) -> Result<&Self> {
        let mut core = self.shared().lock();
        if let Some(socket) = &core.socket {
            socket.set_broadcast(enabled)?;
        }
        core.broadcast = enabled;
        Ok(self)
    }

    /// Stop receiving, let queued sends finish, then disconnect.
    pub fn close_after_writing(&self) {
        self.shared().shutdown(true);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared().lock().local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared().lock().peer
    }
}

impl Default for UdpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("UdpSocket");
        if let Ok(core) = self.shared().core.try_lock() {
            s.field("state", &core.engine.state())
                .field("local_addr", &core.local_addr)
                .field("peer", &core.peer);
        }
        s.finish_non_exhaustive()
    }
}

impl Socket for UdpSocket {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn read_with_timeout(
        &self,
        spec: FramingSpec,
        tag: impl Into<Tag>,
        timeout: Timeout,
    ) -> Result<&Self> {
        spec.check_for(TransportKind::Datagram)?;
        self.shared()
            .lock()
            .engine
            .enqueue_read(spec, tag.into(), timeout)?;
        self.shared().wake.notify_one();
        Ok(self)
    }

    fn write_with_timeout(
        &self,
        payload: impl Into<Bytes>,
        tag: impl Into<Tag>,
        timeout: Timeout,
    ) -> Result<&Self> {
        self.send_with_timeout(payload.into(), tag.into(), None, timeout)?;
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
        let core = self.shared().lock();
        SocketInfo {
            kind: TransportKind::Datagram,
            state: core.engine.state(),
            listening: core.socket.is_some() && !core.engine.is_terminated(),
            local_addr: core.local_addr,
            peer_addr: core.peer,
            unix_path: None,
            default_timeout: core.engine.default_timeout(),
            connections: usize::from(core.engine.state() == SocketState::Connected),
            pending_reads: core.engine.pending_reads(),
            pending_writes: core.engine.pending_writes(),
            buffered: core.backlog.len(),
        }
    }
}

async fn send_datagram(
    socket: &tokio::net::UdpSocket,
    payload: &[u8],
    dest: Option<SocketAddr>,
) -> io::Result<usize> {
    match dest {
        Some(addr) => socket.send_to(payload, addr).await,
        None => socket.send(payload).await,
    }
}

/// Driver loop for one bound UDP socket.
async fn run_datagram(shared: Arc<UdpShared>, socket: Arc<tokio::net::UdpSocket>) {
    let backlog_cap = shared.config.datagram_backlog;
    let mut recv_buf = vec![0u8; shared.config.effective_max_datagram_size()];

    loop {
        let turn = shared.lock().turn(Instant::now());
        shared.dispatcher.dispatch_all(turn.events);
        if turn.finished {
            break;
        }

        let (payload, dest) = turn.write.clone().unwrap_or_default();
        let deadline = turn.deadline.unwrap_or_else(far_future);

        tokio::select! {
            _ = shared.wake.notified() => {}
            result = socket.recv_from(&mut recv_buf), if turn.want_recv => {
                shared.lock().on_packet(result, &recv_buf, backlog_cap);
            }
            result = send_datagram(&socket, &payload, dest), if turn.write.is_some() => {
                shared.lock().on_sent(result, payload.len());
            }
            _ = tokio::time::sleep_until(deadline), if turn.deadline.is_some() => {}
        }
    }
    shared.release();
    tracing::debug!("Datagram driver finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_one_message_reads_accepted() {
        let socket = UdpSocket::new();
        for spec in [FramingSpec::line(), FramingSpec::exact(4), FramingSpec::ToEof] {
            assert!(matches!(
                socket.read(spec, 1),
                Err(SocketError::UnsupportedFramingSpec {
                    transport: TransportKind::Datagram,
                    ..
                })
            ));
        }
        socket.read(FramingSpec::OneMessage, 1).unwrap();
        assert_eq!(socket.info().pending_reads, 1);
    }

    #[test]
    fn test_write_without_destination_fails() {
        let socket = UdpSocket::new();
        assert!(matches!(
            socket.write("ping", 1),
            Err(SocketError::MissingDestination)
        ));
        assert_eq!(socket.state(), SocketState::Unconnected);
        assert_eq!(socket.info().pending_writes, 0);
    }

    #[tokio::test]
    async fn test_send_to_binds_implicitly() {
        let socket = UdpSocket::new();
        let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();
        socket.send_to("ping", 1, Some(dest)).unwrap();

        assert_eq!(socket.state(), SocketState::Connected);
        assert!(socket.local_addr().is_some());
        socket.close();
    }

    #[tokio::test]
    async fn test_bind_twice_fails() {
        let socket = UdpSocket::new();
        socket.bind(0).unwrap();
        assert!(matches!(socket.bind(0), Err(SocketError::AlreadyConnected)));
        assert!(socket.info().listening);
        socket.close();
        assert!(matches!(socket.bind(0), Err(SocketError::ConnectionClosed)));
    }

    #[test]
    fn test_continuous_mode_toggle() {
        let socket = UdpSocket::new();
        socket.receive_continuous("stream").unwrap();
        assert!(socket.is_receiving_continuously());
        socket.pause();
        assert!(!socket.is_receiving_continuously());
    }

    #[test]
    fn test_close_unbound_cancels_reads() {
        let socket = UdpSocket::new();
        let (tx, rx) = std::sync::mpsc::channel();
        socket.set_callback(move |event| {
            let _ = tx.send(event);
        });
        socket.read(FramingSpec::OneMessage, "a").unwrap();

        socket.close();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tag(), Some(&Tag::from("a")));
        assert!(matches!(events[1], SocketEvent::Disconnected { .. }));
        assert!(matches!(
            socket.receive_continuous(1),
            Err(SocketError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_bound_socket_with_self_reference_freed_after_close() {
        let socket = UdpSocket::new();
        let weak = Arc::downgrade(socket.shared());
        let held = socket.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        socket.set_callback(move |event| {
            let _ = held.local_addr();
            let _ = tx.send(event);
        });
        socket.bind(0).unwrap();
        socket.close();
        drop(socket);

        loop {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(SocketEvent::Disconnected { .. })) => break,
                Ok(Some(_)) => continue,
                other => panic!("expected Disconnected, got {:?}", other),
            }
        }

        let deadline = Instant::now() + Duration::from_secs(1);
        while weak.upgrade().is_some() {
            assert!(Instant::now() < deadline, "socket state still referenced");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
