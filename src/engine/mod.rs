//! Engine module - the transport-independent scheduling core.
//!
//! The [`Engine`] owns a socket's read and write queues, its state machine
//! and the deadlines of the active operations. Transport drivers feed it
//! I/O outcomes (`complete_read`, `advance_write`, `terminate`) and it
//! records the resulting [`SocketEvent`]s in an outbox. The driver drains
//! the outbox after releasing its lock and hands the events to the
//! dispatcher, so callbacks never run while the engine is borrowed.
//!
//! Ordering rules enforced here:
//! - reads complete in enqueue order, and so do writes
//! - only the head of each queue is active
//! - a terminal failure produces exactly one failure event per queued
//!   operation (reads first, then writes) followed by one `Disconnected`

mod queue;
mod state;
mod timeout;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::error::{Result, SocketError};
use crate::event::{SocketEvent, Tag};
use crate::framing::FramingSpec;

pub use queue::{OpKind, Operation, OperationQueue, ReadOp, WriteOp};
pub use state::SocketState;
pub use timeout::{secs_to_duration, Timeout, TimeoutSupervisor};

/// Scheduling core shared by the stream and datagram adapters.
#[derive(Debug)]
pub struct Engine {
    state: SocketState,
    /// Set by the driver once the transport can actually move bytes.
    transport_ready: bool,
    default_timeout: Option<Duration>,
    reads: OperationQueue<ReadOp>,
    writes: OperationQueue<WriteOp>,
    supervisor: TimeoutSupervisor,
    outbox: Vec<SocketEvent>,
}

impl Engine {
    /// Create an engine in `Unconnected` state.
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self {
            state: SocketState::Unconnected,
            transport_ready: false,
            default_timeout,
            reads: OperationQueue::new(),
            writes: OperationQueue::new(),
            supervisor: TimeoutSupervisor::new(),
            outbox: Vec::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> SocketState {
        self.state
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }

    /// True while the driver may service the queue heads.
    #[inline]
    pub fn is_servicing(&self) -> bool {
        self.transport_ready && !self.state.is_terminal()
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Change the default for operations that become active from now on.
    pub fn set_default_timeout(&mut self, timeout: Option<Duration>) {
        self.default_timeout = timeout;
    }

    /// `Unconnected -> Connecting`. Any other starting state is an error.
    pub fn begin_connect(&mut self) -> Result<()> {
        match self.state {
            SocketState::Unconnected => {
                self.state = SocketState::Connecting;
                Ok(())
            }
            SocketState::Disconnecting | SocketState::Disconnected => {
                Err(SocketError::ConnectionClosed)
            }
            _ => Err(SocketError::AlreadyConnected),
        }
    }

    /// Transport is up. Emits `Connected` on the transition when `announce` is set.
    pub fn mark_connected(&mut self, announce: bool) {
        if self.state.is_terminal() {
            return;
        }
        self.transport_ready = true;
        if self.state.advance(SocketState::Connected) && announce {
            self.outbox.push(SocketEvent::Connected);
        }
    }

    fn check_accepting(&self) -> Result<()> {
        if self.state.accepts_operations() {
            Ok(())
        } else {
            Err(SocketError::ConnectionClosed)
        }
    }

    /// Queue a read. The spec must already be validated for the transport.
    pub fn enqueue_read(&mut self, spec: FramingSpec, tag: Tag, timeout: Timeout) -> Result<()> {
        self.check_accepting()?;
        self.reads
            .enqueue(Operation::new(ReadOp { spec }, tag, timeout));
        Ok(())
    }

    /// Queue a write.
    pub fn enqueue_write(
        &mut self,
        payload: Bytes,
        destination: Option<SocketAddr>,
        tag: Tag,
        timeout: Timeout,
    ) -> Result<()> {
        self.check_accepting()?;
        self.writes.enqueue(Operation::new(
            WriteOp::new(payload, destination),
            tag,
            timeout,
        ));
        Ok(())
    }

    /// Active read, if the transport is up.
    pub fn active_read(&self) -> Option<&Operation<ReadOp>> {
        if self.is_servicing() {
            self.reads.head()
        } else {
            None
        }
    }

    /// Active write, if the transport is up.
    pub fn active_write(&self) -> Option<&Operation<WriteOp>> {
        if self.is_servicing() {
            self.writes.head()
        } else {
            None
        }
    }

    pub fn pending_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Arm deadlines for queue heads that just became active.
    pub fn activate(&mut self, now: Instant) {
        if !self.is_servicing() {
            return;
        }
        if !self.supervisor.is_armed(OpKind::Read) {
            if let Some(head) = self.reads.head() {
                let deadline = head.timeout.resolve(self.default_timeout).map(|d| now + d);
                self.supervisor.arm(OpKind::Read, deadline);
            }
        }
        if !self.supervisor.is_armed(OpKind::Write) {
            if let Some(head) = self.writes.head() {
                let deadline = head.timeout.resolve(self.default_timeout).map(|d| now + d);
                self.supervisor.arm(OpKind::Write, deadline);
            }
        }
    }

    /// Complete the active read with `data`.
    pub fn complete_read(&mut self, data: Bytes, from: Option<SocketAddr>) {
        self.supervisor.disarm(OpKind::Read);
        if let Some(op) = self.reads.pop_head() {
            self.outbox.push(SocketEvent::data(data, op.tag, from));
        }
    }

    /// Record `n` more bytes of the active write as sent.
    ///
    /// Returns `true` when the whole payload has gone out and
    /// `WriteComplete` was emitted.
    pub fn advance_write(&mut self, n: usize) -> bool {
        let done = match self.writes.head_mut() {
            Some(head) => {
                head.body.written += n;
                head.body.is_done()
            }
            None => return false,
        };
        if !done {
            return false;
        }

        self.supervisor.disarm(OpKind::Write);
        if let Some(op) = self.writes.pop_head() {
            self.outbox.push(SocketEvent::WriteComplete { tag: op.tag });
        }
        if self.state == SocketState::Disconnecting && self.writes.is_empty() {
            self.terminate(SocketError::ConnectionClosed);
        }
        true
    }

    /// Earliest active deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.is_servicing() {
            self.supervisor.next_deadline()
        } else {
            None
        }
    }

    /// Fail the socket if an active deadline has passed. Returns whether it did.
    pub fn expire(&mut self, now: Instant) -> bool {
        if !self.is_servicing() {
            return false;
        }
        match self.supervisor.expired(now) {
            Some(kind) => {
                self.time_out(kind);
                true
            }
            None => false,
        }
    }

    fn time_out(&mut self, kind: OpKind) {
        self.supervisor.disarm(kind);
        let tag = match kind {
            OpKind::Read => self.reads.pop_head().map(|op| op.tag),
            OpKind::Write => self.writes.pop_head().map(|op| op.tag),
        };
        if let Some(tag) = tag {
            tracing::warn!("{:?} operation with tag {} timed out", kind, tag);
            self.outbox
                .push(SocketEvent::op_failed(SocketError::TimedOut, tag));
        }
        self.terminate(SocketError::TimedOut);
    }

    /// Connection-level failure: an untagged `Error`, then termination.
    pub fn fail(&mut self, reason: SocketError) {
        if self.state.is_terminal() {
            return;
        }
        self.outbox.push(SocketEvent::Error {
            reason: reason.clone(),
            tag: None,
        });
        self.terminate(reason);
    }

    /// Cancel every queued operation with `reason` and enter `Disconnected`.
    ///
    /// Idempotent: a socket disconnects at most once.
    pub fn terminate(&mut self, reason: SocketError) {
        if !self.state.advance(SocketState::Disconnected) {
            return;
        }
        self.transport_ready = false;
        self.supervisor.clear();
        self.cancel_all(&reason);
        self.outbox.push(SocketEvent::Disconnected { reason });
    }

    /// Fail every queued operation with `reason`, keeping the current state.
    pub fn cancel_queued(&mut self, reason: SocketError) {
        self.supervisor.clear();
        self.cancel_all(&reason);
    }

    fn cancel_all(&mut self, reason: &SocketError) {
        let reads = self.reads.drain().map(|op| op.tag);
        let mut tags: Vec<Tag> = reads.collect();
        tags.extend(self.writes.drain().map(|op| op.tag));

        self.outbox.extend(
            tags.into_iter()
                .map(|tag| SocketEvent::op_failed(reason.clone(), tag)),
        );
    }

    /// Graceful close: reads are cancelled, queued writes are allowed to
    /// finish, then the socket disconnects.
    pub fn begin_disconnect(&mut self) {
        if !self.state.accepts_operations() {
            return;
        }
        if !self.transport_ready || self.writes.is_empty() {
            self.terminate(SocketError::ConnectionClosed);
            return;
        }

        self.state.advance(SocketState::Disconnecting);
        self.supervisor.disarm(OpKind::Read);
        let cancelled: Vec<Tag> = self.reads.drain().map(|op| op.tag).collect();
        self.outbox.extend(
            cancelled
                .into_iter()
                .map(|tag| SocketEvent::op_failed(SocketError::ConnectionClosed, tag)),
        );
    }

    /// Drain the outbox in emission order.
    pub fn take_events(&mut self) -> Vec<SocketEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Emit a transport-specific event (e.g. `Accepted`).
    pub fn push_event(&mut self, event: SocketEvent) {
        self.outbox.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_engine() -> Engine {
        let mut engine = Engine::new(None);
        engine.begin_connect().unwrap();
        engine.mark_connected(true);
        engine
    }

    fn tags_of(events: &[SocketEvent]) -> Vec<Option<Tag>> {
        events.iter().map(|e| e.tag().cloned()).collect()
    }

    #[test]
    fn test_reads_complete_in_order() {
        let mut engine = connected_engine();
        for tag in 1..=3 {
            engine
                .enqueue_read(FramingSpec::line(), Tag::from(tag), Timeout::Default)
                .unwrap();
        }

        for tag in 1..=3 {
            assert_eq!(engine.active_read().unwrap().tag, Tag::from(tag));
            engine.complete_read(Bytes::from_static(b"x\n"), None);
        }

        let events = engine.take_events();
        assert!(matches!(events[0], SocketEvent::Connected));
        assert_eq!(
            tags_of(&events[1..]),
            vec![
                Some(Tag::Int(1)),
                Some(Tag::Int(2)),
                Some(Tag::Int(3))
            ]
        );
    }

    #[test]
    fn test_no_active_read_before_connect() {
        let mut engine = Engine::new(None);
        engine
            .enqueue_read(FramingSpec::line(), Tag::from(1), Timeout::Default)
            .unwrap();
        assert!(engine.active_read().is_none());
        assert_eq!(engine.pending_reads(), 1);
    }

    #[test]
    fn test_partial_writes_complete_once() {
        let mut engine = connected_engine();
        engine.take_events();
        engine
            .enqueue_write(Bytes::from_static(b"hello"), None, Tag::from("w"), Timeout::Default)
            .unwrap();

        assert!(!engine.advance_write(2));
        assert_eq!(&engine.active_write().unwrap().body.remaining()[..], b"llo");
        assert!(engine.advance_write(3));

        let events = engine.take_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SocketEvent::WriteComplete { tag } if *tag == Tag::from("w")));
    }

    #[test]
    fn test_close_drains_queue() {
        let mut engine = connected_engine();
        engine.take_events();
        for tag in 1..=3 {
            engine
                .enqueue_read(FramingSpec::exact(10), Tag::from(tag), Timeout::Default)
                .unwrap();
        }

        engine.terminate(SocketError::ConnectionClosed);
        let events = engine.take_events();

        assert_eq!(events.len(), 4);
        for (i, event) in events[..3].iter().enumerate() {
            match event {
                SocketEvent::Error { reason, tag } => {
                    assert!(matches!(reason, SocketError::ConnectionClosed));
                    assert_eq!(tag, &Some(Tag::Int(i as i64 + 1)));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(matches!(events[3], SocketEvent::Disconnected { .. }));
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let mut engine = connected_engine();
        engine.terminate(SocketError::ConnectionClosed);
        engine.terminate(SocketError::TimedOut);

        let disconnects = engine
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, SocketEvent::Disconnected { .. }))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[test]
    fn test_enqueue_after_disconnect_fails() {
        let mut engine = connected_engine();
        engine.terminate(SocketError::ConnectionClosed);

        let err = engine
            .enqueue_read(FramingSpec::line(), Tag::Untagged, Timeout::Default)
            .unwrap_err();
        assert!(matches!(err, SocketError::ConnectionClosed));
        assert!(engine
            .enqueue_write(Bytes::new(), None, Tag::Untagged, Timeout::Default)
            .is_err());
    }

    #[test]
    fn test_timeout_cancels_everything() {
        let mut engine = connected_engine();
        engine.take_events();
        let now = Instant::now();

        engine
            .enqueue_read(
                FramingSpec::line(),
                Tag::from(1),
                Timeout::After(Duration::from_millis(100)),
            )
            .unwrap();
        engine
            .enqueue_read(FramingSpec::line(), Tag::from(2), Timeout::Default)
            .unwrap();
        engine
            .enqueue_write(Bytes::from_static(b"x"), None, Tag::from(3), Timeout::Never)
            .unwrap();
        engine.activate(now);

        assert_eq!(engine.next_deadline(), Some(now + Duration::from_millis(100)));
        assert!(!engine.expire(now + Duration::from_millis(50)));
        assert!(engine.expire(now + Duration::from_millis(100)));

        let events = engine.take_events();
        assert_eq!(events.len(), 4);
        for event in &events[..3] {
            assert!(matches!(
                event,
                SocketEvent::Error {
                    reason: SocketError::TimedOut,
                    tag: Some(_)
                }
            ));
        }
        assert_eq!(
            tags_of(&events[..3]),
            vec![Some(Tag::Int(1)), Some(Tag::Int(2)), Some(Tag::Int(3))]
        );
        assert!(matches!(
            events[3],
            SocketEvent::Disconnected {
                reason: SocketError::TimedOut
            }
        ));
        assert!(engine.is_terminated());
    }

    #[test]
    fn test_default_timeout_applies_at_activation() {
        let mut engine = connected_engine();
        let now = Instant::now();

        engine
            .enqueue_read(FramingSpec::line(), Tag::from(1), Timeout::Default)
            .unwrap();
        engine
            .enqueue_read(FramingSpec::line(), Tag::from(2), Timeout::Default)
            .unwrap();
        engine.activate(now);
        assert_eq!(engine.next_deadline(), None);

        // Only affects operations that become active later
        engine.set_default_timeout(Some(Duration::from_secs(1)));
        engine.activate(now);
        assert_eq!(engine.next_deadline(), None);

        engine.complete_read(Bytes::from_static(b"a\n"), None);
        engine.activate(now);
        assert_eq!(engine.next_deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_graceful_disconnect_flushes_writes() {
        let mut engine = connected_engine();
        engine.take_events();
        engine
            .enqueue_read(FramingSpec::line(), Tag::from("r"), Timeout::Default)
            .unwrap();
        engine
            .enqueue_write(Bytes::from_static(b"bye"), None, Tag::from("w"), Timeout::Default)
            .unwrap();

        engine.begin_disconnect();
        assert_eq!(engine.state(), SocketState::Disconnecting);
        assert!(engine.active_read().is_none());
        assert!(engine
            .enqueue_write(Bytes::new(), None, Tag::Untagged, Timeout::Default)
            .is_err());

        assert!(engine.advance_write(3));
        assert_eq!(engine.state(), SocketState::Disconnected);

        let events = engine.take_events();
        assert!(matches!(&events[0], SocketEvent::Error { tag: Some(t), .. } if *t == Tag::from("r")));
        assert!(matches!(&events[1], SocketEvent::WriteComplete { tag } if *tag == Tag::from("w")));
        assert!(matches!(events[2], SocketEvent::Disconnected { .. }));
    }

    #[test]
    fn test_connect_failure_reports_untagged_error() {
        let mut engine = Engine::new(None);
        engine.begin_connect().unwrap();
        engine
            .enqueue_write(Bytes::from_static(b"x"), None, Tag::from(9), Timeout::Default)
            .unwrap();

        engine.fail(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
        let events = engine.take_events();

        assert!(matches!(&events[0], SocketEvent::Error { tag: None, .. }));
        assert!(matches!(&events[1], SocketEvent::Error { tag: Some(t), .. } if *t == Tag::Int(9)));
        assert!(matches!(events[2], SocketEvent::Disconnected { .. }));
    }

    #[test]
    fn test_cancel_queued_keeps_state() {
        let mut engine = Engine::new(None);
        engine
            .enqueue_read(FramingSpec::line(), Tag::from(1), Timeout::Default)
            .unwrap();
        engine
            .enqueue_write(Bytes::from_static(b"x"), None, Tag::from(2), Timeout::Default)
            .unwrap();

        engine.cancel_queued(SocketError::NoClients);

        let events = engine.take_events();
        assert_eq!(tags_of(&events), vec![Some(Tag::Int(1)), Some(Tag::Int(2))]);
        assert!(events
            .iter()
            .all(|e| matches!(e, SocketEvent::Error { reason: SocketError::NoClients, .. })));
        assert_eq!(engine.state(), SocketState::Unconnected);
        assert_eq!(engine.pending_reads() + engine.pending_writes(), 0);
    }

    #[test]
    fn test_begin_connect_twice() {
        let mut engine = Engine::new(None);
        engine.begin_connect().unwrap();
        assert!(matches!(
            engine.begin_connect(),
            Err(SocketError::AlreadyConnected)
        ));
    }
}
