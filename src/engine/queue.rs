//! Per-kind FIFO of pending operations.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::Bytes;

use super::timeout::Timeout;
use crate::event::Tag;
use crate::framing::FramingSpec;

/// Operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
}

/// Read request body.
#[derive(Debug, Clone)]
pub struct ReadOp {
    pub spec: FramingSpec,
}

/// Write request body. `written` tracks progress across partial sends.
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub payload: Bytes,
    pub destination: Option<SocketAddr>,
    pub written: usize,
}

impl WriteOp {
    pub fn new(payload: Bytes, destination: Option<SocketAddr>) -> Self {
        Self {
            payload,
            destination,
            written: 0,
        }
    }

    /// Bytes not yet accepted by the transport.
    pub fn remaining(&self) -> Bytes {
        self.payload.slice(self.written.min(self.payload.len())..)
    }

    pub fn is_done(&self) -> bool {
        self.written >= self.payload.len()
    }
}

/// A queued unit of work.
#[derive(Debug, Clone)]
pub struct Operation<T> {
    pub tag: Tag,
    pub timeout: Timeout,
    pub body: T,
}

impl<T> Operation<T> {
    pub fn new(body: T, tag: Tag, timeout: Timeout) -> Self {
        Self {
            tag,
            timeout,
            body,
        }
    }
}

/// FIFO of pending operations. Only the head is ever serviced.
#[derive(Debug)]
pub struct OperationQueue<T> {
    ops: VecDeque<Operation<T>>,
}

impl<T> OperationQueue<T> {
    pub fn new() -> Self {
        Self {
            ops: VecDeque::new(),
        }
    }

    /// Append to the tail.
    pub fn enqueue(&mut self, op: Operation<T>) {
        self.ops.push_back(op);
    }

    /// Active operation, if any.
    pub fn head(&self) -> Option<&Operation<T>> {
        self.ops.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut Operation<T>> {
        self.ops.front_mut()
    }

    /// Remove the head, promoting the next operation.
    pub fn pop_head(&mut self) -> Option<Operation<T>> {
        self.ops.pop_front()
    }

    /// Remove every operation in enqueue order.
    pub fn drain(&mut self) -> impl Iterator<Item = Operation<T>> + '_ {
        self.ops.drain(..)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl<T> Default for OperationQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
