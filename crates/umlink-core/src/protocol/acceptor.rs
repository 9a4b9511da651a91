//! Response acceptors
//!
//! A pending request is an [`Acceptor`] plus a deadline. Acceptors are kept
//! in registration order and only the head is ever offered data, so responses
//! resolve in exactly the order they were requested no matter how the
//! transport chunks its deliveries.
//!
//! Dispatch, run after every change to the buffer or the queue:
//! 1. If the head has not accepted anything yet and fewer than
//!    [`Acceptor::min_bytes`] are buffered, wait.
//! 2. Offer the whole buffered prefix to the head.
//! 3. If it consumed less than it was offered, or reported done, pop it.
//!    Otherwise it stays at the head and skips the minimum check from now on.
//! 4. Drop the consumed bytes from the buffer and repeat.

use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use super::{Fault, ProtocolError, ReceiveBuffer};

/// Result of offering buffered bytes to an acceptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acceptance {
    /// Bytes taken from the front of the offered slice
    pub consumed: usize,
    /// The acceptor is finished and must be removed
    pub done: bool,
}

impl Acceptance {
    /// Took `consumed` bytes and is finished
    pub fn done(consumed: usize) -> Self {
        Self {
            consumed,
            done: true,
        }
    }

    /// Took `consumed` bytes and wants more
    pub fn partial(consumed: usize) -> Self {
        Self {
            consumed,
            done: false,
        }
    }
}

/// Consumer of response bytes.
///
/// Taking a strict prefix of what was offered marks the acceptor finished,
/// the same as returning `done`; the rest stays buffered for the next one.
pub trait Acceptor: Send {
    /// Bytes that must be buffered before the first offer
    fn min_bytes(&self) -> usize;

    /// Take a prefix of `data`
    fn accept(&mut self, data: &[u8]) -> Acceptance;

    /// Fail the acceptor's caller. Called at most once, instead of any
    /// further `accept`.
    fn reject(self: Box<Self>, error: ProtocolError);

    /// Response bytes the device still owes this acceptor. If it times out,
    /// that many incoming bytes are skipped rather than offered to the
    /// requests behind it. Zero means nothing is skipped.
    fn owed(&self) -> usize {
        0
    }
}

/// Delivers exactly `len` bytes to a waiting caller
pub struct FixedLengthAcceptor {
    len: usize,
    reply: Option<oneshot::Sender<Result<Vec<u8>, ProtocolError>>>,
}

impl FixedLengthAcceptor {
    /// Acceptor for `len` bytes and the receiver its caller awaits
    pub fn new(len: usize) -> (Self, oneshot::Receiver<Result<Vec<u8>, ProtocolError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                len,
                reply: Some(tx),
            },
            rx,
        )
    }
}

impl Acceptor for FixedLengthAcceptor {
    fn min_bytes(&self) -> usize {
        self.len
    }

    fn accept(&mut self, data: &[u8]) -> Acceptance {
        let take = self.len.min(data.len());
        if let Some(reply) = self.reply.take() {
            // The caller may have stopped waiting; the bytes are still its own.
            let _ = reply.send(Ok(data[..take].to_vec()));
        }
        Acceptance::done(take)
    }

    fn reject(mut self: Box<Self>, error: ProtocolError) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(error));
        }
    }

    fn owed(&self) -> usize {
        if self.reply.is_some() {
            self.len
        } else {
            0
        }
    }
}

struct PendingRequest {
    acceptor: Box<dyn Acceptor>,
    /// `None` waits until the connection ends
    deadline: Option<Instant>,
    /// Placeholder for bytes owed to a request that already timed out
    late: bool,
}

impl PendingRequest {
    fn late_bytes(remaining: usize) -> Self {
        Self {
            acceptor: Box::new(LateBytes { remaining }),
            deadline: None,
            late: true,
        }
    }
}

/// Swallows the rest of a response whose caller has given up
struct LateBytes {
    remaining: usize,
}

impl Acceptor for LateBytes {
    fn min_bytes(&self) -> usize {
        1
    }

    fn accept(&mut self, data: &[u8]) -> Acceptance {
        let take = self.remaining.min(data.len());
        self.remaining -= take;
        if self.remaining == 0 {
            Acceptance::done(take)
        } else {
            Acceptance::partial(take)
        }
    }

    fn reject(self: Box<Self>, _error: ProtocolError) {}
}

/// FIFO of pending requests.
///
/// A request that times out before any of its response arrived leaves a
/// placeholder in its slot for the bytes it was owed, so a late response
/// is discarded instead of being handed to the next caller. If a later
/// request times out while such a placeholder is still ahead of it, the
/// owed response is assumed lost: the placeholders are dropped and the
/// expiring request leaves none of its own.
#[derive(Default)]
pub struct AcceptorQueue {
    entries: VecDeque<PendingRequest>,
    head_has_accepted: bool,
}

impl AcceptorQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an acceptor at the back of the queue. With no deadline it
    /// waits until it is satisfied or drained.
    pub fn push(&mut self, acceptor: Box<dyn Acceptor>, deadline: Option<Instant>) {
        self.entries.push_back(PendingRequest {
            acceptor,
            deadline,
            late: false,
        });
    }

    /// Requests still waiting for a response
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.late).count()
    }

    /// Whether no request is waiting
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.late)
    }

    /// Whether the head has already taken part of its response
    pub fn head_in_progress(&self) -> bool {
        self.head_has_accepted
    }

    /// Match buffered bytes against the queue head until either runs dry
    /// or the head needs more data.
    pub fn dispatch(&mut self, buffer: &mut ReceiveBuffer) {
        while !buffer.is_empty() {
            let Some(head) = self.entries.front_mut() else {
                break;
            };

            let available = buffer.len();
            if !self.head_has_accepted && available < head.acceptor.min_bytes() {
                break;
            }

            let Acceptance { consumed, done } = head.acceptor.accept(buffer.as_slice());
            let consumed = consumed.min(available);

            if consumed < available || done {
                self.entries.pop_front();
                self.head_has_accepted = false;
            } else {
                self.head_has_accepted = true;
            }

            buffer.consume(consumed);
        }
    }

    /// Earliest deadline among pending requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().filter_map(|e| e.deadline).min()
    }

    /// Remove every request whose deadline is at or before `now` and fail
    /// it with [`ProtocolError::ReadTimedOut`]. Other requests keep their
    /// positions. Returns the number of expired requests.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        let mut i = 0;
        while i < self.entries.len() {
            if !self.entries[i].deadline.is_some_and(|d| d <= now) {
                i += 1;
                continue;
            }

            let mut dropped_late = false;
            let mut j = 0;
            while j < i {
                if self.entries[j].late {
                    if j == 0 {
                        self.head_has_accepted = false;
                    }
                    self.entries.remove(j);
                    i -= 1;
                    dropped_late = true;
                } else {
                    j += 1;
                }
            }
            if dropped_late {
                debug!("owed response never arrived, no longer skipping it");
            }

            if i == 0 {
                self.head_has_accepted = false;
            }
            let Some(entry) = self.entries.remove(i) else {
                break;
            };
            let owed = if dropped_late { 0 } else { entry.acceptor.owed() };
            debug!("request timed out, {} late byte(s) will be skipped", owed);
            entry.acceptor.reject(ProtocolError::ReadTimedOut);
            if owed > 0 {
                self.entries.insert(i, PendingRequest::late_bytes(owed));
                i += 1;
            }
            expired += 1;
        }
        expired
    }

    /// Fail every pending request with `fault`, in registration order
    pub fn drain(&mut self, fault: &Fault) {
        self.head_has_accepted = false;
        while let Some(entry) = self.entries.pop_front() {
            entry.acceptor.reject(fault.clone().into());
        }
    }
}
