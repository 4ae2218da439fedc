//! Per-transfer state machine
//!
//! A session records which roles are attached, owns the sender's byte source
//! until the copy step takes it, and carries the two rendezvous latches:
//! `sender_ready` (a source is available) and `transfer_done` (the transfer
//! reached a terminal state and both parties may return).

use crate::error::{Party, RelayError};
use crate::latch::Latch;
use crate::read_ahead::ReadAhead;
use crate::relay::CHUNK_SIZE;
use crate::token::Token;
use std::io;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Instant;
use tokio::io::AsyncRead;

/// The sender's byte stream
pub type ByteSource = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    SenderAttached,
    Streaming,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

struct Inner {
    state: SessionState,
    input: Option<ReadAhead>,
    receiver_attached: bool,
    outcome: Option<Result<u64, RelayError>>,
}

impl Inner {
    fn conclude(&mut self, result: Result<u64, RelayError>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = match result {
            Ok(_) => SessionState::Completed,
            Err(_) => SessionState::Aborted,
        };
        self.outcome = Some(result);
        // Dropping an unread source closes the sender's body early
        self.input = None;
        true
    }
}

pub struct Session {
    token: Token,
    created_at: Instant,
    inner: Mutex<Inner>,
    sender_ready: Latch,
    transfer_done: Latch,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token.short())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(token: Token) -> Self {
        Self {
            token,
            created_at: Instant::now(),
            inner: Mutex::new(Inner {
                state: SessionState::Created,
                input: None,
                receiver_attached: false,
                outcome: None,
            }),
            sender_ready: Latch::new(),
            transfer_done: Latch::new(),
        }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn has_receiver(&self) -> bool {
        self.lock().receiver_attached
    }

    pub fn sender_ready(&self) -> &Latch {
        &self.sender_ready
    }

    pub fn transfer_done(&self) -> &Latch {
        &self.transfer_done
    }

    /// Recorded terminal outcome, `None` while the transfer is still live
    pub fn outcome(&self) -> Option<Result<u64, RelayError>> {
        self.lock().outcome.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // No invariant spans a panic inside these short critical sections
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the sender's byte source and fire `sender_ready`.
    pub fn attach_sender(&self, source: ByteSource) -> Result<(), RelayError> {
        {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Created => {
                    inner.input = Some(ReadAhead::new(source, CHUNK_SIZE));
                    inner.state = SessionState::SenderAttached;
                }
                state if state.is_terminal() => return Err(RelayError::UnknownToken),
                _ => return Err(RelayError::AlreadyAttached(Party::Sender)),
            }
        }
        self.sender_ready.set();
        tracing::debug!("Sender attached to {}", self.token.short());
        Ok(())
    }

    /// Take the receiver role
    pub fn claim_receiver(&self) -> Result<(), RelayError> {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return Err(RelayError::UnknownToken);
        }
        if inner.receiver_attached {
            return Err(RelayError::AlreadyAttached(Party::Receiver));
        }
        inner.receiver_attached = true;
        tracing::debug!("Receiver attached to {}", self.token.short());
        Ok(())
    }

    /// Move to `Streaming` and hand the byte source to the copy step.
    ///
    /// Fails with the recorded outcome if the session concluded first.
    pub fn begin_streaming(&self) -> Result<ByteSource, RelayError> {
        let mut inner = self.lock();
        if let Some(Err(e)) = &inner.outcome {
            return Err(e.clone());
        }
        let state = inner.state;
        match (state, inner.input.take()) {
            (SessionState::SenderAttached, Some(source)) => {
                inner.state = SessionState::Streaming;
                Ok(Box::pin(source))
            }
            (_, input) => {
                inner.input = input;
                Err(RelayError::Cancelled(Party::Sender))
            }
        }
    }

    /// The single transition into a terminal state.
    ///
    /// Returns true only for the caller that performed the transition; that
    /// caller is responsible for firing `transfer_done` and deregistering.
    pub fn conclude(&self, result: Result<u64, RelayError>) -> bool {
        self.lock().conclude(result)
    }

    /// Read ahead on the parked source while no receiver has taken it.
    ///
    /// Ready once the read-ahead buffer is full, the source ended, or the
    /// copy step took it. A source that fails first concludes the session
    /// with `Cancelled(Sender)` and the read error is returned; the caller
    /// then owns teardown, as with [`Session::conclude`].
    pub fn poll_read_ahead(&self, cx: &mut Context<'_>) -> Poll<Option<io::Error>> {
        let mut inner = self.lock();
        let Some(input) = inner.input.as_mut() else {
            return Poll::Ready(None);
        };
        match ready!(input.poll_fill(cx)) {
            Ok(()) => Poll::Ready(None),
            // Concluded under the same lock, so no receiver can take a broken source
            Err(e) => Poll::Ready(
                inner
                    .conclude(Err(RelayError::Cancelled(Party::Sender)))
                    .then_some(e),
            ),
        }
    }

    /// Conclude with `Expired`, but only if streaming has not started yet.
    pub fn expire(&self) -> bool {
        let mut inner = self.lock();
        if !matches!(
            inner.state,
            SessionState::Created | SessionState::SenderAttached
        ) {
            return false;
        }
        inner.conclude(Err(RelayError::Expired))
    }
}
