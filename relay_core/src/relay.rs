//! Relay coordinator
//!
//! Pairs a sender and a receiver on the same token, copies the sender's bytes
//! into the receiver's sink as they arrive, and tears the session down exactly
//! once through [`Session::conclude`].
//!
//! The sender's attach call does not return until the transfer concluded.
//! Its byte source is the caller's request body, which is only valid while
//! that call is still running, so returning early would cut the stream off.

use crate::error::{Party, RelayError};
use crate::latch::Latch;
use crate::registry::{MemoryRegistry, Registry};
use crate::session::{ByteSource, Session, SessionState};
use crate::token::{RandomTokens, Token, TokenSource};
use std::future::poll_fn;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Copy buffer size (64KB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Token issue attempts before `DuplicateToken` is reported
const TOKEN_ATTEMPTS: usize = 2;

pub struct Coordinator {
    registry: Arc<dyn Registry>,
    tokens: Arc<dyn TokenSource>,
}

impl Coordinator {
    pub fn new(registry: Arc<dyn Registry>, tokens: Arc<dyn TokenSource>) -> Self {
        Self { registry, tokens }
    }

    /// Coordinator backed by a [`MemoryRegistry`] and OS-seeded random tokens
    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(
            Arc::new(MemoryRegistry::new()),
            Arc::new(RandomTokens::new()?),
        ))
    }

    /// Issue a token and register a fresh session for it
    pub fn begin_transfer(&self) -> Result<Token, RelayError> {
        let mut last_err = RelayError::DuplicateToken;
        for _ in 0..TOKEN_ATTEMPTS {
            let token = self.tokens.issue();
            match self.registry.create(token.clone()) {
                Ok(_) => {
                    tracing::debug!("New transfer {}", token.short());
                    return Ok(token);
                }
                Err(e) => {
                    tracing::warn!("Token collision on {}: {}", token.short(), e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    pub fn lookup(&self, token: &Token) -> Option<Arc<Session>> {
        self.registry.lookup(token)
    }

    pub fn live_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Attach the sender's byte source and wait for the transfer to conclude.
    ///
    /// Returns the number of bytes delivered. Dropping the returned future
    /// before it resolves aborts the transfer with `Cancelled(Sender)`, and so
    /// does a source that fails while it waits for a receiver.
    pub async fn attach_sender(&self, token: &Token, source: ByteSource) -> Result<u64, RelayError> {
        let session = self.registry.lookup(token).ok_or(RelayError::UnknownToken)?;
        session.attach_sender(source)?;

        let mut guard = AbortOnDrop {
            registry: &*self.registry,
            session: &session,
            party: Party::Sender,
            armed: true,
        };
        let done = session.transfer_done();
        tokio::select! {
            biased;
            _ = done.wait() => {}
            failed = poll_fn(|cx| session.poll_read_ahead(cx)) => {
                if let Some(e) = failed {
                    tracing::warn!("Transfer {} aborted: sender stream: {}", token.short(), e);
                    settle(&*self.registry, &session);
                }
                done.wait().await;
            }
        }
        guard.armed = false;

        recorded_outcome(&session)
    }

    /// Take the receiver role on a token without waiting yet
    pub fn claim_receiver(&self, token: &Token) -> Result<ReceiverClaim, RelayError> {
        let session = self.registry.lookup(token).ok_or(RelayError::UnknownToken)?;
        session.claim_receiver()?;
        Ok(ReceiverClaim {
            registry: self.registry.clone(),
            session,
            armed: true,
        })
    }

    /// Wait for the sender, then stream its bytes into `sink`
    pub async fn attach_receiver<W>(&self, token: &Token, sink: W) -> Result<u64, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        self.claim_receiver(token)?.relay(sink).await
    }

    /// Abort every session older than `max_age` that has not started streaming.
    ///
    /// Waiting parties are released with `Expired`. Returns the number evicted.
    pub fn evict_idle(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for session in self.registry.sessions() {
            if now.duration_since(session.created_at()) < max_age {
                continue;
            }
            if session.expire() {
                tracing::info!("Evicted idle transfer {}", session.token().short());
                settle(&*self.registry, &session);
                evicted += 1;
            }
        }
        evicted
    }
}

/// Receiver role held on a session.
///
/// Dropping a claim before [`ReceiverClaim::relay`] finished aborts the
/// transfer with `Cancelled(Receiver)`, releasing a waiting sender.
pub struct ReceiverClaim {
    registry: Arc<dyn Registry>,
    session: Arc<Session>,
    armed: bool,
}

impl ReceiverClaim {
    pub fn token(&self) -> &Token {
        self.session.token()
    }

    /// Suspend until a sender attached, or fail if the session concluded first
    pub async fn wait_for_sender(&self) -> Result<(), RelayError> {
        tokio::select! {
            biased;
            _ = self.session.transfer_done().wait() => {
                Err(recorded_outcome(&self.session).err().unwrap_or(RelayError::Cancelled(Party::Sender)))
            }
            _ = self.session.sender_ready().wait() => Ok(()),
        }
    }

    /// Copy the sender's stream into `sink` and conclude the session
    pub async fn relay<W>(mut self, mut sink: W) -> Result<u64, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        self.wait_for_sender().await?;

        let result = match self.session.begin_streaming() {
            Ok(source) => {
                tracing::debug!("Streaming {}", self.session.token().short());
                copy(source, &mut sink, self.session.transfer_done()).await
            }
            Err(e) => Err(e),
        };

        self.armed = false;
        if finish(&*self.registry, &self.session, result.clone()) {
            result
        } else {
            // The other side concluded first; report what it recorded
            recorded_outcome(&self.session)
        }
    }
}

impl Drop for ReceiverClaim {
    fn drop(&mut self) {
        if self.armed {
            finish(
                &*self.registry,
                &self.session,
                Err(RelayError::Cancelled(Party::Receiver)),
            );
        }
    }
}

/// Aborts the session if an attach call is dropped mid-wait
struct AbortOnDrop<'a> {
    registry: &'a dyn Registry,
    session: &'a Session,
    party: Party,
    armed: bool,
}

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            finish(
                self.registry,
                self.session,
                Err(RelayError::Cancelled(self.party)),
            );
        }
    }
}

/// Conclude the session; the winning caller deregisters it and releases both parties.
fn finish(registry: &dyn Registry, session: &Session, result: Result<u64, RelayError>) -> bool {
    let won = session.conclude(result);
    if won {
        match session.outcome() {
            Some(Ok(bytes)) => {
                tracing::info!("Transfer {} completed ({} bytes)", session.token().short(), bytes)
            }
            Some(Err(e)) => tracing::warn!("Transfer {} aborted: {}", session.token().short(), e),
            None => {}
        }
        settle(registry, session);
    }
    won
}

/// Deregister before releasing so a returning party never sees the token live
fn settle(registry: &dyn Registry, session: &Session) {
    debug_assert!(session.state().is_terminal());
    registry.remove(session.token());
    session.transfer_done().set();
}

fn recorded_outcome(session: &Session) -> Result<u64, RelayError> {
    session.outcome().unwrap_or_else(|| {
        debug_assert_ne!(session.state(), SessionState::Completed);
        Err(RelayError::Cancelled(Party::Receiver))
    })
}

/// Chunked copy that stops as soon as `done` fires
async fn copy<W>(mut source: ByteSource, sink: &mut W, done: &Latch) -> Result<u64, RelayError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = tokio::select! {
            _ = done.wait() => return Err(RelayError::Cancelled(Party::Sender)),
            read = source.read(&mut buf) => read
                .map_err(|e| RelayError::TransferFailed(format!("sender stream: {}", e)))?,
        };
        if n == 0 {
            break;
        }

        tokio::select! {
            _ = done.wait() => return Err(RelayError::Cancelled(Party::Sender)),
            written = sink.write_all(&buf[..n]) => written
                .map_err(|e| RelayError::TransferFailed(format!("receiver sink: {}", e)))?,
        }
        total += n as u64;
    }

    sink.flush()
        .await
        .map_err(|e| RelayError::TransferFailed(format!("receiver sink: {}", e)))?;
    sink.shutdown()
        .await
        .map_err(|e| RelayError::TransferFailed(format!("receiver sink: {}", e)))?;

    Ok(total)
}

/// Periodically evict sessions idle for longer than `ttl` until `cancel` fires
pub fn spawn_reaper(
    coordinator: Arc<Coordinator>,
    ttl: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let period = (ttl / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let evicted = coordinator.evict_idle(ttl);
                    if evicted > 0 {
                        tracing::debug!("Reaper evicted {} sessions", evicted);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Sink that accepts `limit` bytes and then fails
    struct FailingSink {
        limit: usize,
        written: usize,
    }

    impl AsyncWrite for FailingSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.written >= self.limit {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")));
            }
            let n = buf.len().min(self.limit - self.written);
            self.written += n;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct FixedTokens;

    impl TokenSource for FixedTokens {
        fn issue(&self) -> Token {
            Token::from("FIXED")
        }
    }

    #[tokio::test]
    async fn test_copy_counts_bytes() {
        let data = vec![7u8; CHUNK_SIZE * 3 + 11];
        let source: ByteSource = Box::pin(std::io::Cursor::new(data.clone()));
        let mut out = Vec::new();
        let done = Latch::new();

        let n = copy(source, &mut out, &done).await.unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_copy_reports_sink_failure() {
        let source: ByteSource = Box::pin(std::io::Cursor::new(vec![1u8; 1000]));
        let mut sink = FailingSink {
            limit: 10,
            written: 0,
        };
        let done = Latch::new();

        match copy(source, &mut sink, &done).await {
            Err(RelayError::TransferFailed(msg)) => assert!(msg.starts_with("receiver sink")),
            other => panic!("Expected TransferFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_copy_stops_when_done() {
        let (_writer, reader) = tokio::io::duplex(64);
        let source: ByteSource = Box::pin(reader);
        let mut out = Vec::new();
        let done = Latch::new();
        done.set();

        assert_eq!(
            copy(source, &mut out, &done).await.unwrap_err(),
            RelayError::Cancelled(Party::Sender)
        );
    }

    #[test]
    fn test_duplicate_token_after_retry() {
        let coordinator = Coordinator::new(Arc::new(MemoryRegistry::new()), Arc::new(FixedTokens));
        coordinator.begin_transfer().unwrap();

        assert_eq!(
            coordinator.begin_transfer().unwrap_err(),
            RelayError::DuplicateToken
        );
        assert_eq!(coordinator.live_sessions(), 1);
    }

    #[tokio::test]
    async fn test_dropped_claim_releases_sender() {
        let coordinator = Arc::new(Coordinator::in_memory().unwrap());
        let token = coordinator.begin_transfer().unwrap();

        let claim = coordinator.claim_receiver(&token).unwrap();

        let c = coordinator.clone();
        let t = token.clone();
        let sender = tokio::spawn(async move {
            c.attach_sender(&t, Box::pin(&b"never delivered"[..])).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(claim);

        let result = tokio::time::timeout(Duration::from_secs(1), sender)
            .await
            .expect("sender must be released")
            .unwrap();
        assert_eq!(result.unwrap_err(), RelayError::Cancelled(Party::Receiver));
        assert!(coordinator.lookup(&token).is_none());
    }

    #[tokio::test]
    async fn test_dropped_sender_releases_receiver() {
        let coordinator = Arc::new(Coordinator::in_memory().unwrap());
        let token = coordinator.begin_transfer().unwrap();

        // Source that never produces data keeps the copy pending
        let (_writer, reader) = tokio::io::duplex(64);

        let c = coordinator.clone();
        let t = token.clone();
        let sender = tokio::spawn(async move { c.attach_sender(&t, Box::pin(reader)).await });

        let c = coordinator.clone();
        let t = token.clone();
        let receiver = tokio::spawn(async move { c.attach_receiver(&t, Vec::new()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        sender.abort();

        let result = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("receiver must be released")
            .unwrap();
        assert_eq!(result.unwrap_err(), RelayError::Cancelled(Party::Sender));
        assert!(coordinator.lookup(&token).is_none());
    }

    #[tokio::test]
    async fn test_evict_idle_releases_waiters() {
        let coordinator = Arc::new(Coordinator::in_memory().unwrap());
        let token = coordinator.begin_transfer().unwrap();

        let c = coordinator.clone();
        let t = token.clone();
        let receiver = tokio::spawn(async move { c.attach_receiver(&t, Vec::new()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(coordinator.evict_idle(Duration::from_secs(3600)), 0);
        assert_eq!(coordinator.evict_idle(Duration::ZERO), 1);

        let result = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("receiver must be released")
            .unwrap();
        assert_eq!(result.unwrap_err(), RelayError::Expired);
        assert_eq!(coordinator.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_reaper_stops_on_cancel() {
        let coordinator = Arc::new(Coordinator::in_memory().unwrap());
        coordinator.begin_transfer().unwrap();
        let cancel = CancellationToken::new();

        let handle = spawn_reaper(coordinator.clone(), Duration::ZERO, cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.live_sessions(), 0);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper must stop")
            .unwrap();
    }
}
