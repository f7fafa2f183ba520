//! Request batching.
//!
//! A [`Batch`] queues commands and, when flushed, writes them back to back and matches the
//! replies to the callers by position, since RESP carries no request ids. The same queue and
//! state machine back the three ways of talking to a server:
//!
//! - [`send`]: one command, written and answered immediately.
//! - [`Batch::execute`]: a pipeline.
//! - [`Transaction::commit`]: a pipeline wrapped in `MULTI`/`EXEC`, optionally guarded by `WATCH`.
//!
//! ```text
//! Ready --expect--> WaitingCommit --execute/commit--> Executing --ok--> Ready
//!                   WaitingCommit --cancel/discard--> Ready
//!                                                     Executing --error--> Failed
//! ```
//!
//! Every queued request is settled exactly once, whatever happens to the batch.

use std::mem;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use strum_macros::Display;
use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument, warn};

use crate::command::{Command, ReplyKind};
use crate::connection::{self, Connection};
use crate::frame::Frame;
use crate::reply::{CommandError, Outcome, Reply, ReplySlot};

#[derive(Debug, ThisError)]
pub enum BatchError {
    #[error("batch is executing and cannot be changed")]
    Executing,
    #[error("batch has failed and cannot be reused")]
    Failed,
    #[error("transaction aborted; {0}")]
    Aborted(String),
    #[error("protocol error; expected {expected} reply, got {actual}")]
    UnexpectedReply { expected: String, actual: String },
    #[error("connection closed before every reply was read")]
    Closed,
    #[error(transparent)]
    Connection(#[from] connection::Error),
}

impl BatchError {
    /// Whether the connection the batch ran on can no longer be trusted to be in sync.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            BatchError::UnexpectedReply { .. } | BatchError::Closed | BatchError::Connection(_)
        )
    }

    /// What a request still pending when the batch failed is settled with.
    fn outcome(&self) -> CommandError {
        match self {
            BatchError::Aborted(msg) => CommandError::Server(msg.clone()),
            BatchError::Closed | BatchError::Connection(_) => {
                CommandError::Transport(self.to_string())
            }
            _ => CommandError::Cancelled,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum BatchState {
    Ready = 0,
    WaitingCommit = 1,
    Executing = 2,
    Failed = 3,
}

impl From<u8> for BatchState {
    fn from(value: u8) -> Self {
        match value {
            0 => BatchState::Ready,
            1 => BatchState::WaitingCommit,
            2 => BatchState::Executing,
            _ => BatchState::Failed,
        }
    }
}

/// One queued command and the slot its caller is waiting on.
#[derive(Debug)]
struct Pending {
    command: Command,
    kind: ReplyKind,
    slot: ReplySlot,
}

impl Pending {
    fn new(command: Command, kind: ReplyKind) -> (Pending, Reply) {
        let (slot, reply) = ReplySlot::new();
        (
            Pending {
                command,
                kind,
                slot,
            },
            reply,
        )
    }

    /// Settles the caller with `frame`. A reply of the wrong shape settles the caller with an
    /// error and is reported back so the rest of the batch can be abandoned.
    fn resolve(&mut self, frame: Frame) -> Result<(), BatchError> {
        if let Frame::Error(msg) = frame {
            self.slot.settle(Err(CommandError::Server(msg)));
            return Ok(());
        }

        if self.kind.accepts(&frame) {
            self.slot.settle(Ok(frame));
            return Ok(());
        }

        self.slot.settle(Err(CommandError::UnexpectedReply {
            expected: self.kind,
            actual: frame.kind().to_string(),
        }));
        Err(BatchError::UnexpectedReply {
            expected: self.kind.to_string(),
            actual: frame.kind().to_string(),
        })
    }
}

fn settle_all(pending: &mut [Pending], outcome: &CommandError) -> usize {
    pending
        .iter_mut()
        .map(|p| p.slot.settle(Err(outcome.clone())))
        .filter(|settled| *settled)
        .count()
}

fn cancel_all(pending: &mut [Pending]) -> usize {
    pending
        .iter_mut()
        .map(|p| p.slot.cancel())
        .filter(|cancelled| *cancelled)
        .count()
}

async fn read_reply<S>(conn: &mut Connection<S>) -> Result<Frame, BatchError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.read_frame().await?.ok_or(BatchError::Closed)
}

/// Writes every pending command, then resolves each one with its reply, in order.
async fn flush<S>(pending: &mut [Pending], conn: &mut Connection<S>) -> Result<(), BatchError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.write_commands(pending.iter().map(|p| &p.command)).await?;

    for p in pending.iter_mut() {
        let frame = read_reply(conn).await?;
        p.resolve(frame)?;
    }

    Ok(())
}

/// Sends a single command and waits for its reply: a batch of one, committed on the spot.
pub async fn send<S>(conn: &mut Connection<S>, command: Command, kind: ReplyKind) -> Outcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (pending, reply) = Pending::new(command, kind);
    let mut pending = [pending];

    if let Err(err) = flush(&mut pending, conn).await {
        warn!(%err, "command failed");
        settle_all(&mut pending, &err.outcome());
    }

    reply.await
}

/// An ordered queue of commands flushed together.
#[derive(Debug)]
pub struct Batch {
    state: AtomicU8,
    queue: Mutex<Vec<Pending>>,
}

impl Default for Batch {
    fn default() -> Self {
        Batch::new()
    }
}

impl Batch {
    pub fn new() -> Batch {
        Batch {
            state: AtomicU8::new(BatchState::Ready as u8),
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> BatchState {
        BatchState::from(self.state.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_queue(&self) -> MutexGuard<'_, Vec<Pending>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, from: BatchState, to: BatchState) -> Result<(), BatchState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| debug!(%from, %to, "batch state changed"))
            .map_err(BatchState::from)
    }

    fn set_state(&self, to: BatchState) {
        let from = BatchState::from(self.state.swap(to as u8, Ordering::AcqRel));
        debug!(%from, %to, "batch state changed");
    }

    /// Queues `command` and returns the handle its reply will arrive on. Nothing is sent until
    /// the batch is flushed.
    pub fn expect(&self, command: Command, kind: ReplyKind) -> Result<Reply, BatchError> {
        let mut queue = self.lock_queue();

        match self.transition(BatchState::Ready, BatchState::WaitingCommit) {
            Ok(()) | Err(BatchState::WaitingCommit) => {}
            Err(BatchState::Executing) => return Err(BatchError::Executing),
            Err(_) => return Err(BatchError::Failed),
        }

        let (pending, reply) = Pending::new(command, kind);
        queue.push(pending);

        Ok(reply)
    }

    /// Moves to `Executing` and takes the queue. `None` when there is nothing to send.
    fn begin(&self) -> Result<Option<Flight<'_>>, BatchError> {
        let mut queue = self.lock_queue();

        match self.transition(BatchState::WaitingCommit, BatchState::Executing) {
            Ok(()) => Ok(Some(Flight {
                batch: self,
                pending: mem::take(&mut *queue),
                concluded: false,
            })),
            Err(BatchState::Ready) => Ok(None),
            Err(BatchState::Executing) => Err(BatchError::Executing),
            Err(_) => Err(BatchError::Failed),
        }
    }

    /// Pipeline flush: sends every queued command without waiting, then hands each reply to its
    /// caller in order. A failure part way through settles every request not yet answered with
    /// that failure and leaves the batch `Failed`. Dropping the future before it completes does
    /// the same, with every unanswered request cancelled.
    ///
    /// A batch that is `Ready`, including one that was just executed, has nothing to send: this
    /// returns `Ok(())` without touching the connection.
    #[instrument(skip_all, fields(connection_id = %conn.id()))]
    pub async fn execute<S>(&self, conn: &mut Connection<S>) -> Result<(), BatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(mut flight) = self.begin()? else {
            return Ok(());
        };

        debug!(commands = flight.pending.len(), "executing pipeline");
        let result = flush(&mut flight.pending, conn).await;
        flight.conclude(result)
    }

    /// Drops every queued command without touching the connection. Returns how many callers
    /// were cancelled.
    pub fn cancel(&self) -> Result<usize, BatchError> {
        let mut queue = self.lock_queue();

        match self.transition(BatchState::WaitingCommit, BatchState::Ready) {
            Ok(()) | Err(BatchState::Ready) => Ok(cancel_all(&mut mem::take(&mut *queue))),
            Err(BatchState::Executing) => Err(BatchError::Executing),
            Err(_) => Err(BatchError::Failed),
        }
    }
}

/// The requests taken out of a batch for one flush, holding the batch in `Executing`.
///
/// Dropped without [`Flight::conclude`], it cancels every unsettled request and leaves the batch
/// `Failed`: the replies may still be on the wire.
struct Flight<'a> {
    batch: &'a Batch,
    pending: Vec<Pending>,
    concluded: bool,
}

impl Flight<'_> {
    /// Settles whatever the flush left pending and moves the batch to the terminal state.
    fn conclude(mut self, result: Result<(), BatchError>) -> Result<(), BatchError> {
        self.concluded = true;

        match result {
            Ok(()) => {
                let cancelled = cancel_all(&mut self.pending);
                if cancelled > 0 {
                    warn!(cancelled, "requests left without a reply were cancelled");
                }
                self.batch.set_state(BatchState::Ready);
                Ok(())
            }
            Err(err) => {
                let settled = settle_all(&mut self.pending, &err.outcome());
                warn!(%err, settled, "batch failed");
                self.batch.set_state(BatchState::Failed);
                Err(err)
            }
        }
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if self.concluded {
            return;
        }

        let cancelled = cancel_all(&mut self.pending);
        warn!(cancelled, "batch abandoned while executing");
        self.batch.set_state(BatchState::Failed);
    }
}

/// A `MULTI`/`EXEC` transaction with optimistic locking through `WATCH`.
#[derive(Debug, Default)]
pub struct Transaction {
    batch: Batch,
    watched: Mutex<Vec<Bytes>>,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction::default()
    }

    pub fn state(&self) -> BatchState {
        self.batch.state()
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    fn lock_watched(&self) -> Result<MutexGuard<'_, Vec<Bytes>>, BatchError> {
        let watched = self
            .watched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match self.batch.state() {
            BatchState::Executing => Err(BatchError::Executing),
            BatchState::Failed => Err(BatchError::Failed),
            _ => Ok(watched),
        }
    }

    /// Registers keys whose modification by anyone else before `EXEC` aborts the transaction.
    pub fn watch<I, K>(&self, keys: I) -> Result<(), BatchError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let mut watched = self.lock_watched()?;
        watched.extend(
            keys.into_iter()
                .map(|key| Bytes::copy_from_slice(key.as_ref())),
        );
        Ok(())
    }

    /// Forgets every watched key. Keys are only sent on commit, so this never touches a
    /// connection.
    pub fn unwatch(&self) -> Result<(), BatchError> {
        self.lock_watched()?.clear();
        Ok(())
    }

    pub fn watched(&self) -> Vec<Bytes> {
        self.watched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn expect(&self, command: Command, kind: ReplyKind) -> Result<Reply, BatchError> {
        self.batch.expect(command, kind)
    }

    /// Cancels every queued command and forgets the watched keys.
    pub fn discard(&self) -> Result<usize, BatchError> {
        let cancelled = self.batch.cancel()?;
        self.unwatch()?;
        Ok(cancelled)
    }

    /// Runs the transaction. Returns `Ok(false)` when a watched key changed and the server
    /// aborted it, in which case every queued command is cancelled.
    ///
    /// With nothing queued, including right after a commit, this returns `Ok(true)` and forgets
    /// the watched keys without touching the connection. Dropping the future part way through
    /// cancels every unanswered command and leaves the transaction `Failed`.
    #[instrument(skip_all, fields(connection_id = %conn.id()))]
    pub async fn commit<S>(&self, conn: &mut Connection<S>) -> Result<bool, BatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(mut flight) = self.batch.begin()? else {
            self.lock_watched()?.clear();
            return Ok(true);
        };
        let watched = mem::take(
            &mut *self
                .watched
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        debug!(
            commands = flight.pending.len(),
            watched = watched.len(),
            "committing transaction"
        );

        match run_transaction(&mut flight.pending, &watched, conn).await {
            Ok(committed) => flight.conclude(Ok(())).map(|_| committed),
            Err(err) => flight.conclude(Err(err)).map(|_| false),
        }
    }
}

async fn run_transaction<S>(
    pending: &mut [Pending],
    watched: &[Bytes],
    conn: &mut Connection<S>,
) -> Result<bool, BatchError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let watch = (!watched.is_empty()).then(|| Command::watch(watched));
    let multi = Command::multi();
    let exec = Command::exec();

    conn.write_commands(
        watch
            .iter()
            .chain([&multi])
            .chain(pending.iter().map(|p| &p.command))
            .chain([&exec]),
    )
    .await?;

    // Every reply is read before any is interpreted, so a rejected step still leaves the
    // connection in sync.
    let expected = usize::from(watch.is_some()) + 1 + pending.len() + 1;
    let mut replies = Vec::with_capacity(expected);
    for _ in 0..expected {
        replies.push(read_reply(conn).await?);
    }
    let mut replies = replies.into_iter();

    if watch.is_some() {
        expect_ok("WATCH", replies.next())?;
    }
    expect_ok("MULTI", replies.next())?;

    // Positions of the commands the server queued. `EXEC` answers only for those.
    let mut queued = Vec::with_capacity(pending.len());
    for (i, p) in pending.iter_mut().enumerate() {
        match replies.next() {
            Some(Frame::Simple(s)) if s == "QUEUED" => queued.push(i),
            // The server refused to queue it. Most servers then answer EXEC with EXECABORT.
            Some(Frame::Error(msg)) => {
                p.slot.settle(Err(CommandError::Server(msg)));
            }
            other => return Err(unexpected("QUEUED", other)),
        }
    }

    match replies.next() {
        Some(Frame::NullArray) => {
            let cancelled = cancel_all(pending);
            debug!(cancelled, "transaction aborted by a watched key");
            Ok(false)
        }
        Some(Frame::Array(results)) => {
            if results.len() != queued.len() {
                warn!(
                    queued = queued.len(),
                    results = results.len(),
                    "EXEC reply does not match the queued commands"
                );
            }
            for (i, frame) in queued.into_iter().zip(results) {
                pending[i].resolve(frame)?;
            }
            // Requests past the end of a short reply are cancelled by `conclude`.
            Ok(true)
        }
        Some(Frame::Error(msg)) => Err(BatchError::Aborted(msg)),
        other => Err(unexpected("array", other)),
    }
}

fn expect_ok(step: &str, reply: Option<Frame>) -> Result<(), BatchError> {
    match reply {
        Some(Frame::Simple(s)) if s == "OK" => Ok(()),
        Some(Frame::Error(msg)) => Err(BatchError::Aborted(format!("{} failed: {}", step, msg))),
        other => Err(unexpected("OK", other)),
    }
}

fn unexpected(expected: &str, actual: Option<Frame>) -> BatchError {
    BatchError::UnexpectedReply {
        expected: expected.to_string(),
        actual: actual.map_or("nothing", |frame| frame.kind()).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Feeds canned replies to the client half once it has written something.
    fn serve(replies: &'static [u8]) -> Connection<DuplexStream> {
        let (client, mut server) = duplex(64 * 1024);

        tokio::spawn(async move {
            let mut request = [0u8; 1];
            if server.read_exact(&mut request).await.is_ok() {
                let _ = server.write_all(replies).await;
            }
            // Keep the stream open until the client is done with it.
            let mut sink = Vec::new();
            let _ = server.read_to_end(&mut sink).await;
        });

        Connection::new(client)
    }

    #[test]
    fn expect_moves_to_waiting_commit() {
        let batch = Batch::new();
        assert_eq!(batch.state(), BatchState::Ready);

        let _reply = batch.expect(Command::new("PING"), ReplyKind::Status).unwrap();

        assert_eq!(batch.state(), BatchState::WaitingCommit);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn expect_rejected_while_executing() {
        let batch = Batch::new();
        let _reply = batch.expect(Command::new("PING"), ReplyKind::Status).unwrap();
        let flight = batch.begin().unwrap().unwrap();

        assert_eq!(batch.state(), BatchState::Executing);
        assert!(matches!(
            batch.expect(Command::new("PING"), ReplyKind::Status),
            Err(BatchError::Executing)
        ));
        assert!(matches!(batch.cancel(), Err(BatchError::Executing)));
        assert!(matches!(batch.begin(), Err(BatchError::Executing)));

        flight.conclude(Ok(())).unwrap();
        assert_eq!(batch.state(), BatchState::Ready);
    }

    #[tokio::test]
    async fn cancel_settles_every_reply() {
        let batch = Batch::new();
        let first = batch.expect(Command::new("GET").arg("a"), ReplyKind::Bulk).unwrap();
        let second = batch.expect(Command::new("GET").arg("b"), ReplyKind::Bulk).unwrap();

        assert_eq!(batch.cancel().unwrap(), 2);
        assert_eq!(batch.state(), BatchState::Ready);
        assert!(batch.is_empty());

        assert_eq!(first.await, Err(CommandError::Cancelled));
        assert_eq!(second.await, Err(CommandError::Cancelled));
    }

    #[tokio::test]
    async fn execute_empty_batch_is_a_no_op() {
        let (client, _server) = duplex(64);
        let mut conn = Connection::new(client);
        let batch = Batch::new();

        batch.execute(&mut conn).await.unwrap();
        assert_eq!(batch.state(), BatchState::Ready);
    }

    #[tokio::test]
    async fn execute_after_success_has_nothing_to_send() {
        let (client, mut server) = duplex(1024);
        let mut conn = Connection::new(client);
        let batch = Batch::new();

        let reply = batch.expect(Command::new("PING"), ReplyKind::Status).unwrap();
        server.write_all(b"+PONG\r\n").await.unwrap();
        batch.execute(&mut conn).await.unwrap();
        assert_eq!(reply.await, Ok(Frame::Simple("PONG".to_string())));

        let mut request = vec![0u8; Command::new("PING").to_bytes().len()];
        server.read_exact(&mut request).await.unwrap();

        batch.execute(&mut conn).await.unwrap();
        assert_eq!(batch.state(), BatchState::Ready);

        drop(conn);
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_execute_fails_the_batch() {
        let (client, _server) = duplex(1024);
        let mut conn = Connection::new(client);
        let batch = Batch::new();

        let reply = batch.expect(Command::new("GET").arg("a"), ReplyKind::Bulk).unwrap();
        let result = tokio::time::timeout(Duration::from_millis(20), batch.execute(&mut conn)).await;

        assert!(result.is_err());
        assert_eq!(batch.state(), BatchState::Failed);
        assert_eq!(reply.await, Err(CommandError::Cancelled));
        assert!(matches!(
            batch.expect(Command::new("PING"), ReplyKind::Status),
            Err(BatchError::Failed)
        ));
        assert!(matches!(batch.cancel(), Err(BatchError::Failed)));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_commit_fails_the_transaction() {
        let (client, _server) = duplex(1024);
        let mut conn = Connection::new(client);
        let tx = Transaction::new();

        let reply = tx.expect(Command::new("INCR").arg("a"), ReplyKind::Integer).unwrap();
        let result = tokio::time::timeout(Duration::from_millis(20), tx.commit(&mut conn)).await;

        assert!(result.is_err());
        assert_eq!(tx.state(), BatchState::Failed);
        assert_eq!(reply.await, Err(CommandError::Cancelled));
    }

    #[tokio::test]
    async fn pipeline_replies_in_order() {
        let mut conn = serve(b"+OK\r\n:2\r\n$-1\r\n-ERR wrong type\r\n");
        let batch = Batch::new();

        let set = batch.expect(Command::new("SET").arg("a").arg("1"), ReplyKind::Ack).unwrap();
        let incr = batch.expect(Command::new("INCR").arg("a"), ReplyKind::Integer).unwrap();
        let get = batch.expect(Command::new("GET").arg("b"), ReplyKind::Bulk).unwrap();
        let bad = batch.expect(Command::new("LPOP").arg("a"), ReplyKind::Bulk).unwrap();

        batch.execute(&mut conn).await.unwrap();

        assert_eq!(batch.state(), BatchState::Ready);
        assert_eq!(set.await, Ok(Frame::Simple("OK".to_string())));
        assert_eq!(incr.await, Ok(Frame::Integer(2)));
        assert_eq!(get.await, Ok(Frame::NullBulk));
        assert_eq!(
            bad.await,
            Err(CommandError::Server("ERR wrong type".to_string()))
        );
    }

    #[tokio::test]
    async fn unexpected_reply_cancels_the_rest() {
        let mut conn = serve(b":1\r\n+OK\r\n:3\r\n");
        let batch = Batch::new();

        let first = batch.expect(Command::new("INCR").arg("a"), ReplyKind::Integer).unwrap();
        let second = batch.expect(Command::new("INCR").arg("b"), ReplyKind::Integer).unwrap();
        let third = batch.expect(Command::new("INCR").arg("c"), ReplyKind::Integer).unwrap();

        let err = batch.execute(&mut conn).await.unwrap_err();

        assert!(matches!(err, BatchError::UnexpectedReply { .. }));
        assert!(err.poisons_connection());
        assert_eq!(batch.state(), BatchState::Failed);
        assert_eq!(first.await, Ok(Frame::Integer(1)));
        assert!(matches!(
            second.await,
            Err(CommandError::UnexpectedReply {
                expected: ReplyKind::Integer,
                ..
            })
        ));
        assert_eq!(third.await, Err(CommandError::Cancelled));

        assert!(matches!(
            batch.expect(Command::new("PING"), ReplyKind::Status),
            Err(BatchError::Failed)
        ));
    }

    #[tokio::test]
    async fn connection_closed_mid_pipeline() {
        let (client, mut server) = duplex(1024);
        let mut conn = Connection::new(client);

        tokio::spawn(async move {
            let mut request = [0u8; 1];
            server.read_exact(&mut request).await.unwrap();
            server.write_all(b":1\r\n").await.unwrap();
        });

        let batch = Batch::new();
        let first = batch.expect(Command::new("INCR").arg("a"), ReplyKind::Integer).unwrap();
        let second = batch.expect(Command::new("INCR").arg("b"), ReplyKind::Integer).unwrap();

        let err = batch.execute(&mut conn).await.unwrap_err();

        assert!(matches!(err, BatchError::Closed));
        assert_eq!(batch.state(), BatchState::Failed);
        assert_eq!(first.await, Ok(Frame::Integer(1)));
        assert!(matches!(second.await, Err(CommandError::Transport(_))));
    }

    #[tokio::test]
    async fn send_returns_the_command_outcome() {
        let mut conn = serve(b"$3\r\nbar\r\n");

        let outcome = send(&mut conn, Command::new("GET").arg("foo"), ReplyKind::Bulk).await;

        assert_eq!(outcome, Ok(Frame::Bulk(Bytes::from("bar"))));
    }

    #[tokio::test]
    async fn send_surfaces_server_errors() {
        let mut conn = serve(b"-ERR unknown command\r\n");

        let outcome = send(&mut conn, Command::new("NOPE"), ReplyKind::Any).await;

        assert_eq!(
            outcome,
            Err(CommandError::Server("ERR unknown command".to_string()))
        );
    }

    #[tokio::test]
    async fn transaction_commits() {
        let mut conn = serve(b"+OK\r\n+OK\r\n+QUEUED\r\n+QUEUED\r\n*2\r\n+OK\r\n:5\r\n");
        let tx = Transaction::new();

        tx.watch(["balance"]).unwrap();
        let set = tx.expect(Command::new("SET").arg("a").arg("4"), ReplyKind::Ack).unwrap();
        let incr = tx.expect(Command::new("INCR").arg("a"), ReplyKind::Integer).unwrap();

        assert!(tx.commit(&mut conn).await.unwrap());

        assert_eq!(tx.state(), BatchState::Ready);
        assert!(tx.watched().is_empty());
        assert_eq!(set.await, Ok(Frame::Simple("OK".to_string())));
        assert_eq!(incr.await, Ok(Frame::Integer(5)));
    }

    #[tokio::test]
    async fn transaction_aborted_by_watch_cancels_everything() {
        let mut conn = serve(b"+OK\r\n+OK\r\n+QUEUED\r\n+QUEUED\r\n*-1\r\n");
        let tx = Transaction::new();

        tx.watch(["balance"]).unwrap();
        let first = tx.expect(Command::new("DECR").arg("balance"), ReplyKind::Integer).unwrap();
        let second = tx.expect(Command::new("INCR").arg("spent"), ReplyKind::Integer).unwrap();

        assert!(!tx.commit(&mut conn).await.unwrap());

        assert_eq!(tx.state(), BatchState::Ready);
        assert_eq!(first.await, Err(CommandError::Cancelled));
        assert_eq!(second.await, Err(CommandError::Cancelled));
    }

    #[tokio::test]
    async fn transaction_short_exec_reply_cancels_remainder() {
        let mut conn = serve(b"+OK\r\n+QUEUED\r\n+QUEUED\r\n*1\r\n:1\r\n");
        let tx = Transaction::new();

        let first = tx.expect(Command::new("INCR").arg("a"), ReplyKind::Integer).unwrap();
        let second = tx.expect(Command::new("INCR").arg("b"), ReplyKind::Integer).unwrap();

        assert!(tx.commit(&mut conn).await.unwrap());

        assert_eq!(first.await, Ok(Frame::Integer(1)));
        assert_eq!(second.await, Err(CommandError::Cancelled));
    }

    #[tokio::test]
    async fn transaction_execabort() {
        let mut conn = serve(
            b"+OK\r\n-ERR unknown command 'NOPE'\r\n+QUEUED\r\n-EXECABORT Transaction discarded\r\n",
        );
        let tx = Transaction::new();

        let nope = tx.expect(Command::new("NOPE"), ReplyKind::Any).unwrap();
        let incr = tx.expect(Command::new("INCR").arg("a"), ReplyKind::Integer).unwrap();

        let err = tx.commit(&mut conn).await.unwrap_err();

        assert!(matches!(err, BatchError::Aborted(_)));
        assert!(!err.poisons_connection());
        assert_eq!(tx.state(), BatchState::Failed);
        assert_eq!(
            nope.await,
            Err(CommandError::Server("ERR unknown command 'NOPE'".to_string()))
        );
        assert_eq!(
            incr.await,
            Err(CommandError::Server(
                "EXECABORT Transaction discarded".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn transaction_refused_command_keeps_exec_replies_aligned() {
        let mut conn = serve(b"+OK\r\n-ERR unknown command 'NOPE'\r\n+QUEUED\r\n*1\r\n:5\r\n");
        let tx = Transaction::new();

        let nope = tx.expect(Command::new("NOPE"), ReplyKind::Any).unwrap();
        let incr = tx.expect(Command::new("INCR").arg("a"), ReplyKind::Integer).unwrap();

        assert!(tx.commit(&mut conn).await.unwrap());

        assert_eq!(tx.state(), BatchState::Ready);
        assert_eq!(
            nope.await,
            Err(CommandError::Server("ERR unknown command 'NOPE'".to_string()))
        );
        assert_eq!(incr.await, Ok(Frame::Integer(5)));
    }

    #[test]
    fn watch_rejected_while_executing() {
        let tx = Transaction::new();
        let _reply = tx.expect(Command::new("PING"), ReplyKind::Status).unwrap();
        let flight = tx.batch.begin().unwrap().unwrap();

        assert!(matches!(tx.watch(["k"]), Err(BatchError::Executing)));
        assert!(matches!(tx.unwatch(), Err(BatchError::Executing)));

        flight.conclude(Ok(())).unwrap();
        tx.watch(["k"]).unwrap();
        assert_eq!(tx.watched(), vec![Bytes::from("k")]);
    }

    #[tokio::test]
    async fn discard_cancels_and_unwatches() {
        let tx = Transaction::new();
        tx.watch(["a", "b"]).unwrap();
        let reply = tx.expect(Command::new("INCR").arg("a"), ReplyKind::Integer).unwrap();

        assert_eq!(tx.discard().unwrap(), 1);

        assert!(tx.watched().is_empty());
        assert_eq!(tx.state(), BatchState::Ready);
        assert_eq!(reply.await, Err(CommandError::Cancelled));
    }

    #[tokio::test]
    async fn failure_pass_never_overwrites_a_settled_reply() {
        let (first, first_reply) = Pending::new(Command::new("GET").arg("a"), ReplyKind::Bulk);
        let (second, second_reply) = Pending::new(Command::new("GET").arg("b"), ReplyKind::Bulk);
        let mut pending = vec![first, second];

        pending[0].resolve(Frame::Bulk(Bytes::from("1"))).unwrap();
        assert_eq!(settle_all(&mut pending, &CommandError::Cancelled), 1);
        assert_eq!(cancel_all(&mut pending), 0);

        assert_eq!(first_reply.await, Ok(Frame::Bulk(Bytes::from("1"))));
        assert_eq!(second_reply.await, Err(CommandError::Cancelled));
    }
}
