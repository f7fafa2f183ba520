use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info};
use uuid::Uuid;

use crate::batch::{self, Batch, BatchError, Transaction};
use crate::command::{Command, ReplyKind};
use crate::config::Config;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::gate::{Gate, GatePermit};
use crate::reply::CommandError;

#[derive(Debug, ThisError)]
pub enum ClientError {
    #[error("timed out waiting for an in-flight permit")]
    GateTimeout,
    #[error("connection is out of sync with the server and must be replaced")]
    Poisoned,
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// A connection guarded by an in-flight gate.
///
/// Each round trip (a single command, a pipeline or a transaction) holds one gate permit while it
/// runs. Share one [`Gate`] between clients through [`Client::with_gate`] to bound the total
/// across connections.
pub struct Client<S> {
    conn: Mutex<Connection<S>>,
    gate: Arc<Gate>,
    config: Config,
    poisoned: AtomicBool,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: Config) -> Client<S> {
        let gate = Arc::new(Gate::new(config.permits()));
        Client::with_gate(stream, config, gate)
    }

    pub fn with_gate(stream: S, config: Config, gate: Arc<Gate>) -> Client<S> {
        let conn = Connection::with_config(stream, &config);
        info!(connection_id = %conn.id(), permits = gate.max_count(), "client ready");

        Client {
            conn: Mutex::new(conn),
            gate,
            config,
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn gate(&self) -> &Arc<Gate> {
        &self.gate
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether the connection can no longer be trusted to be in sync. A round trip in progress
    /// counts as poisoned until it finishes cleanly.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    async fn acquire(&self) -> Result<(GatePermit<'_>, MutexGuard<'_, Connection<S>>), ClientError> {
        let permit = self
            .gate
            .acquire(Some(self.config.gate_timeout))
            .await
            .ok_or(ClientError::GateTimeout)?;

        let conn = self.conn.lock().await;
        if self.is_poisoned() {
            return Err(ClientError::Poisoned);
        }

        Ok((permit, conn))
    }

    /// Sends one command and waits for its reply.
    pub async fn send(&self, command: Command, kind: ReplyKind) -> Result<Frame, ClientError> {
        let (_permit, mut conn) = self.acquire().await?;
        let round_trip = RoundTrip::start(&self.poisoned, conn.id());

        let outcome = batch::send(&mut conn, command, kind).await;
        match &outcome {
            Err(err @ (CommandError::Transport(_) | CommandError::UnexpectedReply { .. })) => {
                round_trip.desynced(err)
            }
            _ => round_trip.finish(),
        }

        Ok(outcome?)
    }

    /// Flushes `batch` as a pipeline.
    pub async fn execute(&self, batch: &Batch) -> Result<(), ClientError> {
        let (_permit, mut conn) = self.acquire().await?;
        let round_trip = RoundTrip::start(&self.poisoned, conn.id());

        let result = batch.execute(&mut conn).await;
        round_trip.conclude(result.as_ref().err());

        Ok(result?)
    }

    /// Commits `transaction`. `Ok(false)` means a watched key changed and nothing ran.
    pub async fn commit(&self, transaction: &Transaction) -> Result<bool, ClientError> {
        let (_permit, mut conn) = self.acquire().await?;
        let round_trip = RoundTrip::start(&self.poisoned, conn.id());

        let result = transaction.commit(&mut conn).await;
        round_trip.conclude(result.as_ref().err());

        Ok(result?)
    }
}

/// Keeps the client poisoned while requests are on the wire and their replies unread.
///
/// Only a round trip that ends with the stream in sync clears the flag. One that is dropped
/// half way (the caller timed out, say) leaves it set.
struct RoundTrip<'a> {
    poisoned: &'a AtomicBool,
    connection_id: Uuid,
    done: bool,
}

impl<'a> RoundTrip<'a> {
    fn start(poisoned: &'a AtomicBool, connection_id: Uuid) -> RoundTrip<'a> {
        poisoned.store(true, Ordering::Release);
        RoundTrip {
            poisoned,
            connection_id,
            done: false,
        }
    }

    fn finish(mut self) {
        self.done = true;
        self.poisoned.store(false, Ordering::Release);
    }

    fn desynced(mut self, reason: &dyn fmt::Display) {
        self.done = true;
        error!(
            connection_id = %self.connection_id,
            %reason,
            "connection out of sync, refusing further use"
        );
    }

    fn conclude(self, err: Option<&BatchError>) {
        match err {
            Some(err) if err.poisons_connection() => self.desynced(err),
            _ => self.finish(),
        }
    }
}

impl Drop for RoundTrip<'_> {
    fn drop(&mut self) {
        if !self.done {
            error!(
                connection_id = %self.connection_id,
                "round trip abandoned before its replies were read, refusing further use"
            );
        }
    }
}
