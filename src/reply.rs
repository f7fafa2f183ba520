use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error as ThisError;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::debug;

use crate::command::ReplyKind;
use crate::frame::Frame;

/// Why a single command did not produce a value. This is all a caller waiting on one command ever
/// sees; batch bookkeeping stays behind [`crate::batch`].
#[derive(Clone, Debug, PartialEq, ThisError)]
pub enum CommandError {
    /// The server answered with a RESP error frame.
    #[error("{0}")]
    Server(String),
    #[error("command cancelled")]
    Cancelled,
    #[error("transport error; {0}")]
    Transport(String),
    #[error("protocol error; expected {expected} reply, got {actual}")]
    UnexpectedReply { expected: ReplyKind, actual: String },
}

pub type Outcome = Result<Frame, CommandError>;

/// Write side of a single-assignment result cell.
///
/// The first `settle` wins; later ones are ignored and report `false`. Dropping an unsettled slot
/// resolves the paired [`Reply`] as cancelled.
#[derive(Debug)]
pub struct ReplySlot {
    tx: Option<oneshot::Sender<Outcome>>,
}

impl ReplySlot {
    pub fn new() -> (ReplySlot, Reply) {
        let (tx, rx) = oneshot::channel();
        (ReplySlot { tx: Some(tx) }, Reply { rx })
    }

    pub fn settle(&mut self, outcome: Outcome) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // The caller may have dropped its handle; the slot is settled either way.
                let _ = tx.send(outcome);
                true
            }
            None => {
                debug!(?outcome, "ignoring second settle of a reply slot");
                false
            }
        }
    }

    pub fn cancel(&mut self) -> bool {
        self.settle(Err(CommandError::Cancelled))
    }

    pub fn is_settled(&self) -> bool {
        self.tx.is_none()
    }
}

/// Caller's handle on a command that may not have been sent yet. Resolves once the engine
/// settles the matching [`ReplySlot`].
#[derive(Debug)]
pub struct Reply {
    rx: oneshot::Receiver<Outcome>,
}

impl Reply {
    /// Non-blocking check: `None` while the command is still pending.
    pub fn try_take(&mut self) -> Option<Outcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(CommandError::Cancelled)),
        }
    }
}

impl Future for Reply {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CommandError::Cancelled)))
    }
}
