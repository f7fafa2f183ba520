pub mod batch;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod frame;
pub mod gate;
pub mod reply;
pub mod slot;

pub use batch::{Batch, BatchError, BatchState, Transaction};
pub use client::{Client, ClientError};
pub use command::{Command, CommandFlags, ReplyKind};
pub use config::Config;
pub use connection::Connection;
pub use frame::{Frame, ParseCursor};
pub use gate::Gate;
pub use reply::{CommandError, Reply};
pub use slot::{hash_slot, Key};

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
