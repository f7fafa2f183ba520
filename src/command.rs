use std::fmt;

use bytes::Bytes;
use itertools::Itertools;
use strum_macros::{Display, EnumString};

use crate::frame::Frame;
use crate::slot::Key;

/// A command as sent by a client: the name followed by binary-safe arguments, always encoded as a
/// RESP array of bulk strings.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    parts: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl AsRef<[u8]>) -> Command {
        Command {
            parts: vec![Bytes::copy_from_slice(name.as_ref())],
        }
    }

    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Command {
        self.parts.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    pub fn int_arg(self, arg: i64) -> Command {
        self.arg(arg.to_string())
    }

    pub fn args<I, A>(self, args: I) -> Command
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        args.into_iter().fold(self, |cmd, arg| cmd.arg(arg))
    }

    /// Upper-cased command name.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.parts[0]).to_uppercase()
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn flags(&self) -> CommandFlags {
        CommandFlags::of(&self.name())
    }

    /// The key used for cluster routing: the first argument of keyed commands.
    pub fn first_key(&self) -> Option<Key> {
        if !self.flags().keyed {
            return None;
        }
        self.parts.get(1).cloned().map(Key::new)
    }

    pub fn slot(&self) -> Option<u16> {
        self.first_key().map(|key| key.slot())
    }

    pub fn to_frame(&self) -> Frame {
        Frame::Array(self.parts.iter().cloned().map(Frame::Bulk).collect())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_frame().serialize()
    }

    pub fn multi() -> Command {
        Command::new("MULTI")
    }

    pub fn exec() -> Command {
        Command::new("EXEC")
    }

    pub fn watch<I, K>(keys: I) -> Command
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        Command::new("WATCH").args(keys)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.parts
                .iter()
                .map(|part| String::from_utf8_lossy(part))
                .join(" ")
        )
    }
}

/// The shape of reply a caller expects. Error frames are always accepted and surface as
/// [`crate::reply::CommandError::Server`]; anything else outside the expected shape means the
/// replies are no longer lined up with the requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ReplyKind {
    Any,
    /// `+OK`
    Ack,
    /// Any simple string, e.g. `+QUEUED` or `+PONG`.
    Status,
    Integer,
    /// Bulk string or null bulk string.
    Bulk,
    /// Array or null array.
    Array,
}

impl ReplyKind {
    pub fn accepts(&self, frame: &Frame) -> bool {
        match (self, frame) {
            (_, Frame::Error(_)) => true,
            (ReplyKind::Any, _) => true,
            (ReplyKind::Ack, Frame::Simple(s)) => s == "OK",
            (ReplyKind::Status, Frame::Simple(_)) => true,
            (ReplyKind::Integer, Frame::Integer(_)) => true,
            (ReplyKind::Bulk, Frame::Bulk(_) | Frame::NullBulk) => true,
            (ReplyKind::Array, Frame::Array(_) | Frame::NullArray) => true,
            _ => false,
        }
    }
}

/// Static classification of a command by name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandFlags {
    /// Mutates data; must go to a primary.
    pub write: bool,
    /// Only reads; any replica may serve it.
    pub readonly: bool,
    /// Server administration.
    pub admin: bool,
    /// The first argument is a key, used for cluster routing.
    pub keyed: bool,
    /// Operates on the selected database, so the connection needs a DB index.
    pub database: bool,
}

impl CommandFlags {
    const NONE: CommandFlags = CommandFlags {
        write: false,
        readonly: false,
        admin: false,
        keyed: false,
        database: false,
    };
    const READ: CommandFlags = CommandFlags {
        readonly: true,
        keyed: true,
        database: true,
        ..CommandFlags::NONE
    };
    const WRITE: CommandFlags = CommandFlags {
        write: true,
        keyed: true,
        database: true,
        ..CommandFlags::NONE
    };
    const ADMIN: CommandFlags = CommandFlags {
        admin: true,
        ..CommandFlags::NONE
    };
    const DB_READ: CommandFlags = CommandFlags {
        readonly: true,
        database: true,
        ..CommandFlags::NONE
    };
    const DB_ADMIN: CommandFlags = CommandFlags {
        write: true,
        admin: true,
        database: true,
        ..CommandFlags::NONE
    };

    /// Flags for an upper-cased command name. Unknown commands get no flags.
    pub fn of(name: &str) -> CommandFlags {
        match name {
            "GET" | "MGET" | "GETRANGE" | "STRLEN" | "EXISTS" | "TYPE" | "TTL" | "PTTL"
            | "HGET" | "HMGET" | "HGETALL" | "HKEYS" | "HVALS" | "HLEN" | "HEXISTS" | "LRANGE"
            | "LLEN" | "LINDEX" | "SMEMBERS" | "SISMEMBER" | "SCARD" | "SRANDMEMBER" | "ZRANGE"
            | "ZRANGEBYSCORE" | "ZSCORE" | "ZCARD" | "ZRANK" | "ZCOUNT" | "GEOPOS" | "GEODIST"
            | "GEOHASH" | "BITCOUNT" | "GETBIT" | "DUMP" => CommandFlags::READ,
            "SET" | "SETNX" | "SETEX" | "PSETEX" | "MSET" | "GETSET" | "GETDEL" | "APPEND"
            | "SETRANGE" | "INCR" | "INCRBY" | "INCRBYFLOAT" | "DECR" | "DECRBY" | "DEL"
            | "UNLINK" | "EXPIRE" | "PEXPIRE" | "EXPIREAT" | "PERSIST" | "RENAME" | "HSET"
            | "HSETNX" | "HMSET" | "HDEL" | "HINCRBY" | "LPUSH" | "RPUSH" | "LPOP" | "RPOP"
            | "LSET" | "LREM" | "LTRIM" | "SADD" | "SREM" | "SPOP" | "ZADD" | "ZREM"
            | "ZINCRBY" | "GEOADD" | "SETBIT" | "RESTORE" => CommandFlags::WRITE,
            "DBSIZE" | "KEYS" | "SCAN" | "RANDOMKEY" => CommandFlags::DB_READ,
            "FLUSHDB" | "FLUSHALL" | "SWAPDB" => CommandFlags::DB_ADMIN,
            "INFO" | "CONFIG" | "CLIENT" | "SLOWLOG" | "SHUTDOWN" | "SAVE" | "BGSAVE"
            | "BGREWRITEAOF" | "LASTSAVE" | "DEBUG" | "CLUSTER" | "SENTINEL" | "REPLICAOF"
            | "SLAVEOF" | "ROLE" | "MONITOR" => CommandFlags::ADMIN,
            _ => CommandFlags::NONE,
        }
    }

    pub fn any_replica(&self) -> bool {
        self.readonly
    }

    pub fn needs_db(&self) -> bool {
        self.database
    }
}
