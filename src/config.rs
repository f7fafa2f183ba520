use std::time::Duration;

use crate::frame;

/// Tunables for the protocol engine. The library never reads the environment; binaries map their
/// own arguments onto this struct.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Largest amount of buffered, not yet decoded input accepted before the stream is treated as
    /// hostile or corrupt.
    pub max_frame_size: usize,
    /// How many array levels a reply may nest before it is rejected as corrupt.
    pub max_nesting_depth: usize,
    /// Initial capacity of a connection's read buffer.
    pub read_buffer_capacity: usize,
    /// Requested number of round trips allowed in flight at once. Clamped by
    /// [`Config::permits`].
    pub max_in_flight: usize,
    /// How long a client waits for an in-flight permit before giving up.
    pub gate_timeout: Duration,
}

impl Config {
    pub const MIN_PERMITS: usize = 1;
    pub const MAX_PERMITS: usize = 1024;

    /// `max_in_flight` clamped into `[MIN_PERMITS, MAX_PERMITS]`.
    pub fn permits(&self) -> usize {
        clamp_permits(self.max_in_flight)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_frame_size: 512 * 1024 * 1024,
            max_nesting_depth: frame::DEFAULT_MAX_DEPTH,
            // 4kb, enough for the typical reply without reallocating.
            read_buffer_capacity: 4096,
            max_in_flight: 16,
            gate_timeout: Duration::from_secs(5),
        }
    }
}

pub(crate) fn clamp_permits(requested: usize) -> usize {
    requested.clamp(Config::MIN_PERMITS, Config::MAX_PERMITS)
}
