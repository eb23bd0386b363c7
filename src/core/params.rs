//! Protocol parameters shared by servers and clients.

use std::time::Duration;

use super::constants::{
    DEFAULT_EPOCH, DEFAULT_EPOCH_LIMIT, DEFAULT_READ_BUFFER, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE,
};
use super::error::ConfigError;

/// Tunable parameters for an LSP endpoint.
///
/// Both peers of a connection are expected to run with compatible epoch
/// settings; the window size is local to each sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params {
    /// Maximum number of unacknowledged data messages per connection.
    pub window_size: usize,

    /// Length of one epoch in milliseconds.
    pub epoch_millis: u64,

    /// Consecutive silent epochs before the peer is declared lost.
    pub epoch_limit: u32,

    /// Capacity of the application-facing ready-to-read queue.
    pub read_buffer: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            epoch_millis: DEFAULT_EPOCH.as_millis() as u64,
            epoch_limit: DEFAULT_EPOCH_LIMIT,
            read_buffer: DEFAULT_READ_BUFFER,
        }
    }
}

impl Params {
    /// Create parameters with the three protocol knobs set explicitly.
    pub fn new(window_size: usize, epoch_millis: u64, epoch_limit: u32) -> Self {
        Self {
            window_size,
            epoch_millis,
            epoch_limit,
            ..Self::default()
        }
    }

    /// Start building parameters from the defaults.
    pub fn builder() -> ParamsBuilder {
        ParamsBuilder::new()
    }

    /// Epoch length as a [`Duration`].
    pub fn epoch(&self) -> Duration {
        Duration::from_millis(self.epoch_millis)
    }

    /// Check that every parameter is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::WindowTooLarge {
                size: self.window_size,
                max: MAX_WINDOW_SIZE,
            });
        }
        if self.epoch_millis == 0 {
            return Err(ConfigError::ZeroEpoch);
        }
        if self.epoch_limit == 0 {
            return Err(ConfigError::ZeroEpochLimit);
        }
        if self.read_buffer == 0 {
            return Err(ConfigError::ZeroReadBuffer);
        }
        Ok(())
    }
}

/// Builder for [`Params`].
#[derive(Debug, Clone, Default)]
pub struct ParamsBuilder {
    params: Params,
}

impl ParamsBuilder {
    /// Create a new builder starting from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sliding window size.
    pub fn window_size(mut self, size: usize) -> Self {
        self.params.window_size = size;
        self
    }

    /// Set the epoch length in milliseconds.
    pub fn epoch_millis(mut self, millis: u64) -> Self {
        self.params.epoch_millis = millis;
        self
    }

    /// Set the epoch length.
    pub fn epoch(mut self, epoch: Duration) -> Self {
        self.params.epoch_millis = epoch.as_millis() as u64;
        self
    }

    /// Set the number of silent epochs tolerated.
    pub fn epoch_limit(mut self, limit: u32) -> Self {
        self.params.epoch_limit = limit;
        self
    }

    /// Set the ready-to-read queue capacity.
    pub fn read_buffer(mut self, capacity: usize) -> Self {
        self.params.read_buffer = capacity;
        self
    }

    /// Validate and build the parameters.
    pub fn build(self) -> Result<Params, ConfigError> {
        self.params.validate()?;
        Ok(self.params)
    }
}
