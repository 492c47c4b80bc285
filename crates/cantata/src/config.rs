use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::permission::Permission;

pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub const DEFAULT_MAX_COMMAND_LIST_KIB: u64 = 2048;
pub const DEFAULT_MAX_OUTPUT_BUFFER_KIB: u64 = 8192;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("connection_timeout must be a positive number of seconds")]
    ConnectionTimeout,
    #[error("max_connections must be positive")]
    MaxConnections,
    #[error("max_command_list_size must be a positive number of KiB")]
    MaxCommandListSize,
    #[error("max_output_buffer_size must be a positive number of KiB")]
    MaxOutputBufferSize,
}

/// Daemon limits. Sizes are stored in bytes; the constructor takes the
/// wire-configuration units (seconds and KiB).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// A session with no read or write progress for this long is closed,
    /// unless it is blocked in idle mode.
    pub connection_timeout: Duration,
    pub max_connections: usize,
    /// Byte cap on an accumulating command list.
    pub max_command_list_size: usize,
    /// Byte cap on a session's deferred output queue.
    pub max_output_buffer_size: usize,
    /// Permission mask seeded into every new session.
    pub default_permissions: Permission,
}

impl Config {
    pub fn from_limits(
        connection_timeout_secs: u64,
        max_connections: usize,
        max_command_list_kib: u64,
        max_output_buffer_kib: u64,
    ) -> Result<Self, ConfigError> {
        if connection_timeout_secs == 0 {
            return Err(ConfigError::ConnectionTimeout);
        }
        if max_connections == 0 {
            return Err(ConfigError::MaxConnections);
        }
        if max_command_list_kib == 0 {
            return Err(ConfigError::MaxCommandListSize);
        }
        if max_output_buffer_kib == 0 {
            return Err(ConfigError::MaxOutputBufferSize);
        }

        Ok(Self {
            connection_timeout: Duration::from_secs(connection_timeout_secs),
            max_connections,
            max_command_list_size: (max_command_list_kib * 1024) as usize,
            max_output_buffer_size: (max_output_buffer_kib * 1024) as usize,
            default_permissions: Permission::default(),
        })
    }

    pub fn with_default_permissions(mut self, permissions: Permission) -> Self {
        self.default_permissions = permissions;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_limits(
            DEFAULT_CONNECTION_TIMEOUT_SECS,
            DEFAULT_MAX_CONNECTIONS,
            DEFAULT_MAX_COMMAND_LIST_KIB,
            DEFAULT_MAX_OUTPUT_BUFFER_KIB,
        )
        .expect("default limits are positive")
    }
}
