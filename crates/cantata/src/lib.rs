pub mod command;
pub mod config;
pub mod idle;
pub mod permission;

pub use command::{ClientControl, CommandHandler, CommandOutcome, Interpreter};
pub use config::{Config, ConfigError};
pub use idle::IdleEvents;
pub use permission::Permission;

/// Protocol version announced in the accept greeting.
pub const PROTOCOL_VERSION: &str = "0.20.0";
