//! Forwards log records as email.
//!
//! Each configured output runs an [`Engine`]: it checks at startup that its
//! recipients are reachable, then turns every record into a message and
//! delivers it, through a fixed relay or straight to each recipient domain's
//! mail exchangers.

pub mod config;
pub mod controller;
pub mod engine;

pub use config::{ConfigError, EngineConfig, Output};
pub use controller::Courier;
pub use engine::{Engine, EngineError, EngineState, RecordSource};
