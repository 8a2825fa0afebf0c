//! shroud relay
//!
//! Connection-handling core of an encrypted proxy relay:
//! - accepts inbound connections and turns away banned peers
//! - spreads connections round-robin over a fixed pool of worker threads
//! - runs each connection's data plane through a pluggable [`Session`]
//!
//! The destination header both endpoints exchange lives in `shroud-header`.

pub mod ban;
pub mod config;
pub mod dispatcher;
pub mod probe;
pub mod relay;

pub use ban::{BanList, BanRegistry};
pub use config::{ConfigError, LogFormat, Profile};
pub use dispatcher::{
    DispatchEvent, DispatchSettings, Dispatcher, DispatcherError, DispatcherState,
    DEFAULT_DRAIN_TIMEOUT, DEFAULT_JOIN_GRACE,
};
pub use relay::{
    CipherParams, EventSink, HandleId, PlainSession, RelayError, RelayEvent, RelayHandle,
    RelayParams, Session, SessionContext,
};
