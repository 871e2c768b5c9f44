//! Beacon rendezvous hub core.
//!
//! Independent game-server processes connect to one TCP endpoint, prove
//! identity with a shared key, and become named peers that can be addressed
//! individually, broadcast to, or enumerated by other peers. The wire format
//! is newline-delimited JSON objects.
//!
//! The crate is split along the seams of the system:
//!
//! * [`connection`] — the per-socket protocol state machine (framing,
//!   greeting, heartbeat, exactly-once disconnect).
//! * [`hub`] — the live-connection set and the authenticated name → peer
//!   registry, with the broadcast primitives.
//! * [`extensions`] — the lifecycle contract for behavior-bearing units and
//!   the built-ins: the authentication gate, chat relay, echo, greeter and
//!   player presence.
//! * [`config`] — the key → file configuration store the gate reads its key
//!   table from.
//! * [`server`] — composition root: accept loop and coordinated shutdown.
//!
//! All cross-component communication goes through the event bus from
//! `beacon_event_system`; the server core itself carries no game logic.

pub mod config;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod hub;
pub mod protocol;
pub mod server;

pub use config::ConfigStore;
pub use connection::{handle_connection, Connection, ConnectionState};
pub use error::{ConfigError, ExtensionError, ServerError};
pub use extensions::{Extension, ExtensionContext, ExtensionManager};
pub use hub::Hub;
pub use server::{Server, ServerSettings};
