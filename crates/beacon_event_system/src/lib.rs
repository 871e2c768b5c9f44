//! Priority-ordered, cancellation-aware event dispatch.
//!
//! This crate is the communication backbone of the Beacon hub. Extensions
//! register handlers for named events; the [`EventBus`] invokes them one at a
//! time in a deterministic order (priority descending, extension id ascending
//! on ties). A handler may cancel the event, hiding it from the rest of the
//! pass unless a later handler explicitly opted into cancelled events.
//!
//! The bus is generic over the source/caller type so it carries no dependency
//! on the networking layer; the server crate instantiates it with its
//! connection type.

mod bus;
mod error;
mod event;
pub mod utils;

pub use bus::{EventBus, EventHandler, FnHandler};
pub use error::EventError;
pub use event::{events, Event};
