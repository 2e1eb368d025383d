//! Core types for the distributed session subsystem.
//!
//! This crate owns the vocabulary shared by every other crate in the
//! workspace: the durable [`SessionData`] record, the [`Session`] runtime
//! wrapper and its validity state machine, the [`SessionKey`]/[`SessionContext`]
//! identity types, the custom wire format, the listener event bus, and the
//! error kinds every store/cache/manager maps into.
//!
//! It has no knowledge of HTTP, cookies, or any particular persistence
//! medium — those live in `session-store`, `session-cache`, `session-id`,
//! `session-housekeeper`, and `session-manager`.

mod context;
mod data;
mod error;
mod event;
mod serialize;
mod session;

pub use context::{SessionContext, SessionKey};
pub use data::{AttributeEntry, Attributes, SessionData};
pub use error::{Error, Result};
pub use event::{ListenerEvent, ListenerHandle, ListenerToken, SessionListener};
pub use serialize::{
    deserialize_attributes, deserialize_session_data, serialize_attributes, serialize_session_data,
};
pub use session::{Session, SessionState};
