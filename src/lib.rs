//! Chat websocket transport for the wallet's signal-based messaging.
//!
//! - [`connection`]: one websocket per credential set, with keepalive and
//!   request/response correlation
//! - [`router`]: matches responses to outstanding requests by id
//! - [`inbound`]: auto-acknowledgement and envelope decryption of pushes
//! - [`chat`] / [`inbox`]: typed chat client access and chat list merging
//! - [`signal`]: one-time signal bring-up per session
//!
//! Frames are encoded by the `frames` crate.

pub mod chat;
pub mod config;
pub mod connection;
pub mod error;
pub mod inbound;
pub mod inbox;
pub mod router;
pub mod signal;

pub use config::{ConnectionConfig, Credentials};
pub use connection::{CloseReason, Connection, ConnectionError, RequestError};
pub use error::ErrorCode;
pub use inbound::{BodyDecryptor, Incoming};
pub use signal::{Action, SignalSession};
