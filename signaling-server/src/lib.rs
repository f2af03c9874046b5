//! Real-time backend for a two-person web app: live presence plus the
//! "biometric sync lock", where both people hold a finger on the same spot of
//! their screens until the lock opens.
//!
//! # Layout
//! - [`state`] holds the presence registry and the sync lock state machine.
//!   Both are plain structs that return [`protocol::Dispatch`] lists instead
//!   of writing to sockets, so they can be tested without a runtime.
//! - [`hub`] owns that state on a single task and fans messages out to the
//!   connected WebSockets.
//! - [`server`] is the hyper service: WebSocket upgrades, health, and the
//!   passcode/session endpoints from [`auth`].

pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod state;

pub type ConnId = String;
