//! The authoritative chat state machine: nicknames, channels, memberships (`directory`) and the
//! per-command handler that mutates them and computes fan-out (`dispatcher`).
//!
//! Nothing in this crate touches a socket. It is driven by whatever owns the actual I/O (see the
//! `chatserver` binary), one already-decoded [`wire::Command`] at a time.

pub mod directory;
pub mod dispatcher;

pub use directory::{ConnectionId, Directory};
pub use dispatcher::{dispatch, synthetic_quit, DispatchResult, Effect};
