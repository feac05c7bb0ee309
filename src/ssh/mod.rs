//! SSH front end.
//!
//! Accepts connections from git clients, authenticates them against the
//! configured credential verifier, and relays each `exec` request on a
//! session channel to a local pack-protocol process.

pub mod channel;
pub mod env;
pub mod server;
pub mod session;

pub use server::start_ssh_server;
