//! Built-in SSH server.
//!
//! Accepts Git clients on the service login, authenticates them by public
//! key fingerprint against the identity store, and runs each exec channel
//! through the command dispatcher under the connection's supervisor.

pub mod channel;
pub mod server;
pub mod session;

pub use server::start_ssh_server;
