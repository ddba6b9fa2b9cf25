//! Reverse tunnel between mid-server and rad-server.
//!
//! rad-server dials out and opens a control stream for liveness. mid-server
//! opens one logical stream per proxied connection; each starts with an
//! address frame and is answered with a dial reply before bytes are relayed.

pub mod client;
pub mod error;
pub mod frontend;
pub mod manager;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod stream;
pub mod transport;
