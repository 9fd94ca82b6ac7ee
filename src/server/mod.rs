//! Relay server - TCP listener, connection sessions and request routing

mod connection;
mod listener;
mod pending;
mod session;

pub use connection::{connection_writer_task, ConnectionHandle};
pub use listener::{RelayServer, RelayState};
pub use pending::{PendingRequests, PendingResult};
pub use session::{ClientSession, ConnectionRole};
