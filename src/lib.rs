//! unity-relay - relay broker for reloadable Unity editor instances
//!
//! This crate provides:
//! - The framed JSON wire protocol shared by instances, clients and the relay
//! - The relay server: instance registry, request routing and timeouts
//! - A client with retry/backoff for transient instance unavailability
//! - The status-file side channel instances use while they reload
//!
//! # Architecture
//!
//! Unity instances connect out to the relay (`unity-relay-server`) and
//! register. Clients (`unity-relay` or any other tool) connect to the same
//! port and send requests addressed by an instance selector; the relay
//! forwards each request to the matching instance and relays the response.

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod status_file;

pub use client::RelayClient;
pub use error::{ExitCode, RelayError};
pub use server::RelayServer;
