//! Network front end for the spectrograph command engine
//!
//! Listens for newline-delimited JSON commands over TCP and streams each
//! command's ACKs and DONE back on the same connection.

pub mod bootstrap;
pub mod connection;
pub mod logging;
pub mod protocol;

pub use connection::{handle_connection, serve};
