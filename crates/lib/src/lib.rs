//! Parley core library: offline-first chat delivery and token streaming
//! used by the CLI (and any other front end).

pub mod api;
pub mod chat;
pub mod config;
pub mod connectivity;
pub mod init;
pub mod message;
pub mod mode;
pub mod outbox;
pub mod store;
pub mod stream;
