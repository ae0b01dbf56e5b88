//! Stash library
//!
//! Durable file storage with chunked uploads, digest verification, and
//! mirror reconciliation, served over two socket dialects.

pub mod checksum;
pub mod chunk;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod logger;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod store;
pub mod sync;
pub mod tls;
pub mod wire_http;
pub mod wire_line;
