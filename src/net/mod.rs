mod client;
mod connection;
mod server;

pub use client::Client;
pub use connection::{configure_stream, Connection, STREAM_COUNT};
pub use server::Server;
