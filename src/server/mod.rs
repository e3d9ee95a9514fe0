// src/server/mod.rs
pub mod admin;
pub mod builder;
pub mod handler;
pub mod listener;

pub use builder::ServerBuilder;
pub use handler::RequestHandler;
pub use listener::{bind_tcp, load_tls_acceptor};
