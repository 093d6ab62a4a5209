//! Websocket surface: per-frontend connections and the dispatcher that fans
//! client events out to them.

pub mod backend;
pub mod connection;
pub mod dispatcher;
mod initial;

pub use backend::Backend;
pub use connection::{ConnectionConfig, handle_socket, serve};
pub use dispatcher::Dispatcher;
