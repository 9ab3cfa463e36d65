//! HTTP surface for the key registry

pub mod server;


pub use server::{build_router, start_server, AppState, DEFAULT_IDENTITY_HEADER};
