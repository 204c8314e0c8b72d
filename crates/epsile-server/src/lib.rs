pub mod bridge;
pub mod client;
pub mod server;
pub mod wire;

pub use server::{start, AppState, ServerConfig, ServerHandle};
