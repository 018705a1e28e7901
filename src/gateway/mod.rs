//! HTTP surface: login routes, health probe and the reverse proxy

pub mod proxy;
mod router;
mod server;

pub use proxy::{ProxyError, ProxyMediator};
pub use router::{AppState, create_router};
pub use server::Gateway;
