//! Request routing and the HTTP listening surface.

pub mod router;
pub mod server;

pub use router::{CancelToken, ForwardError, Router};
pub use server::ProxyServer;
