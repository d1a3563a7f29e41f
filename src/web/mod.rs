//! HTTP integration: tower middleware and the demo server.

mod layer;
mod server;

pub use layer::{reject_response, ThrottleLayer, ThrottleService};
pub use server::HttpServer;
