//! Server module
//!
//! HTTP endpoints and the WebSocket device connect route.

pub mod http;
pub mod startup;
pub mod ws;

pub use http::{create_router, error_response, HubState};
pub use startup::{run_server_with_config, ServerConfig, ServerHandle};
