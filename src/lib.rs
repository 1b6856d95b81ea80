//! wrphub library
//!
//! A hub for long-lived device WebSocket connections speaking WRP: device
//! registry, read/write pumps with heartbeats, transaction routing, the HTTP
//! surface, and a bounded-retry decorator for outbound HTTP.

pub mod cli;
pub mod config;
pub mod device;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod wrp;
pub mod xhttp;
