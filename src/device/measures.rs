use std::sync::Arc;

use crate::metrics::{Counter, Gauge, MetricsRegistry};

/// Metrics recorded by the device hub.
#[derive(Debug, Clone)]
pub struct Measures {
    pub device: Arc<Gauge>,
    pub connect: Arc<Counter>,
    pub disconnect: Arc<Counter>,
    pub limit_reached: Arc<Counter>,
    pub duplicates: Arc<Counter>,
    pub request_response: Arc<Counter>,
    pub ping: Arc<Counter>,
    pub pong: Arc<Counter>,
}

impl Measures {
    pub fn new(registry: &MetricsRegistry) -> Self {
        Self {
            device: registry.register_gauge("wrphub_devices", "Currently connected devices"),
            connect: registry.register_counter("wrphub_connect_total", "Device connections accepted"),
            disconnect: registry
                .register_counter("wrphub_disconnect_total", "Device connections torn down"),
            limit_reached: registry.register_counter(
                "wrphub_device_limit_reached_total",
                "Connections rejected because the device limit was reached",
            ),
            duplicates: registry.register_counter(
                "wrphub_duplicates_total",
                "Connections rejected because the device id was already connected",
            ),
            request_response: registry.register_counter(
                "wrphub_request_response_total",
                "Inbound simple request/response messages",
            ),
            ping: registry.register_counter("wrphub_ping_total", "Pings sent to devices"),
            pong: registry.register_counter("wrphub_pong_total", "Pongs received from devices"),
        }
    }
}
