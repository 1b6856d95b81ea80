use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;

use super::convey;
use super::event::{Dispatcher, Event, EventType, Listener};
use super::heartbeat::{PongHandler, Pinger, ReadDeadline};
use super::measures::Measures;
use super::pump::{self, CloseOnce, PumpContext, PumpTiming};
use super::registry::Registry;
use super::statistics::{InstrumentedReader, InstrumentedWriter};
use super::transport::{FrameWriter, Transport};
use super::{Device, DeviceError, DeviceId, Request, Response};
use crate::config::DeviceConfig;
use crate::metrics::MetricsRegistry;

/// Tunables for the device hub.
#[derive(Clone)]
pub struct ManagerOptions {
    /// Maximum connected devices, 0 for unbounded.
    pub max_devices: usize,
    pub device_message_queue_size: usize,
    pub ping_period: Duration,
    pub idle_period: Duration,
    pub write_timeout: Duration,
    pub auth_delay: Duration,
    pub listeners: Vec<Listener>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_config(&DeviceConfig::default())
    }
}

impl ManagerOptions {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            max_devices: config.max_devices,
            device_message_queue_size: config.device_message_queue_size,
            ping_period: Duration::from_millis(config.ping_period_ms),
            idle_period: Duration::from_millis(config.idle_period_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            auth_delay: Duration::from_millis(config.auth_delay_ms),
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Listener) -> Self {
        self.listeners.push(listener);
        self
    }
}

/// An authenticated upgrade request.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// Identity resolved by the layer in front of the hub.
    pub id: Option<DeviceId>,
    pub headers: HeaderMap,
}

struct Inner {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    measures: Measures,
    queue_size: usize,
    idle_period: Duration,
    timing: PumpTiming,
}

/// Entry point to the device hub.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    pub fn new(options: ManagerOptions, metrics: &MetricsRegistry) -> Self {
        let measures = Measures::new(metrics);
        let registry = Arc::new(Registry::new(options.max_devices, measures.clone()));
        Self {
            inner: Arc::new(Inner {
                registry,
                dispatcher: Dispatcher::new(options.listeners),
                measures,
                queue_size: options.device_message_queue_size,
                idle_period: options.idle_period,
                timing: PumpTiming {
                    ping_period: options.ping_period,
                    write_timeout: options.write_timeout,
                    auth_delay: options.auth_delay,
                },
            }),
        }
    }

    /// Upgrade `transport`, register the device and start its pumps.
    ///
    /// No registry entry remains when this returns an error.
    pub async fn connect<T: Transport>(
        &self,
        request: ConnectRequest,
        transport: T,
    ) -> Result<Arc<Device>, DeviceError> {
        let inner = &self.inner;
        let id = request.id.ok_or(DeviceError::MissingDeviceName)?;

        let convey = match convey::from_headers(&request.headers) {
            Ok(convey) => convey,
            Err(e) => {
                tracing::warn!(target: "hub", device_id = id.as_str(), error = %e, "ignoring bad convey header");
                None
            }
        };

        let (device, envelopes) = Device::new(id, convey, inner.queue_size);
        let device_id = device.id().as_str();

        let (reader, writer) = transport.upgrade().await.map_err(|e| {
            tracing::error!(target: "hub", device_id, error = %e, "upgrade failed");
            DeviceError::Upgrade(e.to_string())
        })?;
        let reader = InstrumentedReader::new(reader, device.statistics().clone());
        let mut writer = InstrumentedWriter::new(writer, device.statistics().clone());

        let pinger = match Pinger::new(
            device.id(),
            inner.timing.write_timeout,
            inner.measures.ping.clone(),
        ) {
            Ok(pinger) => pinger,
            Err(e) => {
                tracing::error!(target: "hub", device_id, error = %e, "unable to create pinger");
                let _ = writer.close().await;
                return Err(e);
            }
        };

        if let Err(e) = inner.registry.add(device.clone()) {
            tracing::warn!(target: "hub", device_id, error = %e, "unable to register device");
            let _ = writer.close().await;
            return Err(e);
        }

        inner.measures.connect.inc();
        tracing::info!(target: "hub", device_id, "device connected");
        inner
            .dispatcher
            .dispatch(&Event::new(EventType::Connect, device.clone()));

        let deadline = Arc::new(ReadDeadline::new(inner.idle_period));
        let pong = PongHandler::new(deadline.clone(), inner.measures.pong.clone());
        let ctx = Arc::new(PumpContext {
            device: device.clone(),
            registry: inner.registry.clone(),
            dispatcher: inner.dispatcher.clone(),
            measures: inner.measures.clone(),
            close_once: CloseOnce::default(),
        });
        tokio::spawn(pump::read_pump(ctx.clone(), reader, deadline, pong));
        tokio::spawn(pump::write_pump(ctx, writer, envelopes, pinger, inner.timing));

        Ok(device)
    }

    /// Disconnect the device registered under `id`.
    pub fn disconnect(&self, id: &DeviceId) -> bool {
        self.inner.registry.remove(id).is_some()
    }

    /// Disconnect every device whose id matches `predicate`.
    pub fn disconnect_if(&self, predicate: impl Fn(&DeviceId) -> bool) -> usize {
        self.inner.registry.remove_if(predicate)
    }

    pub fn disconnect_all(&self) -> usize {
        self.disconnect_if(|_| true)
    }

    pub fn get(&self, id: &DeviceId) -> Option<Arc<Device>> {
        self.inner.registry.get(id)
    }

    /// Visit every connected device. `visitor` must not call back into the
    /// manager.
    pub fn visit_all(&self, visitor: impl FnMut(&Arc<Device>)) -> usize {
        self.inner.registry.visit(visitor)
    }

    /// Deliver `request` to the device named by its destination.
    pub async fn route(&self, request: Request) -> Result<Option<Response>, DeviceError> {
        let id = request.destination_id()?;
        let device = self.get(&id).ok_or(DeviceError::DeviceNotFound)?;
        device.send(request).await
    }

    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    pub fn max_devices(&self) -> usize {
        self.inner.registry.limit()
    }
}
