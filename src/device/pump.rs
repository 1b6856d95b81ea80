//! Read and write pumps for one device connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::event::{Dispatcher, Event, EventType};
use super::heartbeat::{PongHandler, Pinger, ReadDeadline};
use super::measures::Measures;
use super::registry::Registry;
use super::transport::{Frame, FrameReader, FrameWriter, TransportError};
use super::{Device, DeviceError, Envelope, Response};
use crate::wrp::{self, Format, Message, MessageType, AUTH_STATUS_AUTHORIZED};

/// Authorization status frame sent to every device shortly after it connects.
static AUTH_STATUS: LazyLock<Bytes> = LazyLock::new(|| {
    let message = Message::authorization_status(AUTH_STATUS_AUTHORIZED);
    Bytes::from(
        wrp::encode(&message, Format::Msgpack).expect("authorization status message encodes"),
    )
});

/// Lets exactly one caller claim the teardown.
#[derive(Debug, Default)]
pub(crate) struct CloseOnce(AtomicBool);

impl CloseOnce {
    pub(crate) fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PumpTiming {
    pub(crate) ping_period: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) auth_delay: Duration,
}

/// State shared by both pumps of one connection.
pub(crate) struct PumpContext {
    pub(crate) device: Arc<Device>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) measures: Measures,
    pub(crate) close_once: CloseOnce,
}

impl PumpContext {
    fn event(&self, event_type: EventType) -> Event {
        Event::new(event_type, self.device.clone())
    }

    /// Tear the device down. Only the first caller does any work.
    fn close(&self, error: Option<DeviceError>) {
        if !self.close_once.claim() {
            return;
        }
        let device_id = self.device.id().as_str();
        match &error {
            Some(error) => {
                tracing::info!(target: "device", device_id, error = %error, "device disconnected")
            }
            None => tracing::info!(target: "device", device_id, "device disconnected"),
        }

        self.registry.remove_device(&self.device);
        self.device.request_close();
        self.measures.disconnect.inc();
        self.dispatcher
            .dispatch(&self.event(EventType::Disconnect).with_error(error));
    }

    fn handle_inbound(&self, data: Bytes) {
        let message = match wrp::decode(&data, Format::Msgpack) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    target: "device",
                    device_id = self.device.id().as_str(),
                    error = %e,
                    "dropping undecodable frame"
                );
                return;
            }
        };

        if message.message_type == MessageType::SimpleRequestResponse {
            self.measures.request_response.inc();
        }

        if let Some(key) = message.transaction_key() {
            let response = Response {
                device_id: self.device.id().clone(),
                message: message.clone(),
                format: Format::Msgpack,
                contents: data.clone(),
            };
            let event = match self.device.transactions().complete(key, response) {
                Ok(()) => self.event(EventType::TransactionComplete),
                Err(e) => {
                    tracing::debug!(
                        target: "device",
                        device_id = self.device.id().as_str(),
                        transaction_uuid = key,
                        error = %e,
                        "transaction broken"
                    );
                    self.event(EventType::TransactionBroken).with_error(Some(e))
                }
            };
            self.dispatcher
                .dispatch(&event.with_message(message.clone(), Format::Msgpack, data.clone()));
        }

        self.dispatcher.dispatch(
            &self
                .event(EventType::MessageReceived)
                .with_message(message, Format::Msgpack, data),
        );
    }

    /// `wire` stands in for the contents when the request carries none.
    fn fail(&self, envelope: Envelope, wire: Bytes, error: DeviceError) {
        let Envelope { request, complete } = envelope;
        let _ = complete.send(Err(error.clone()));
        let (format, contents) = described(request.format, request.contents, wire);
        self.dispatcher.dispatch(
            &self
                .event(EventType::MessageFailed)
                .with_message(request.message, format, contents)
                .with_error(Some(error)),
        );
    }

    /// Write one envelope. Only transport failures are returned; they end the
    /// write pump.
    async fn deliver<W: FrameWriter>(
        &self,
        writer: &mut W,
        envelope: Envelope,
        write_timeout: Duration,
    ) -> Result<(), DeviceError> {
        let cached = match envelope.request.format {
            Format::Msgpack => envelope.request.contents.clone(),
            Format::Json => None,
        };
        let contents = match cached {
            Some(contents) => contents,
            None => match wrp::encode(&envelope.request.message, Format::Msgpack) {
                Ok(encoded) => Bytes::from(encoded),
                Err(e) => {
                    self.fail(envelope, Bytes::new(), e.into());
                    return Ok(());
                }
            },
        };

        match write(writer, Frame::Binary(contents.clone()), write_timeout).await {
            Ok(()) => {
                let Envelope { request, complete } = envelope;
                let _ = complete.send(Ok(()));
                let (format, contents) = described(request.format, request.contents, contents);
                self.dispatcher.dispatch(
                    &self
                        .event(EventType::MessageSent)
                        .with_message(request.message, format, contents),
                );
                Ok(())
            }
            Err(e) => {
                let error = DeviceError::from(e);
                self.fail(envelope, contents, error.clone());
                Err(error)
            }
        }
    }
}

/// Format and bytes an event reports for a request: its own cached form, or
/// the msgpack wire bytes when it has none.
fn described(format: Format, contents: Option<Bytes>, wire: Bytes) -> (Format, Bytes) {
    match contents {
        Some(contents) => (format, contents),
        None => (Format::Msgpack, wire),
    }
}

async fn write<W: FrameWriter>(
    writer: &mut W,
    frame: Frame,
    timeout: Duration,
) -> Result<(), TransportError> {
    tokio::time::timeout(timeout, writer.write_frame(frame))
        .await
        .unwrap_or(Err(TransportError::WriteTimeout))
}

pub(crate) async fn read_pump<R: FrameReader>(
    ctx: Arc<PumpContext>,
    mut reader: R,
    deadline: Arc<ReadDeadline>,
    pong: PongHandler,
) {
    let shutdown = ctx.device.shutdown_token().clone();
    let device_id = ctx.device.id().as_str();

    let error = loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break None,
            result = tokio::time::timeout_at(deadline.current(), reader.read_frame()) => {
                match result {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(e)) => break Some(DeviceError::from(e)),
                    Err(_) => break Some(DeviceError::from(TransportError::ReadTimeout)),
                }
            }
        };

        match frame {
            Frame::Binary(data) => ctx.handle_inbound(data),
            Frame::Pong(_) => pong.on_pong(),
            Frame::Ping(_) => {}
            Frame::Text(_) => {
                tracing::warn!(target: "device", device_id, "dropping non-binary frame")
            }
            Frame::Close => break Some(DeviceError::from(TransportError::Closed)),
        }
    };

    tracing::debug!(target: "device", device_id, "read pump exiting");
    ctx.close(error);
}

pub(crate) async fn write_pump<W: FrameWriter>(
    ctx: Arc<PumpContext>,
    mut writer: W,
    mut envelopes: mpsc::Receiver<Envelope>,
    pinger: Pinger,
    timing: PumpTiming,
) {
    let shutdown = ctx.device.shutdown_token().clone();
    let device_id = ctx.device.id().as_str();

    let mut ticker = interval_at(Instant::now() + timing.ping_period, timing.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let auth = tokio::time::sleep(timing.auth_delay);
    tokio::pin!(auth);
    let mut auth_pending = true;

    let error = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break None,
            _ = &mut auth, if auth_pending => {
                auth_pending = false;
                let frame = Frame::Binary(AUTH_STATUS.clone());
                if let Err(e) = write(&mut writer, frame, timing.write_timeout).await {
                    tracing::debug!(target: "device", device_id, error = %e, "unable to send auth status");
                }
            }
            envelope = envelopes.recv() => {
                let Some(envelope) = envelope else { break None };
                if let Err(e) = ctx.deliver(&mut writer, envelope, timing.write_timeout).await {
                    break Some(e);
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = pinger.ping(&mut writer).await {
                    break Some(DeviceError::from(e));
                }
            }
        }
    };

    // Unregister before the socket close, which may take up to the write timeout.
    ctx.close(error);

    envelopes.close();
    let mut drained = 0usize;
    while let Ok(envelope) = envelopes.try_recv() {
        ctx.fail(envelope, Bytes::new(), DeviceError::DeviceClosed);
        drained += 1;
    }
    if drained > 0 {
        tracing::debug!(target: "device", device_id, drained, "failed undelivered messages");
    }

    if let Err(e) = tokio::time::timeout(timing.write_timeout, writer.close())
        .await
        .unwrap_or(Err(TransportError::WriteTimeout))
    {
        tracing::debug!(target: "device", device_id, error = %e, "error closing connection");
    }
    tracing::debug!(target: "device", device_id, "write pump exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_once_claims_once() {
        let guard = Arc::new(CloseOnce::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                std::thread::spawn(move || guard.claim())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_auth_status_frame() {
        let message = wrp::decode(&AUTH_STATUS, Format::Msgpack).unwrap();
        assert_eq!(message.message_type, MessageType::Authorization);
        assert_eq!(message.status, Some(AUTH_STATUS_AUTHORIZED));
    }
}
