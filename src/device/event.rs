//! Device lifecycle and message events.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::{Device, DeviceError};
use crate::wrp::{Format, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Connect,
    Disconnect,
    MessageSent,
    MessageReceived,
    MessageFailed,
    TransactionComplete,
    TransactionBroken,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Connect => "connect",
            EventType::Disconnect => "disconnect",
            EventType::MessageSent => "message-sent",
            EventType::MessageReceived => "message-received",
            EventType::MessageFailed => "message-failed",
            EventType::TransactionComplete => "transaction-complete",
            EventType::TransactionBroken => "transaction-broken",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable fact about a device, handed to every listener.
#[derive(Clone)]
pub struct Event {
    pub event_type: EventType,
    pub device: Arc<Device>,
    pub message: Option<Message>,
    pub format: Format,
    pub contents: Bytes,
    pub error: Option<DeviceError>,
}

impl Event {
    pub fn new(event_type: EventType, device: Arc<Device>) -> Self {
        Self {
            event_type,
            device,
            message: None,
            format: Format::Msgpack,
            contents: Bytes::new(),
            error: None,
        }
    }

    pub fn with_message(mut self, message: Message, format: Format, contents: Bytes) -> Self {
        self.message = Some(message);
        self.format = format;
        self.contents = contents;
        self
    }

    pub fn with_error(mut self, error: Option<DeviceError>) -> Self {
        self.error = error;
        self
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("event_type", &self.event_type)
            .field("device", self.device.id())
            .field("message", &self.message)
            .field("format", &self.format)
            .field("error", &self.error)
            .finish()
    }
}

/// Receives events synchronously on the pump task that produced them.
///
/// Listeners must return quickly and must not call back into the manager.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Fixed, ordered fan-out to the listeners configured at startup.
#[derive(Clone, Default)]
pub struct Dispatcher {
    listeners: Arc<[Listener]>,
}

impl Dispatcher {
    pub fn new(listeners: Vec<Listener>) -> Self {
        Self {
            listeners: listeners.into(),
        }
    }

    pub fn dispatch(&self, event: &Event) {
        for listener in self.listeners.iter() {
            listener(event);
        }
    }
}

/// Listener that writes every event to the `device` log target.
pub fn log_listener() -> Listener {
    Arc::new(|event: &Event| {
        let device_id = event.device.id().as_str();
        match &event.error {
            Some(error) => tracing::debug!(
                target: "device",
                device_id,
                event = %event.event_type,
                error = %error,
                "device event"
            ),
            None => tracing::debug!(
                target: "device",
                device_id,
                event = %event.event_type,
                "device event"
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceId};
    use parking_lot::Mutex;

    #[test]
    fn test_listeners_called_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = {
            let seen = seen.clone();
            Arc::new(move |e: &Event| seen.lock().push(format!("first:{}", e.event_type)))
                as Listener
        };
        let second = {
            let seen = seen.clone();
            Arc::new(move |e: &Event| seen.lock().push(format!("second:{}", e.event_type)))
                as Listener
        };
        let dispatcher = Dispatcher::new(vec![first, second, log_listener()]);

        let (device, _rx) = Device::new(DeviceId::parse("mac:112233445566").unwrap(), None, 1);
        dispatcher.dispatch(&Event::new(EventType::Connect, device));

        assert_eq!(*seen.lock(), vec!["first:connect", "second:connect"]);
    }
}
