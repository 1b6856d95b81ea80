//! Device connection hub
//!
//! Owns long-lived WebSocket connections from devices. Each connected device
//! gets a [`Device`] entry in the [`Registry`] and a pair of pump tasks: the
//! read pump decodes inbound WRP messages and completes transactions, the
//! write pump drains the outbound queue and sends heartbeats. Either pump
//! tears the device down exactly once.
//!
//! The [`Manager`] is the entry point for the HTTP layer:
//! connect, disconnect, route and inspection.

pub mod convey;
mod error;
pub mod event;
pub mod heartbeat;
mod id;
mod manager;
pub mod measures;
mod pump;
pub mod registry;
pub mod statistics;
pub mod transactions;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use convey::Convey;
pub use error::DeviceError;
pub use event::{Dispatcher, Event, EventType, Listener};
pub use id::DeviceId;
pub use manager::{ConnectRequest, Manager, ManagerOptions};
pub use registry::Registry;
pub use statistics::{Statistics, StatisticsSnapshot};
pub use transactions::Transactions;

use crate::wrp::{self, Format, Message};
use transactions::TransactionGuard;

/// A message to be delivered to a device.
#[derive(Debug, Clone)]
pub struct Request {
    pub message: Message,
    pub format: Format,
    /// Already-encoded form of `message` in `format`, reused when it matches
    /// the wire format.
    pub contents: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl Request {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            format: Format::Msgpack,
            contents: None,
            timeout: None,
            cancel: None,
        }
    }

    /// Decode a request from raw bytes, keeping the bytes for the write path.
    pub fn decode(contents: Bytes, format: Format) -> Result<Self, DeviceError> {
        let message = wrp::decode(&contents, format)?;
        Ok(Self {
            message,
            format,
            contents: Some(contents),
            timeout: None,
            cancel: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Give a transaction-capable message without a correlation key a fresh
    /// one so its reply can be matched. Returns whether a key was assigned.
    pub fn ensure_transaction_uuid(&mut self) -> bool {
        if !self.message.message_type.supports_transaction()
            || !self.message.transaction_uuid.is_empty()
        {
            return false;
        }
        self.message.transaction_uuid = uuid::Uuid::new_v4().to_string();
        // The cached bytes no longer match the message.
        self.contents = None;
        true
    }

    pub fn destination_id(&self) -> Result<DeviceId, DeviceError> {
        DeviceId::from_destination(&self.message.destination)
    }

    pub fn transaction_key(&self) -> Option<&str> {
        self.message.transaction_key()
    }
}

/// A reply received from a device for a transaction.
#[derive(Debug, Clone)]
pub struct Response {
    pub device_id: DeviceId,
    pub message: Message,
    pub format: Format,
    pub contents: Bytes,
}

/// One queued outbound request plus the channel that reports its write.
pub(crate) struct Envelope {
    pub(crate) request: Request,
    pub(crate) complete: oneshot::Sender<Result<(), DeviceError>>,
}

/// JSON view of a connected device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub pending: usize,
    pub statistics: StatisticsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convey: Option<Convey>,
}

/// One connected device.
pub struct Device {
    id: DeviceId,
    convey: Option<Convey>,
    statistics: Arc<Statistics>,
    transactions: Arc<Transactions>,
    messages: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Device {
    /// Create a device and the receiving end of its outbound queue.
    pub(crate) fn new(
        id: DeviceId,
        convey: Option<Convey>,
        queue_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (messages, envelopes) = mpsc::channel(queue_size.max(1));
        let device = Arc::new(Self {
            id,
            convey,
            statistics: Arc::new(Statistics::new()),
            transactions: Arc::new(Transactions::new()),
            messages,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        (device, envelopes)
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn convey(&self) -> Option<&Convey> {
        self.convey.as_ref()
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.statistics
    }

    pub(crate) fn transactions(&self) -> &Arc<Transactions> {
        &self.transactions
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Number of envelopes waiting in the outbound queue.
    pub fn pending(&self) -> usize {
        self.messages.max_capacity() - self.messages.capacity()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ask the pumps to shut the connection down. Idempotent.
    pub fn request_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(target: "device", device_id = %self.id, "close requested");
        self.shutdown.cancel();
        self.transactions.close();
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            id: self.id.clone(),
            pending: self.pending(),
            statistics: self.statistics.snapshot(),
            convey: self.convey.clone(),
        }
    }

    fn enqueue(&self, envelope: Envelope) -> Result<(), DeviceError> {
        self.messages.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => DeviceError::DeviceBusy,
            TrySendError::Closed(_) => DeviceError::DeviceClosed,
        })
    }

    /// Queue `request` for delivery.
    ///
    /// Waits until the write pump has written the message. When the message
    /// is a transaction part, also waits for the correlated reply. The
    /// request's timeout and cancellation token bound the whole exchange.
    pub async fn send(&self, request: Request) -> Result<Option<Response>, DeviceError> {
        if self.closed() {
            return Err(DeviceError::DeviceClosed);
        }

        let deadline = request.timeout.map(|t| Instant::now() + t);
        let cancel = request.cancel.clone();

        let (reply, _guard) = match request.transaction_key() {
            Some(key) => {
                let reply = self.transactions.register(key)?;
                let guard = TransactionGuard::new(self.transactions.clone(), key.to_string());
                (Some(reply), Some(guard))
            }
            None => (None, None),
        };

        let (complete, written) = oneshot::channel();
        self.enqueue(Envelope { request, complete })?;

        wait_for(written, deadline, cancel.as_ref())
            .await?
            .map_err(|_| DeviceError::DeviceClosed)??;

        let Some(reply) = reply else {
            return Ok(None);
        };
        match wait_for(reply, deadline, cancel.as_ref()).await? {
            Ok(response) => Ok(Some(response)),
            Err(_) if self.closed() => Err(DeviceError::DeviceClosed),
            Err(_) => Err(DeviceError::TransactionCancelled),
        }
    }
}

/// Await `rx` unless the deadline passes or the token fires first.
async fn wait_for<T>(
    rx: oneshot::Receiver<T>,
    deadline: Option<Instant>,
    cancel: Option<&CancellationToken>,
) -> Result<Result<T, oneshot::error::RecvError>, DeviceError> {
    let expired = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        result = rx => Ok(result),
        _ = expired => Err(DeviceError::Timeout),
        _ = cancelled => Err(DeviceError::Cancelled),
    }
}
