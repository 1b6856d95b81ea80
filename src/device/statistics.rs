//! Per-connection traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::transport::{Frame, FrameReader, FrameWriter, TransportError};

/// Byte and message counters for one physical connection.
#[derive(Debug)]
pub struct Statistics {
    connected_at: DateTime<Utc>,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
}

/// Point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub connected_at: DateTime<Utc>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            connected_at: Utc::now(),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
        }
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    fn record_received(&self, frame: &Frame) {
        if let Frame::Binary(data) = frame {
            self.bytes_received
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            self.messages_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_sent(&self, frame: &Frame) {
        if let Frame::Binary(data) = frame {
            self.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            connected_at: self.connected_at,
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader that counts inbound binary frames.
pub struct InstrumentedReader<R> {
    inner: R,
    statistics: Arc<Statistics>,
}

impl<R> InstrumentedReader<R> {
    pub fn new(inner: R, statistics: Arc<Statistics>) -> Self {
        Self { inner, statistics }
    }
}

#[async_trait]
impl<R: FrameReader> FrameReader for InstrumentedReader<R> {
    async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        let frame = self.inner.read_frame().await?;
        self.statistics.record_received(&frame);
        Ok(frame)
    }
}

/// Writer that counts outbound binary frames that were written successfully.
pub struct InstrumentedWriter<W> {
    inner: W,
    statistics: Arc<Statistics>,
}

impl<W> InstrumentedWriter<W> {
    pub fn new(inner: W, statistics: Arc<Statistics>) -> Self {
        Self { inner, statistics }
    }
}

#[async_trait]
impl<W: FrameWriter> FrameWriter for InstrumentedWriter<W> {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let size_probe = match &frame {
            Frame::Binary(data) => Some(Frame::Binary(data.clone())),
            _ => None,
        };
        self.inner.write_frame(frame).await?;
        if let Some(probe) = size_probe {
            self.statistics.record_sent(&probe);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}
