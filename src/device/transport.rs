//! Transport seam between the pumps and the physical connection.
//!
//! The pumps only ever see [`Frame`]s through [`FrameReader`] and
//! [`FrameWriter`]. The server provides an implementation over axum's
//! `WebSocket`; tests use the in-memory transport in [`memory`].

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A single WebSocket frame as seen by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

/// Connection-level I/O failures. Every one of these is fatal for the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("read deadline exceeded")]
    ReadTimeout,

    #[error("write deadline exceeded")]
    WriteTimeout,

    #[error("i/o error: {0}")]
    Io(String),
}

#[async_trait]
pub trait FrameReader: Send + 'static {
    async fn read_frame(&mut self) -> Result<Frame, TransportError>;
}

#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A not-yet-split connection handed to [`Manager::connect`](super::Manager::connect).
#[async_trait]
pub trait Transport: Send + 'static {
    type Reader: FrameReader;
    type Writer: FrameWriter;

    /// Complete the upgrade and split the connection into its two halves.
    async fn upgrade(self) -> Result<(Self::Reader, Self::Writer), TransportError>;
}

#[cfg(test)]
pub(crate) mod memory {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    #[derive(Default)]
    struct Switches {
        fail_upgrade: AtomicBool,
        fail_writes: AtomicBool,
        stall_writes: AtomicBool,
        stall_close: AtomicBool,
        closed: AtomicBool,
        close_calls: AtomicUsize,
    }

    pub(crate) struct MemoryTransport {
        inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
        outbound: mpsc::UnboundedSender<Frame>,
        switches: Arc<Switches>,
    }

    /// The device side of a [`MemoryTransport`].
    pub(crate) struct MemoryPeer {
        inbound: mpsc::UnboundedSender<Result<Frame, TransportError>>,
        outbound: mpsc::UnboundedReceiver<Frame>,
        switches: Arc<Switches>,
    }

    pub(crate) fn pair() -> (MemoryTransport, MemoryPeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let switches = Arc::new(Switches::default());
        (
            MemoryTransport {
                inbound: in_rx,
                outbound: out_tx,
                switches: switches.clone(),
            },
            MemoryPeer {
                inbound: in_tx,
                outbound: out_rx,
                switches,
            },
        )
    }

    impl MemoryPeer {
        pub(crate) fn send(&self, frame: Frame) {
            let _ = self.inbound.send(Ok(frame));
        }

        pub(crate) fn send_binary(&self, data: Vec<u8>) {
            self.send(Frame::Binary(Bytes::from(data)));
        }

        pub(crate) fn fail_read(&self, error: TransportError) {
            let _ = self.inbound.send(Err(error));
        }

        pub(crate) fn fail_upgrade(&self) {
            self.switches.fail_upgrade.store(true, Ordering::SeqCst);
        }

        pub(crate) fn fail_writes(&self) {
            self.switches.fail_writes.store(true, Ordering::SeqCst);
        }

        pub(crate) fn stall_writes(&self) {
            self.switches.stall_writes.store(true, Ordering::SeqCst);
        }

        /// Make the hub's graceful close hang forever.
        pub(crate) fn stall_close(&self) {
            self.switches.stall_close.store(true, Ordering::SeqCst);
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.switches.closed.load(Ordering::SeqCst)
        }

        pub(crate) fn close_calls(&self) -> usize {
            self.switches.close_calls.load(Ordering::SeqCst)
        }

        /// Next frame written by the hub, skipping pings.
        pub(crate) async fn next_frame(&mut self) -> Option<Frame> {
            let wait = async {
                loop {
                    match self.outbound.recv().await {
                        Some(Frame::Ping(_)) => continue,
                        other => return other,
                    }
                }
            };
            tokio::time::timeout(Duration::from_secs(5), wait)
                .await
                .ok()
                .flatten()
        }
    }

    pub(crate) struct MemoryReader {
        inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    }

    pub(crate) struct MemoryWriter {
        outbound: mpsc::UnboundedSender<Frame>,
        switches: Arc<Switches>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        type Reader = MemoryReader;
        type Writer = MemoryWriter;

        async fn upgrade(self) -> Result<(MemoryReader, MemoryWriter), TransportError> {
            if self.switches.fail_upgrade.load(Ordering::SeqCst) {
                return Err(TransportError::Io("upgrade refused".to_string()));
            }
            Ok((
                MemoryReader {
                    inbound: self.inbound,
                },
                MemoryWriter {
                    outbound: self.outbound,
                    switches: self.switches,
                },
            ))
        }
    }

    #[async_trait]
    impl FrameReader for MemoryReader {
        async fn read_frame(&mut self) -> Result<Frame, TransportError> {
            match self.inbound.recv().await {
                Some(result) => result,
                None => Err(TransportError::Closed),
            }
        }
    }

    #[async_trait]
    impl FrameWriter for MemoryWriter {
        async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
            if self.switches.stall_writes.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.switches.fail_writes.load(Ordering::SeqCst) {
                return Err(TransportError::Io("injected write failure".to_string()));
            }
            self.outbound
                .send(frame)
                .map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.switches.close_calls.fetch_add(1, Ordering::SeqCst);
            if self.switches.stall_close.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.switches.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}
