//! Ping/pong liveness handling.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::transport::{Frame, FrameWriter, TransportError};
use super::{DeviceError, DeviceId};
use crate::metrics::Counter;

/// Control frame payloads are limited to 125 bytes by RFC 6455.
const MAX_PING_PAYLOAD: usize = 125;

/// Sends pings carrying the device id.
pub struct Pinger {
    payload: Bytes,
    write_timeout: Duration,
    counter: Arc<Counter>,
}

impl Pinger {
    pub fn new(
        id: &DeviceId,
        write_timeout: Duration,
        counter: Arc<Counter>,
    ) -> Result<Self, DeviceError> {
        if id.as_bytes().len() > MAX_PING_PAYLOAD {
            return Err(DeviceError::Pinger(format!(
                "device id exceeds {MAX_PING_PAYLOAD} bytes"
            )));
        }
        Ok(Self {
            payload: Bytes::copy_from_slice(id.as_bytes()),
            write_timeout,
            counter,
        })
    }

    pub async fn ping<W: FrameWriter>(&self, writer: &mut W) -> Result<(), TransportError> {
        match tokio::time::timeout(
            self.write_timeout,
            writer.write_frame(Frame::Ping(self.payload.clone())),
        )
        .await
        {
            Ok(result) => {
                result?;
                self.counter.inc();
                Ok(())
            }
            Err(_) => Err(TransportError::WriteTimeout),
        }
    }
}

/// The instant after which the read pump presumes the connection dead.
pub struct ReadDeadline {
    idle_period: Duration,
    deadline: Mutex<Instant>,
}

impl ReadDeadline {
    pub fn new(idle_period: Duration) -> Self {
        Self {
            idle_period,
            deadline: Mutex::new(Instant::now() + idle_period),
        }
    }

    pub fn extend(&self) {
        *self.deadline.lock() = Instant::now() + self.idle_period;
    }

    pub fn current(&self) -> Instant {
        *self.deadline.lock()
    }
}

/// Resets the read deadline whenever a pong arrives.
pub struct PongHandler {
    deadline: Arc<ReadDeadline>,
    counter: Arc<Counter>,
}

impl PongHandler {
    pub fn new(deadline: Arc<ReadDeadline>, counter: Arc<Counter>) -> Self {
        Self { deadline, counter }
    }

    pub fn on_pong(&self) {
        self.counter.inc();
        self.deadline.extend();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::transport::{memory, Transport};

    #[test]
    fn test_oversized_id_rejected() {
        let id = DeviceId::parse(&format!("uuid:{}", "a".repeat(130))).unwrap();
        let result = Pinger::new(&id, Duration::from_secs(1), Arc::new(Counter::default()));
        assert!(matches!(result, Err(DeviceError::Pinger(_))));
    }

    #[tokio::test]
    async fn test_ping_carries_device_id() {
        let (transport, mut peer) = memory::pair();
        let (_reader, mut writer) = transport.upgrade().await.unwrap();
        let counter = Arc::new(Counter::default());
        let id = DeviceId::parse("mac:112233445566").unwrap();
        let pinger = Pinger::new(&id, Duration::from_secs(1), counter.clone()).unwrap();

        pinger.ping(&mut writer).await.unwrap();
        writer.write_frame(Frame::Close).await.unwrap();

        // next_frame skips pings, so the close frame shows the ping went first
        assert_eq!(peer.next_frame().await, Some(Frame::Close));
        assert_eq!(counter.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_write_timeout() {
        let (transport, peer) = memory::pair();
        let (_reader, mut writer) = transport.upgrade().await.unwrap();
        peer.stall_writes();
        let counter = Arc::new(Counter::default());
        let id = DeviceId::parse("mac:112233445566").unwrap();
        let pinger = Pinger::new(&id, Duration::from_millis(50), counter.clone()).unwrap();

        assert_eq!(
            pinger.ping(&mut writer).await,
            Err(TransportError::WriteTimeout)
        );
        assert_eq!(counter.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_extends_deadline() {
        let deadline = Arc::new(ReadDeadline::new(Duration::from_secs(10)));
        let before = deadline.current();
        tokio::time::advance(Duration::from_secs(3)).await;

        let counter = Arc::new(Counter::default());
        PongHandler::new(deadline.clone(), counter.clone()).on_pong();

        assert_eq!(deadline.current(), before + Duration::from_secs(3));
        assert_eq!(counter.get(), 1);
    }
}
