//! Per-device correlation of outbound requests with inbound replies.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{DeviceError, Response};

#[derive(Default)]
struct Inner {
    pending: HashMap<String, oneshot::Sender<Response>>,
    closed: bool,
}

/// Open transactions for one device, keyed by transaction uuid.
#[derive(Default)]
pub struct Transactions {
    inner: Mutex<Inner>,
}

impl Transactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction. The returned receiver yields the reply.
    pub fn register(&self, key: &str) -> Result<oneshot::Receiver<Response>, DeviceError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DeviceError::TransactionsClosed);
        }
        if inner.pending.contains_key(key) {
            return Err(DeviceError::TransactionAlreadyRegistered(key.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(key.to_string(), tx);
        Ok(rx)
    }

    /// Deliver a reply to the waiting caller. A key may only be completed once.
    pub fn complete(&self, key: &str, response: Response) -> Result<(), DeviceError> {
        let sender = self
            .inner
            .lock()
            .pending
            .remove(key)
            .ok_or_else(|| DeviceError::NoSuchTransactionKey(key.to_string()))?;
        sender
            .send(response)
            .map_err(|_| DeviceError::TransactionCancelled)
    }

    /// Abandon a transaction without completing it.
    pub fn cancel(&self, key: &str) {
        self.inner.lock().pending.remove(key);
    }

    /// Refuse new registrations and fail every open transaction. Waiting
    /// callers observe their receiver being dropped.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.pending.drain().collect()
        };
        drop(drained);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cancels the transaction when dropped, so an abandoned `send` never leaves
/// a stale entry behind.
pub(crate) struct TransactionGuard {
    transactions: Arc<Transactions>,
    key: String,
}

impl TransactionGuard {
    pub(crate) fn new(transactions: Arc<Transactions>, key: String) -> Self {
        Self { transactions, key }
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.transactions.cancel(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use crate::wrp::{Format, Message};
    use bytes::Bytes;

    fn response(key: &str) -> Response {
        Response {
            device_id: DeviceId::parse("mac:112233445566").unwrap(),
            message: Message::request("mac:112233445566", "dns:hub", key, Bytes::new()),
            format: Format::Msgpack,
            contents: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_complete() {
        let transactions = Transactions::new();
        let rx = transactions.register("t-1").unwrap();
        transactions.complete("t-1", response("t-1")).unwrap();
        let reply = rx.await.unwrap();
        assert_eq!(reply.message.transaction_uuid, "t-1");
        assert!(transactions.is_empty());
    }

    #[test]
    fn test_second_completion_fails() {
        let transactions = Transactions::new();
        let _rx = transactions.register("t-1").unwrap();
        transactions.complete("t-1", response("t-1")).unwrap();
        assert_eq!(
            transactions.complete("t-1", response("t-1")),
            Err(DeviceError::NoSuchTransactionKey("t-1".to_string()))
        );
    }

    #[test]
    fn test_duplicate_registration() {
        let transactions = Transactions::new();
        let _rx = transactions.register("t-1").unwrap();
        assert!(matches!(
            transactions.register("t-1"),
            Err(DeviceError::TransactionAlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_completion_after_caller_gave_up() {
        let transactions = Transactions::new();
        drop(transactions.register("t-1").unwrap());
        assert_eq!(
            transactions.complete("t-1", response("t-1")),
            Err(DeviceError::TransactionCancelled)
        );
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let transactions = Transactions::new();
        let rx = transactions.register("t-1").unwrap();
        transactions.close();
        assert!(rx.await.is_err());
        assert_eq!(
            transactions.register("t-2").err(),
            Some(DeviceError::TransactionsClosed)
        );
    }

    #[test]
    fn test_guard_cancels_on_drop() {
        let transactions = Arc::new(Transactions::new());
        let _rx = transactions.register("t-1").unwrap();
        drop(TransactionGuard::new(transactions.clone(), "t-1".to_string()));
        assert!(transactions.is_empty());
    }
}
