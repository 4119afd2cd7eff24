//! Pending-request table: correlates inbound responses with waiting callers
//!
//! A caller that issues a synchronous request registers a waiter keyed by
//! (command code, request id) before sending, then blocks on the handle up
//! to its own timeout. The receiver offers every inbound message here first;
//! a message with no matching waiter flows on to the dispatcher. One waiter
//! per key at a time; registering a duplicate key is a caller error.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::message::Message;

type Key = (u16, u32);

#[derive(Default)]
struct Inner {
    waiters: Mutex<HashMap<Key, oneshot::Sender<Message>>>,
}

/// Outcome of waiting on a registered request
#[derive(Debug, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline elapsed with no matching response
    Timeout,
    /// The session shut down while the request was in flight
    SessionClosed,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "request timed out"),
            WaitError::SessionClosed => write!(f, "session closed while waiting"),
        }
    }
}

impl std::error::Error for WaitError {}

#[derive(Clone, Default)]
pub struct MessageWaitQueue {
    inner: Arc<Inner>,
}

/// One outstanding wait, removed from the table on fulfillment or drop
pub struct WaitHandle {
    inner: Arc<Inner>,
    key: Key,
    rx: oneshot::Receiver<Message>,
}

impl MessageWaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for (code, request id). Must be called before the
    /// request is sent so the response cannot race past the table.
    pub fn register(&self, code: u16, request_id: u32) -> Result<WaitHandle> {
        let (tx, rx) = oneshot::channel();
        let key = (code, request_id);
        let mut waiters = self.inner.waiters.lock();
        if waiters.contains_key(&key) {
            bail!(
                "duplicate waiter for command {:#06x} request id {}",
                code,
                request_id
            );
        }
        waiters.insert(key, tx);
        Ok(WaitHandle {
            inner: Arc::clone(&self.inner),
            key,
            rx,
        })
    }

    /// Offer an inbound message to the table. Returns the message back when
    /// no waiter matched so the caller can queue it for dispatch.
    pub fn deliver(&self, msg: Message) -> Option<Message> {
        let sender = self.inner.waiters.lock().remove(&(msg.code, msg.id));
        match sender {
            Some(tx) => {
                if let Err(unclaimed) = tx.send(msg) {
                    // Waiter gave up (timed out) just before the response
                    // landed; the correlated reply has no other consumer.
                    debug!(
                        code = unclaimed.code,
                        id = unclaimed.id,
                        "response arrived after its waiter left"
                    );
                }
                None
            }
            None => Some(msg),
        }
    }

    /// Drop every outstanding waiter; their waits fail with SessionClosed.
    pub fn clear(&self) {
        self.inner.waiters.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.waiters.lock().len()
    }
}

impl WaitHandle {
    /// Block the calling task until the matching response arrives or the
    /// deadline elapses. Consumes the registration either way.
    pub async fn wait(mut self, deadline: Duration) -> Result<Message, WaitError> {
        match tokio::time::timeout(deadline, &mut self.rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(WaitError::SessionClosed),
            Err(_) => Err(WaitError::Timeout),
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        self.inner.waiters.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command;

    fn response(code: u16, id: u32, marker: u32) -> Message {
        let mut msg = Message::new(code, id);
        msg.set_u32(99, marker);
        msg
    }

    #[tokio::test]
    async fn test_deliver_fulfills_waiter() {
        let queue = MessageWaitQueue::new();
        let handle = queue.register(command::REQUEST_COMPLETED, 7).unwrap();
        assert!(queue
            .deliver(response(command::REQUEST_COMPLETED, 7, 1))
            .is_none());
        let msg = handle.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.id, 7);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_message_returned() {
        let queue = MessageWaitQueue::new();
        let _handle = queue.register(command::REQUEST_COMPLETED, 7).unwrap();
        // Wrong id
        assert!(queue
            .deliver(response(command::REQUEST_COMPLETED, 8, 1))
            .is_some());
        // Wrong code
        assert!(queue.deliver(response(command::LOGIN, 7, 1)).is_some());
    }

    #[tokio::test]
    async fn test_out_of_order_correlation() {
        let queue = MessageWaitQueue::new();
        let handles: Vec<_> = (1..=5u32)
            .map(|id| queue.register(command::REQUEST_COMPLETED, id).unwrap())
            .collect();

        // Responses arrive in reverse order
        for id in (1..=5u32).rev() {
            assert!(queue
                .deliver(response(command::REQUEST_COMPLETED, id, id * 10))
                .is_none());
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let expect_id = (i + 1) as u32;
            let msg = handle.wait(Duration::from_secs(1)).await.unwrap();
            assert_eq!(msg.id, expect_id);
            assert_eq!(msg.get_u32(99), Some(expect_id * 10));
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let queue = MessageWaitQueue::new();
        let handle = queue.register(command::REQUEST_COMPLETED, 1).unwrap();
        let err = handle.wait(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, WaitError::Timeout);
        // Timed-out waiter left no residue
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_error() {
        let queue = MessageWaitQueue::new();
        let _first = queue.register(command::REQUEST_COMPLETED, 1).unwrap();
        assert!(queue.register(command::REQUEST_COMPLETED, 1).is_err());
        // Same id under a different code is a distinct key
        assert!(queue.register(command::SESSION_KEY, 1).is_ok());
    }

    #[tokio::test]
    async fn test_clear_fails_outstanding_waits() {
        let queue = MessageWaitQueue::new();
        let handle = queue.register(command::REQUEST_COMPLETED, 1).unwrap();
        queue.clear();
        let err = handle.wait(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, WaitError::SessionClosed);
    }

    #[tokio::test]
    async fn test_dropped_handle_unregisters() {
        let queue = MessageWaitQueue::new();
        {
            let _handle = queue.register(command::REQUEST_COMPLETED, 1).unwrap();
            assert_eq!(queue.len(), 1);
        }
        assert_eq!(queue.len(), 0);
        // Key is reusable after the previous waiter went away
        assert!(queue.register(command::REQUEST_COMPLETED, 1).is_ok());
    }
}
