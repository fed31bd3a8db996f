use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::node::Link;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RecordedMessage {
    pub target: Option<String>,
    pub source: Option<String>,
    pub payload: Vec<u8>,
}
impl RecordedMessage {
    pub fn new(target: Option<&str>, source: Option<&str>, payload: &[u8]) -> RecordedMessage {
        RecordedMessage {
            target: target.map(|s| s.to_string()),
            source: source.map(|s| s.to_string()),
            payload: payload.to_vec(),
        }
    }
}

/// A [Link] that records everything it is sent, for asserting on in tests. A 'failing' link
///  records messages as well, but asks to be removed from the node by returning `false`.
#[derive(Debug)]
pub struct RecordingLink {
    keep: bool,
    received: Mutex<Vec<RecordedMessage>>,
    notify: Notify,
}

impl RecordingLink {
    pub fn new() -> Arc<RecordingLink> {
        Self::with_result(true)
    }

    pub fn failing() -> Arc<RecordingLink> {
        Self::with_result(false)
    }

    fn with_result(keep: bool) -> Arc<RecordingLink> {
        Arc::new(RecordingLink {
            keep,
            received: Default::default(),
            notify: Notify::new(),
        })
    }

    /// removes and returns all messages received so far
    pub fn take_received(&self) -> Vec<RecordedMessage> {
        std::mem::take(&mut *self.lock())
    }

    pub fn num_received(&self) -> usize {
        self.lock().len()
    }

    /// asserts that the oldest recorded message matches, and removes it
    pub fn assert_received(&self, target: Option<&str>, source: Option<&str>, payload: &[u8]) {
        let mut lock = self.lock();
        if lock.is_empty() {
            panic!("no message was received");
        }

        let actual = lock.remove(0);
        assert_eq!(actual, RecordedMessage::new(target, source, payload));
    }

    pub fn assert_nothing_received(&self) {
        let lock = self.lock();
        assert!(lock.is_empty(), "expected no messages, received {:?}", *lock);
    }

    /// Waits until at least `n` messages were received (or the timeout expires), and then
    ///  removes and returns all received messages
    pub async fn wait_for_messages(&self, n: usize, max_wait: Duration) -> Vec<RecordedMessage> {
        let _ = timeout(max_wait, async {
            loop {
                let notified = self.notify.notified();
                if self.num_received() >= n {
                    return;
                }
                notified.await;
            }
        }).await;
        self.take_received()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RecordedMessage>> {
        self.received.lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Link for RecordingLink {
    fn send(&self, target: Option<&str>, source: Option<&str>, payload: &[u8]) -> bool {
        self.lock().push(RecordedMessage::new(target, source, payload));
        self.notify.notify_waiters();
        self.keep
    }
}
