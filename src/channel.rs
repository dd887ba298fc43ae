//! Named, bounded, fixed-frame message queues.
//!
//! A [`QueueNamespace`] plays the role of the OS namespace for named message
//! queues: the owner creates a queue under a name and keeps the receiving
//! end; peers open it by name and get a sender.

use crate::protocol::Frame;
use crate::{ManipError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Sending half of a named queue.
#[derive(Clone)]
pub struct QueueSender {
    name: Arc<str>,
    sender: Sender<Frame>,
}

impl QueueSender {
    /// Enqueue a frame without blocking.
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => ManipError::Overflow,
            TrySendError::Disconnected(_) => ManipError::ChannelClosed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for QueueSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSender").field("name", &self.name).finish()
    }
}

/// Receiving half of a named queue. Dropping it closes the queue for senders.
pub struct QueueReceiver {
    name: Arc<str>,
    receiver: Receiver<Frame>,
}

impl QueueReceiver {
    /// Wait up to `timeout` for the next frame.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Frame> {
        self.receiver.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ManipError::Timeout,
            RecvTimeoutError::Disconnected => ManipError::ChannelClosed,
        })
    }

    /// Take a frame if one is already queued.
    pub fn try_recv(&self) -> Option<Frame> {
        self.receiver.try_recv().ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registry of named queues.
///
/// The namespace keeps only a sender per queue. A removed queue therefore
/// disconnects as soon as the receiver is dropped; while the receiver lives,
/// senders opened earlier still work but new opens fail.
#[derive(Default)]
pub struct QueueNamespace {
    queues: Mutex<HashMap<String, QueueSender>>,
}

impl QueueNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide namespace, used where no explicit namespace can be passed
    /// (the C boundary).
    pub fn shared() -> Arc<QueueNamespace> {
        static SHARED: OnceLock<Arc<QueueNamespace>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(QueueNamespace::new())).clone()
    }

    /// Create `name` with room for `capacity` frames, replacing any queue
    /// already registered under that name.
    pub fn create(&self, name: &str, capacity: usize) -> QueueReceiver {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        let name: Arc<str> = Arc::from(name);
        let previous = self.queues.lock().insert(
            name.to_string(),
            QueueSender {
                name: name.clone(),
                sender,
            },
        );
        if previous.is_some() {
            log::debug!("Replaced existing message queue \"{}\"", name);
        }
        QueueReceiver { name, receiver }
    }

    /// Open an existing queue for sending.
    pub fn open(&self, name: &str) -> Result<QueueSender> {
        self.queues
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ManipError::QueueNotFound(name.to_string()))
    }

    /// Unregister `name`. Returns whether a queue was registered.
    pub fn remove(&self, name: &str) -> bool {
        self.queues.lock().remove(name).is_some()
    }

    /// Unregister the queue `receiver` reads from, unless its name has since
    /// been taken by a newer queue. Returns whether anything was removed.
    pub fn remove_owned(&self, receiver: &QueueReceiver) -> bool {
        let mut queues = self.queues.lock();
        let owned = queues
            .get(&*receiver.name)
            .is_some_and(|sender| Arc::ptr_eq(&sender.name, &receiver.name));
        if owned {
            queues.remove(&*receiver.name);
        }
        owned
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.lock().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FRAME_SIZE;

    fn frame(tag: u8) -> Frame {
        let mut f = [0u8; FRAME_SIZE];
        f[0] = tag;
        f
    }

    #[test]
    fn test_fifo_order() {
        let ns = QueueNamespace::new();
        let rx = ns.create("fifo", 4);
        let tx = ns.open("fifo").unwrap();
        for tag in 1..=3 {
            tx.send(frame(tag)).unwrap();
        }
        for tag in 1..=3 {
            assert_eq!(rx.recv_timeout(Duration::from_millis(10)).unwrap()[0], tag);
        }
    }

    #[test]
    fn test_overflow_when_full() {
        let ns = QueueNamespace::new();
        let _rx = ns.create("small", 2);
        let tx = ns.open("small").unwrap();
        tx.send(frame(1)).unwrap();
        tx.send(frame(2)).unwrap();
        assert_eq!(tx.send(frame(3)), Err(ManipError::Overflow));
    }

    #[test]
    fn test_receive_timeout() {
        let ns = QueueNamespace::new();
        let rx = ns.create("idle", 2);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(5)).map(|_| ()),
            Err(ManipError::Timeout)
        );
    }

    #[test]
    fn test_open_missing_queue() {
        let ns = QueueNamespace::new();
        assert_eq!(
            ns.open("nope").map(|_| ()),
            Err(ManipError::QueueNotFound("nope".into()))
        );
    }

    #[test]
    fn test_remove_closes_queue() {
        let ns = QueueNamespace::new();
        let rx = ns.create("gone", 2);
        let tx = ns.open("gone").unwrap();
        assert!(ns.remove("gone"));
        assert!(!ns.contains("gone"));
        drop(rx);
        assert_eq!(tx.send(frame(1)), Err(ManipError::ChannelClosed));
        assert!(ns.open("gone").is_err());
    }

    #[test]
    fn test_receiver_sees_closed_after_remove() {
        let ns = QueueNamespace::new();
        let rx = ns.create("drained", 2);
        ns.remove("drained");
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(5)).map(|_| ()),
            Err(ManipError::ChannelClosed)
        );
    }

    #[test]
    fn test_create_replaces_existing() {
        let ns = QueueNamespace::new();
        let old_rx = ns.create("dup", 2);
        let old_tx = ns.open("dup").unwrap();
        let new_rx = ns.create("dup", 2);
        ns.open("dup").unwrap().send(frame(5)).unwrap();
        assert_eq!(new_rx.recv_timeout(Duration::from_millis(5)).unwrap()[0], 5);
        old_tx.send(frame(6)).unwrap();
        assert_eq!(old_rx.recv_timeout(Duration::from_millis(5)).unwrap()[0], 6);
    }

    #[test]
    fn test_remove_owned_spares_replacement() {
        let ns = QueueNamespace::new();
        let old_rx = ns.create("shared-name", 2);
        let new_rx = ns.create("shared-name", 2);
        assert!(!ns.remove_owned(&old_rx));
        assert!(ns.contains("shared-name"));
        ns.open("shared-name").unwrap().send(frame(7)).unwrap();
        assert_eq!(new_rx.recv_timeout(Duration::from_millis(5)).unwrap()[0], 7);

        assert!(ns.remove_owned(&new_rx));
        assert!(!ns.contains("shared-name"));
    }
}
