//! In-process P2P relay
//!
//! Routes messages between receivers registered under their peer id. Used
//! by the demo binary and the tests in place of a relay server.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::P2PSignalingSender;
use crate::error::{Result, SessionError};

/// Endpoint that accepts relayed messages
pub trait SignalingReceiver: Send + Sync {
    fn on_signaling_message(&self, from: &str, message: &str);
}

/// Relayed messages kept for [`MemoryHub::log`]
pub const LOG_CAPACITY: usize = 256;

#[derive(Default)]
pub struct MemoryHub {
    peers: Mutex<HashMap<String, Weak<dyn SignalingReceiver>>>,
    log: Mutex<VecDeque<(String, String, String)>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: &str, receiver: Weak<dyn SignalingReceiver>) {
        self.peers.lock().insert(id.to_string(), receiver);
    }

    pub fn unregister(&self, id: &str) {
        self.peers.lock().remove(id);
    }

    /// Sender that relays on behalf of `from`
    pub fn sender(self: &Arc<Self>, from: &str) -> Arc<dyn P2PSignalingSender> {
        Arc::new(HubSender {
            hub: self.clone(),
            from: from.to_string(),
        })
    }

    /// The most recent relayed messages as (from, to, message), oldest
    /// first
    pub fn log(&self) -> Vec<(String, String, String)> {
        self.log.lock().iter().cloned().collect()
    }

    fn deliver(&self, from: &str, to: &str, message: String) -> Result<()> {
        let receiver = self.peers.lock().get(to).and_then(Weak::upgrade);
        let Some(receiver) = receiver else {
            return Err(SessionError::Transport(format!("{} is unreachable", to)));
        };
        trace!("Relaying {} -> {}: {}", from, to, message);
        {
            let mut log = self.log.lock();
            if log.len() == LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back((from.to_string(), to.to_string(), message.clone()));
        }
        receiver.on_signaling_message(from, &message);
        Ok(())
    }
}

struct HubSender {
    hub: Arc<MemoryHub>,
    from: String,
}

#[async_trait]
impl P2PSignalingSender for HubSender {
    async fn send_signaling_message(&self, message: String, remote_id: &str) -> Result<()> {
        self.hub.deliver(&self.from, remote_id, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Inbox(Mutex<Vec<(String, String)>>);

    impl SignalingReceiver for Inbox {
        fn on_signaling_message(&self, from: &str, message: &str) {
            self.0.lock().push((from.to_string(), message.to_string()));
        }
    }

    #[tokio::test]
    async fn test_relay_and_unreachable() {
        let hub = MemoryHub::new();
        let inbox = Arc::new(Inbox::default());
        let receiver: Arc<dyn SignalingReceiver> = inbox.clone();
        hub.register("bob", Arc::downgrade(&receiver));

        let alice = hub.sender("alice");
        alice
            .send_signaling_message("hello".to_string(), "bob")
            .await
            .unwrap();
        assert_eq!(
            *inbox.0.lock(),
            vec![("alice".to_string(), "hello".to_string())]
        );

        let err = alice
            .send_signaling_message("hello".to_string(), "carol")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(hub.log().len(), 1);
    }

    #[tokio::test]
    async fn test_log_keeps_recent_messages() {
        let hub = MemoryHub::new();
        let inbox = Arc::new(Inbox::default());
        let receiver: Arc<dyn SignalingReceiver> = inbox.clone();
        hub.register("bob", Arc::downgrade(&receiver));

        let alice = hub.sender("alice");
        for i in 0..LOG_CAPACITY + 10 {
            alice
                .send_signaling_message(format!("m{}", i), "bob")
                .await
                .unwrap();
        }
        let log = hub.log();
        assert_eq!(log.len(), LOG_CAPACITY);
        assert_eq!(log[0].2, "m10");
        assert_eq!(log[LOG_CAPACITY - 1].2, format!("m{}", LOG_CAPACITY + 9));
        assert_eq!(inbox.0.lock().len(), LOG_CAPACITY + 10);
    }
}
