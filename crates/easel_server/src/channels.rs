//! Client push channels.

use crate::error::HubResult;
use easel_protocol::ServerMessage;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Registry of connected clients and their push channels.
///
/// Each client has at most one channel; subscribing again replaces the
/// previous one. Channels whose receiver was dropped are pruned on the
/// next broadcast.
#[derive(Default)]
pub struct ClientChannels {
    clients: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl ClientChannels {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a channel for `client_id` and queues the `connected` frame.
    pub fn subscribe(&self, client_id: &str) -> HubResult<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = ServerMessage::Connected {
            client_id: Some(client_id.to_string()),
        }
        .to_frame()?;
        // The receiver is still in scope, so this cannot fail.
        let _ = tx.send(connected);

        if self.clients.write().insert(client_id.to_string(), tx).is_some() {
            debug!(client_id, "client reconnected, previous channel replaced");
        }
        Ok(rx)
    }

    /// Removes a client's channel.
    pub fn unsubscribe(&self, client_id: &str) -> bool {
        self.clients.write().remove(client_id).is_some()
    }

    /// Sends `frame` to every client. Returns the number of deliveries.
    pub fn broadcast(&self, frame: &str) -> usize {
        let mut closed = Vec::new();
        let mut delivered = 0;
        {
            let clients = self.clients.read();
            for (client_id, tx) in clients.iter() {
                if tx.send(frame.to_string()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(client_id.clone());
                }
            }
        }

        if !closed.is_empty() {
            let mut clients = self.clients.write();
            for client_id in &closed {
                // A client may have re-subscribed in between.
                if clients.get(client_id).is_some_and(|tx| tx.is_closed()) {
                    clients.remove(client_id);
                    debug!(client_id = %client_id, "pruned disconnected client");
                }
            }
        }
        delivered
    }

    /// Returns the connected client IDs, sorted.
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the number of connected clients.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Returns true if no client is connected.
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Drops every channel.
    pub fn clear(&self) {
        self.clients.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_sends_connected_frame() {
        let channels = ClientChannels::new();
        let mut rx = channels.subscribe("c1").unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(
            ServerMessage::from_frame(&frame).unwrap(),
            ServerMessage::Connected {
                client_id: Some("c1".into())
            }
        );
        assert_eq!(channels.client_ids(), vec!["c1".to_string()]);
    }

    #[test]
    fn broadcast_reaches_everyone_and_prunes_closed() {
        let channels = ClientChannels::new();
        let mut a = channels.subscribe("a").unwrap();
        let b = channels.subscribe("b").unwrap();
        drop(b);

        assert_eq!(channels.broadcast("hello"), 1);
        assert_eq!(channels.client_ids(), vec!["a".to_string()]);

        a.try_recv().unwrap(); // connected
        assert_eq!(a.try_recv().unwrap(), "hello");
    }

    #[test]
    fn resubscribe_replaces_channel() {
        let channels = ClientChannels::new();
        let mut old = channels.subscribe("a").unwrap();
        let mut new = channels.subscribe("a").unwrap();
        assert_eq!(channels.len(), 1);

        channels.broadcast("x");
        old.try_recv().unwrap(); // connected
        assert!(old.try_recv().is_err());
        new.try_recv().unwrap(); // connected
        assert_eq!(new.try_recv().unwrap(), "x");

        assert!(channels.unsubscribe("a"));
        assert!(channels.is_empty());
    }
}
