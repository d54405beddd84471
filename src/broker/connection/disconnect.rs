//! Disconnect bookkeeping and will delivery

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::Connection;
use crate::protocol::Publish;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs exactly once when an Active connection ends, whatever the
    /// cause: graceful DISCONNECT, transport error, protocol violation,
    /// keep-alive expiry or takeover.
    pub(crate) async fn finalize_disconnect(&mut self) {
        let Some(client_id) = self.client_id.clone() else {
            return;
        };
        let session = self
            .session
            .clone()
            .expect("connected client has a session");

        self.connected.store(false, Ordering::Release);
        // After a takeover the registry slot belongs to the successor and
        // stays untouched
        self.core.unregister_client(&client_id, self.conn_id);

        let clean = session.read().clean;

        // The will goes out only when the client did not say goodbye
        if !self.graceful {
            if let Some(will) = self.will.take() {
                debug!(
                    "publishing will for {} to {} (QoS {:?})",
                    client_id, will.topic, will.qos
                );
                self.core.publish(&Publish {
                    dup: false,
                    qos: will.qos,
                    retain: will.retain,
                    topic: Arc::from(will.topic.as_str()),
                    packet_id: None,
                    payload: will.payload,
                });
            }
        }

        // A non-clean session that vanished ungracefully keeps its trie
        // entries so new messages queue for its next connection
        self.core
            .unsubscribe_all(&client_id, clean, self.graceful);

        if clean {
            // Clean sessions leave nothing behind
            self.core.sessions.remove_if_same(&client_id, &session);
            if !self.core.clients.contains_key(client_id.as_ref()) {
                self.core.message_store.remove_client(&client_id);
            }
        } else {
            // The session store is authoritative across the gap; live
            // in-flight entries are rebuilt at the next replay
            self.core.persist(&session.read());
            if !self.core.clients.contains_key(client_id.as_ref()) {
                self.core.message_store.remove_client(&client_id);
            }
        }

        self.core
            .hooks
            .on_disconnect(&client_id, self.username.as_deref(), self.graceful)
            .await;

        debug!(
            "client {} disconnected (graceful: {})",
            client_id, self.graceful
        );
    }
}
