//! SUBSCRIBE and UNSUBSCRIBE handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{Connection, ConnectionError};
use crate::protocol::{
    Packet, Publish, SubAck, Subscribe, UnsubAck, Unsubscribe, SUBACK_FAILURE,
};
use crate::topic::valid_filter;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Process each requested filter, answer with SUBACK, then replay
    /// matching retained messages in order of receipt.
    pub(crate) async fn handle_subscribe(
        &mut self,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let client_id = self.client_id.clone().unwrap();
        let session = self.session.clone().unwrap();

        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        // Retained replays are sent after the SUBACK
        let mut replays = Vec::new();

        for request in &subscribe.filters {
            if !valid_filter(&request.filter) {
                debug!("invalid filter '{}' from {}", request.filter, client_id);
                return_codes.push(SUBACK_FAILURE);
                continue;
            }

            let allowed = self
                .core
                .hooks
                .on_before_subscribe(
                    &client_id,
                    self.username.as_deref(),
                    &request.filter,
                    request.qos,
                )
                .await;

            if !allowed {
                debug!(
                    "SUBSCRIBE {} to {} denied by policy",
                    client_id, request.filter
                );
                return_codes.push(SUBACK_FAILURE);
                continue;
            }

            let retained = self.core.subscribe(&session, &request.filter, request.qos);
            return_codes.push(request.qos as u8);

            self.core
                .hooks
                .on_subscribe(
                    &client_id,
                    self.username.as_deref(),
                    &request.filter,
                    request.qos,
                )
                .await;

            debug!(
                "SUBSCRIBE {} to {} (QoS {:?})",
                client_id, request.filter, request.qos
            );

            for message in retained {
                replays.push((request.qos, message));
            }
        }

        self.write_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await?;

        // Retained delivery: retain flag set, QoS downgraded to
        // min(subscription, retained), ascending receipt order per filter
        for (sub_qos, message) in replays {
            let publish = Publish {
                dup: false,
                qos: message.qos.min(sub_qos),
                retain: true,
                topic: message.topic,
                packet_id: None,
                payload: message.payload,
            };
            self.send_publish(publish).await?;
        }

        Ok(())
    }

    /// Remove each filter, then answer with UNSUBACK
    pub(crate) async fn handle_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        let client_id = self.client_id.clone().unwrap();
        let session = self.session.clone().unwrap();

        for filter in &unsubscribe.filters {
            let allowed = self
                .core
                .hooks
                .on_before_unsubscribe(&client_id, self.username.as_deref(), filter)
                .await;

            if !allowed {
                debug!(
                    "UNSUBSCRIBE {} from {} denied by policy",
                    client_id, filter
                );
                continue;
            }

            let removed = self.core.unsubscribe(&session, filter);

            self.core
                .hooks
                .on_unsubscribe(&client_id, self.username.as_deref(), filter)
                .await;

            debug!(
                "UNSUBSCRIBE {} from {} (existed: {})",
                client_id, filter, removed
            );
        }

        self.write_packet(&Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }))
        .await
    }
}
