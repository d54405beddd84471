//! Inbound PUBLISH handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, PubRec, Publish, QoS};
use crate::session::{DeliveryState, InboundMessage};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Drive the receiver side of the QoS state machines:
    /// QoS 0 delivers silently, QoS 1 delivers then PUBACKs, QoS 2
    /// delivers on first receipt and holds the packet id until PUBREL so
    /// a DUP retransmission is acknowledged without a second delivery.
    pub(crate) async fn handle_publish(&mut self, publish: Publish) -> Result<(), ConnectionError> {
        let client_id = self.client_id.clone().unwrap();

        trace!(
            "PUBLISH from {} to {} (QoS {:?})",
            client_id,
            publish.topic,
            publish.qos
        );

        self.core
            .hooks
            .on_message(
                &client_id,
                self.username.as_deref(),
                &publish.topic,
                &publish.payload,
                publish.dup,
                publish.qos,
                publish.retain,
            )
            .await;

        match publish.qos {
            QoS::AtMostOnce => {
                self.route_publish(&publish).await;
            }
            QoS::AtLeastOnce => {
                let packet_id = publish.packet_id.unwrap();
                self.route_publish(&publish).await;
                self.send_puback(packet_id).await?;
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.packet_id.unwrap();
                let session = self.session.clone().unwrap();

                let first_receipt = !session.read().has_inbound(packet_id);
                if first_receipt {
                    {
                        let mut s = session.write();
                        s.store_inbound(
                            packet_id,
                            InboundMessage {
                                topic: publish.topic.clone(),
                                payload: publish.payload.clone(),
                                state: DeliveryState::PubrecReceived,
                            },
                        );
                        self.core.persist(&s);
                    }
                    self.route_publish(&publish).await;
                } else {
                    trace!(
                        "duplicate QoS 2 PUBLISH {} from {}, acknowledging only",
                        packet_id,
                        client_id
                    );
                }

                self.write_packet(&Packet::PubRec(PubRec { packet_id })).await?;
            }
        }

        Ok(())
    }

    /// Run the publish policy hook, then route through the broker
    async fn route_publish(&self, publish: &Publish) {
        let client_id = self.client_id.as_ref().unwrap();

        let allowed = self
            .core
            .hooks
            .on_before_publish(
                client_id,
                self.username.as_deref(),
                &publish.topic,
                &publish.payload,
                publish.dup,
                publish.qos,
                publish.retain,
            )
            .await;

        if !allowed {
            debug!(
                "PUBLISH from {} to {} dropped by policy",
                client_id, publish.topic
            );
            return;
        }

        self.core.publish(publish);

        self.core
            .hooks
            .on_publish(
                client_id,
                self.username.as_deref(),
                &publish.topic,
                &publish.payload,
                publish.dup,
                publish.qos,
                publish.retain,
            )
            .await;
    }
}
