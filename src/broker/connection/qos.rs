//! Acknowledgement handling for the QoS 1/2 state machines

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel};
use crate::session::DeliveryState;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// PUBACK: the QoS 1 exchange is complete
    pub(crate) async fn handle_puback(&mut self, ack: PubAck) {
        let client_id = self.client_id.clone().unwrap();
        trace!("PUBACK {} from {}", ack.packet_id, client_id);

        self.core.message_store.acknowledge(
            &client_id,
            ack.packet_id,
            DeliveryState::PubackReceived,
            true,
        );

        if let Some(session) = self.session.clone() {
            let mut s = session.write();
            s.acknowledge_outbound(ack.packet_id, DeliveryState::PubackReceived, true);
            self.core.persist(&s);
        }
    }

    /// PUBREC: advance the QoS 2 exchange and answer with PUBREL
    pub(crate) async fn handle_pubrec(&mut self, rec: PubRec) -> Result<(), ConnectionError> {
        let client_id = self.client_id.clone().unwrap();
        trace!("PUBREC {} from {}", rec.packet_id, client_id);

        self.core.message_store.acknowledge(
            &client_id,
            rec.packet_id,
            DeliveryState::PubrecReceived,
            false,
        );

        if let Some(session) = self.session.clone() {
            let mut s = session.write();
            s.acknowledge_outbound(rec.packet_id, DeliveryState::PubrecReceived, false);
            self.core.persist(&s);
        }

        self.write_packet(&Packet::PubRel(PubRel {
            packet_id: rec.packet_id,
        }))
        .await
    }

    /// PUBREL: release the held inbound QoS 2 publish and answer PUBCOMP
    pub(crate) async fn handle_pubrel(&mut self, rel: PubRel) -> Result<(), ConnectionError> {
        let client_id = self.client_id.clone().unwrap();
        trace!("PUBREL {} from {}", rel.packet_id, client_id);

        if let Some(session) = self.session.clone() {
            let mut s = session.write();
            if s.remove_inbound(rel.packet_id).is_some() {
                self.core.persist(&s);
            }
        }

        self.write_packet(&Packet::PubComp(PubComp {
            packet_id: rel.packet_id,
        }))
        .await
    }

    /// PUBCOMP: the QoS 2 exchange is complete
    pub(crate) async fn handle_pubcomp(&mut self, comp: PubComp) {
        let client_id = self.client_id.clone().unwrap();
        trace!("PUBCOMP {} from {}", comp.packet_id, client_id);

        self.core.message_store.acknowledge(
            &client_id,
            comp.packet_id,
            DeliveryState::PubcompReceived,
            true,
        );

        if let Some(session) = self.session.clone() {
            let mut s = session.write();
            s.acknowledge_outbound(comp.packet_id, DeliveryState::PubcompReceived, true);
            self.core.persist(&s);
        }
    }
}
