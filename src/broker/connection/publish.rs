//! PUBLISH handling and outbound delivery

use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError, Flow};
use crate::protocol::{Packet, ProtocolError, PubAck, Publish, QoS};
use crate::rule::MessageContext;
use crate::topic::validate_topic_name;
use crate::transport::Transport;

impl<T: Transport> Connection<T> {
    /// Handle a PUBLISH from the client
    pub(crate) async fn handle_publish(
        &mut self,
        publish: Publish,
    ) -> Result<Flow, ConnectionError> {
        let (client_id, _) = self.session()?;
        let shared = self.shared.clone();

        if !publish.qos.is_supported() {
            return Err(ProtocolError::UnsupportedQoS(publish.qos as u8).into());
        }

        if publish.payload.len() > shared.config.max_payload_size {
            warn!(
                "Payload of {} bytes from {} exceeds the limit",
                publish.payload.len(),
                client_id
            );
            return Err(ProtocolError::PayloadTooLarge(publish.payload.len()).into());
        }

        if let Err(reason) = validate_topic_name(&publish.topic, &shared.config.topic_limits) {
            warn!("Invalid topic {:?} from {}: {}", publish.topic, client_id, reason);
            return Err(ProtocolError::InvalidTopic(publish.topic.to_string()).into());
        }

        let allowed = shared
            .hooks
            .on_publish_check(
                &client_id,
                self.username.as_deref(),
                &publish.topic,
                publish.qos,
                publish.retain,
            )
            .await;
        match allowed {
            Ok(true) => {}
            Ok(false) => {
                warn!("{} not authorized to publish to {}", client_id, publish.topic);
                return Err(ProtocolError::NotAuthorized.into());
            }
            Err(e) => {
                warn!("Publish check failed for {}: {}", client_id, e);
                return Err(ProtocolError::NotAuthorized.into());
            }
        }

        if publish.qos == QoS::AtLeastOnce {
            if let Some(packet_id) = publish.packet_id {
                self.send_packet(&Packet::PubAck(PubAck::new(packet_id)))
                    .await?;
            }
        }

        if let Some(ref metrics) = shared.metrics {
            metrics.publish_received(publish.payload.len());
        }

        let origin = MessageContext {
            client_id: client_id.clone(),
            client_ip: Some(self.addr.ip()),
            topic: publish.topic.clone(),
            qos: publish.qos,
        };
        let delivered = shared.router.publish(&publish, &origin);
        trace!(
            "{} published to {} ({} subscribers)",
            client_id,
            publish.topic,
            delivered
        );

        shared
            .hooks
            .on_message_published(&publish.topic, &publish.payload, publish.qos)
            .await;

        Ok(Flow::Continue)
    }

    /// Handle a PUBACK for a message we delivered
    pub(crate) async fn handle_puback(&mut self, packet_id: u16) -> Result<Flow, ConnectionError> {
        let (client_id, session) = self.session()?;
        if !session.write().outbox.acknowledge(packet_id) {
            debug!("PUBACK for unknown packet id {} from {}", packet_id, client_id);
        }
        // Acknowledging frees an in-flight slot
        self.flush_outbox().await?;
        Ok(Flow::Continue)
    }

    /// Write everything the outbox has ready
    pub(crate) async fn flush_outbox(&mut self) -> Result<(), ConnectionError> {
        let (_, session) = self.session()?;
        loop {
            let ready = session.write().outbox.take_ready(Instant::now());
            if ready.is_empty() {
                return Ok(());
            }
            self.send_publishes(&ready).await?;
        }
    }

    /// Re-send QoS 1 messages whose acknowledgement is overdue
    pub(crate) async fn reforward(&mut self) -> Result<(), ConnectionError> {
        let (client_id, session) = self.session()?;
        let due = session.write().outbox.take_due(Instant::now());
        if due.is_empty() {
            return Ok(());
        }

        debug!("Reforwarding {} messages to {}", due.len(), client_id);
        if let Some(ref metrics) = self.shared.metrics {
            metrics.reforwards_total.inc_by(due.len() as u64);
        }
        self.send_publishes(&due).await
    }

    /// Encode a batch of publishes and write it in one go
    pub(crate) async fn send_publishes(
        &mut self,
        publishes: &[Publish],
    ) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        for publish in publishes {
            self.encoder
                .encode(&Packet::Publish(publish.clone()), &mut self.write_buf)?;
        }
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        if let Some(ref metrics) = self.shared.metrics {
            metrics.publish_sent(publishes.len(), self.write_buf.len());
        }
        Ok(())
    }
}
