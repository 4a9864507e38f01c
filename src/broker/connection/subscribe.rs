//! SUBSCRIBE and UNSUBSCRIBE handling

use tracing::{debug, warn};

use super::{Connection, ConnectionError, Flow};
use crate::protocol::{Packet, SubAck, SubAckReturnCode, Subscribe, UnsubAck, Unsubscribe};
use crate::topic::{validate_topic_filter, validate_wildcards, Subscription};
use crate::transport::Transport;

impl<T: Transport> Connection<T> {
    pub(crate) async fn handle_subscribe(
        &mut self,
        subscribe: Subscribe,
    ) -> Result<Flow, ConnectionError> {
        let (client_id, session) = self.session()?;
        let shared = self.shared.clone();

        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut granted = Vec::new();

        for request in &subscribe.filters {
            if !request.qos.is_supported() {
                debug!("{} requested QoS 2 on {}", client_id, request.filter);
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            let limits = &shared.config.topic_limits;
            if let Err(reason) = validate_topic_filter(&request.filter, limits) {
                debug!("Invalid filter {:?} from {}: {}", request.filter, client_id, reason);
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            let allowed = shared
                .hooks
                .on_subscribe_check(
                    &client_id,
                    self.username.as_deref(),
                    &request.filter,
                    request.qos,
                )
                .await;
            match allowed {
                Ok(true) => {}
                Ok(false) => {
                    debug!("{} not authorized to subscribe to {}", client_id, request.filter);
                    return_codes.push(SubAckReturnCode::Failure);
                    continue;
                }
                Err(e) => {
                    warn!("Subscribe check failed for {}: {}", client_id, e);
                    return_codes.push(SubAckReturnCode::Failure);
                    continue;
                }
            }

            {
                // Held across the index update so a takeover cannot slip in between
                let mut s = session.write();
                if !s.is_attached(self.connection_id) {
                    return Err(ConnectionError::TakenOver);
                }
                shared.subscriptions.subscribe(
                    &request.filter,
                    Subscription {
                        client_id: client_id.clone(),
                        qos: request.qos,
                    },
                );
                s.add_subscription(request.filter.clone(), request.qos);
            }
            return_codes.push(SubAckReturnCode::granted(request.qos));
            granted.push((request.filter.clone(), request.qos));
        }

        self.send_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await?;

        if let Some(ref metrics) = shared.metrics {
            metrics
                .subscriptions_current
                .set(shared.subscriptions.count() as i64);
        }

        // Retained messages follow the SUBACK
        let mut queued = false;
        for (filter, qos) in &granted {
            let retained = shared.retained.matching(filter);
            if retained.is_empty() {
                continue;
            }
            let mut s = session.write();
            for message in retained {
                queued |= s.deliver(message.to_publish(*qos)).is_stored();
            }
        }
        if queued {
            self.flush_outbox().await?;
        }

        if !granted.is_empty() {
            shared.persist_session(&client_id);
        }
        Ok(Flow::Continue)
    }

    pub(crate) async fn handle_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
    ) -> Result<Flow, ConnectionError> {
        let (client_id, session) = self.session()?;
        let shared = self.shared.clone();

        {
            let mut s = session.write();
            if !s.is_attached(self.connection_id) {
                return Err(ConnectionError::TakenOver);
            }
            for filter in &unsubscribe.filters {
                // Nothing was ever subscribed under a malformed filter
                if let Err(reason) = validate_wildcards(filter) {
                    debug!("Ignoring unsubscribe {:?} from {}: {}", filter, client_id, reason);
                    continue;
                }
                shared.subscriptions.unsubscribe(filter, &client_id);
                s.remove_subscription(filter);
            }
        }
        shared.persist_session(&client_id);

        if let Some(ref metrics) = shared.metrics {
            metrics
                .subscriptions_current
                .set(shared.subscriptions.count() as i64);
        }

        // UNSUBACK is sent even when nothing matched
        self.send_packet(&Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }))
        .await?;
        Ok(Flow::Continue)
    }
}
