//! Connection teardown and will message publishing

use std::mem;

use tracing::{debug, info};

use super::{Connection, State};
use crate::protocol::Publish;
use crate::rule::MessageContext;
use crate::session::Detached;
use crate::transport::Transport;

impl<T: Transport> Connection<T> {
    /// Release the session and publish the will after an abnormal close
    pub(crate) async fn close(&mut self, graceful: bool) {
        let State::Connected { client_id, .. } = mem::replace(&mut self.state, State::Closed)
        else {
            return;
        };
        let shared = self.shared.clone();

        match shared.sessions.disconnect(&client_id, self.connection_id) {
            Detached::Removed => {
                shared.subscriptions.unsubscribe_all(&client_id);
            }
            Detached::Retained => {
                shared.persist_session(&client_id);
            }
            Detached::Superseded => {
                debug!("Session of {} is owned by a newer connection", client_id);
            }
        }

        // DISCONNECT discards the will
        let will = self.will.take();
        if !graceful {
            if let Some(will) = will {
                debug!("Publishing will of {} to {}", client_id, will.topic);
                let publish = Publish {
                    qos: will.qos,
                    retain: will.retain,
                    topic: will.topic.as_str().into(),
                    payload: will.payload,
                    ..Default::default()
                };
                let origin = MessageContext {
                    client_id: client_id.clone(),
                    client_ip: Some(self.addr.ip()),
                    topic: publish.topic.clone(),
                    qos: publish.qos,
                };
                shared.router.publish(&publish, &origin);
            }
        }

        shared.hooks.on_client_disconnected(&client_id, graceful).await;

        if let Some(ref metrics) = shared.metrics {
            metrics.client_disconnected();
            metrics.sessions_current.set(shared.sessions.len() as i64);
            metrics
                .subscriptions_current
                .set(shared.subscriptions.count() as i64);
        }

        info!(
            "Client {} disconnected from {} (graceful: {})",
            client_id, self.addr, graceful
        );
    }
}
