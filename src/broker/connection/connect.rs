//! CONNECT packet handling

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Buf;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{violation, Connection, ConnectionError, State};
use crate::persistence::PersistenceOp;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolError, ProtocolVersion,
};
use crate::topic::validate_topic_name;
use crate::transport::Transport;

/// Capacity of the per-connection event channel
const EVENT_CHANNEL_SIZE: usize = 4;

/// Prefix of identifiers assigned to clients that send an empty one
const GENERATED_ID_PREFIX: &str = "edgehub-";

/// Check a client identifier against the allowed charset and length
pub(crate) fn is_valid_client_id(client_id: &str, max_length: usize) -> bool {
    !client_id.is_empty()
        && client_id.len() <= max_length
        && client_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Keep alive the broker enforces for a requested value
///
/// Returns the negotiated interval and the read timeout (1.5x), or `None`
/// when keep alive is disabled.
pub(crate) fn negotiate_keep_alive(
    requested: u16,
    default_keep_alive: u16,
    max_keep_alive: u16,
) -> Option<Duration> {
    let seconds = match requested {
        0 => default_keep_alive,
        n if max_keep_alive > 0 => n.min(max_keep_alive),
        n => n,
    };
    if seconds == 0 {
        return None;
    }
    Some(Duration::from_millis(u64::from(seconds) * 1500))
}

fn refusal_label(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::UnacceptableProtocolVersion => "unacceptable_protocol_version",
        ConnectReturnCode::IdentifierRejected => "identifier_rejected",
        ConnectReturnCode::ServerUnavailable => "server_unavailable",
        ConnectReturnCode::BadUserNameOrPassword => "bad_username_or_password",
        _ => "not_authorized",
    }
}

impl<T: Transport> Connection<T> {
    /// Read and process the CONNECT packet
    pub(crate) async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);
                    return match packet {
                        Packet::Connect(connect) => self.handle_connect(*connect).await,
                        _ => {
                            debug!("First packet from {} was not CONNECT", self.addr);
                            Err(violation("first packet must be CONNECT"))
                        }
                    };
                }
                Ok(None) => {}
                Err(DecodeError::InvalidProtocolVersion(level)) => {
                    debug!("Unsupported protocol level {} from {}", level, self.addr);
                    return self
                        .refuse(ConnectReturnCode::UnacceptableProtocolVersion)
                        .await;
                }
                Err(e) => return Err(e.into()),
            }

            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(ConnectionError::Closed);
            }
        }
    }

    /// Answer CONNACK with an error code and fail the connection
    pub(crate) async fn refuse(&mut self, code: ConnectReturnCode) -> Result<(), ConnectionError> {
        self.send_packet(&Packet::ConnAck(ConnAck::refused(code)))
            .await?;
        if let Some(ref metrics) = self.shared.metrics {
            metrics.connection_refused(refusal_label(code));
        }
        Err(ProtocolError::ConnectionRefused(code as u8).into())
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        let shared = self.shared.clone();
        let config = &shared.config;
        self.encoder.set_protocol_version(connect.protocol_version);

        // Client identifier
        let client_id: Arc<str> = if connect.client_id.is_empty() {
            if !connect.clean_session {
                debug!("Empty client ID without clean session from {}", self.addr);
                return self.refuse(ConnectReturnCode::IdentifierRejected).await;
            }
            format!("{}{}", GENERATED_ID_PREFIX, uuid::Uuid::new_v4().simple()).into()
        } else if is_valid_client_id(&connect.client_id, config.max_client_id_length) {
            connect.client_id.as_str().into()
        } else {
            debug!("Rejecting client ID {:?} from {}", connect.client_id, self.addr);
            return self.refuse(ConnectReturnCode::IdentifierRejected).await;
        };

        debug!("CONNECT from {} (client_id: {})", self.addr, client_id);

        if config.max_connections > 0
            && shared.connections.load(std::sync::atomic::Ordering::Relaxed)
                > config.max_connections
        {
            warn!("Connection limit reached, refusing {}", client_id);
            return self.refuse(ConnectReturnCode::ServerUnavailable).await;
        }

        // Authentication
        let username = connect.username.as_deref();
        if self.stream.has_client_certificate() {
            match shared
                .hooks
                .on_authenticate_certificate(&client_id, username)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Certificate client {} not authorized", client_id);
                    return self.refuse(ConnectReturnCode::NotAuthorized).await;
                }
                Err(e) => {
                    warn!("Certificate authentication error for {}: {}", client_id, e);
                    return self.refuse(ConnectReturnCode::ServerUnavailable).await;
                }
            }
        } else {
            match shared
                .hooks
                .on_authenticate(&client_id, username, connect.password.as_deref())
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Authentication failed for {}", client_id);
                    return self
                        .refuse(ConnectReturnCode::BadUserNameOrPassword)
                        .await;
                }
                Err(e) => {
                    warn!("Authentication error for {}: {}", client_id, e);
                    return self.refuse(ConnectReturnCode::ServerUnavailable).await;
                }
            }
        }
        self.username = connect.username.clone();

        // Will message
        if let Some(ref will) = connect.will {
            let allowed = will.qos.is_supported()
                && validate_topic_name(&will.topic, &config.topic_limits).is_ok()
                && matches!(
                    shared
                        .hooks
                        .on_publish_check(
                            &client_id,
                            self.username.as_deref(),
                            &will.topic,
                            will.qos,
                            will.retain,
                        )
                        .await,
                    Ok(true)
                );
            if !allowed {
                debug!("Will on {:?} refused for {}", will.topic, client_id);
                return self.refuse(ConnectReturnCode::NotAuthorized).await;
            }
        }
        self.will = connect.will;

        self.keep_alive = negotiate_keep_alive(
            connect.keep_alive,
            config.default_keep_alive,
            config.max_keep_alive,
        );

        // Session
        let (session, resumed) = shared
            .sessions
            .get_or_create(&client_id, connect.clean_session);
        if !resumed {
            shared.subscriptions.unsubscribe_all(&client_id);
            if connect.clean_session {
                if let Some(ref persistence) = shared.persistence {
                    persistence.write(PersistenceOp::DeleteSession {
                        client_id: client_id.to_string(),
                    });
                }
            }
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        session.write().attach(self.connection_id, tx);
        self.events = Some(rx);
        self.state = State::Connected {
            client_id: client_id.clone(),
            session: session.clone(),
        };

        let session_present = resumed && connect.protocol_version == ProtocolVersion::V311;
        self.send_packet(&Packet::ConnAck(ConnAck::accepted(session_present)))
            .await?;

        if let Some(ref metrics) = shared.metrics {
            metrics.client_connected();
            metrics.sessions_current.set(shared.sessions.len() as i64);
        }
        info!(
            "Client {} connected from {} (clean_session: {}, resumed: {})",
            client_id, self.addr, connect.clean_session, resumed
        );

        if resumed {
            let inflight = session.write().outbox.take_all_inflight(Instant::now());
            if !inflight.is_empty() {
                debug!("Resending {} in-flight messages to {}", inflight.len(), client_id);
                self.send_publishes(&inflight).await?;
            }
        }
        self.flush_outbox().await?;

        shared
            .hooks
            .on_client_connected(&client_id, self.username.as_deref())
            .await;

        Ok(())
    }
}
