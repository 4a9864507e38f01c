//! Listener Tests for TLS, mutual TLS and WebSocket transports
//!
//! Certificates are generated per test: a throwaway CA signs the server
//! certificate and any client certificates, and the PEM files live in a
//! temporary directory.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use edgehub::auth::AuthProvider;
use edgehub::broker::{Broker, BrokerConfig};
use edgehub::codec::{Decoder, Encoder};
use edgehub::config::{AuthConfig, ServerTlsConfig, UserConfig};
use edgehub::hooks::CompositeHooks;
use edgehub::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, ProtocolVersion, Publish, QoS, Subscribe,
    SubscribeFilter,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(23000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn local(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

async fn start(broker: Broker) -> (Arc<Broker>, JoinHandle<()>) {
    let broker = Arc::new(broker);
    let runner = broker.clone();
    let handle = tokio::spawn(async move {
        let _ = runner.run().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    (broker, handle)
}

/// Throwaway certificate authority
struct TestPki {
    dir: TempDir,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl TestPki {
    fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "edgehub-test-ca");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = params.self_signed(&ca_key).unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.pem"), ca_cert.pem()).unwrap();
        Self {
            dir,
            ca_cert,
            ca_key,
        }
    }

    /// Sign a leaf certificate; returns the certificate and key as PEM
    fn issue(&self, name: &str, usage: ExtendedKeyUsagePurpose) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![usage];
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .unwrap();
        (cert.pem(), key.serialize_pem())
    }

    fn server_tls(&self, require_client_cert: bool) -> ServerTlsConfig {
        let (cert, key) = self.issue("localhost", ExtendedKeyUsagePurpose::ServerAuth);
        let cert_path = self.dir.path().join("server.pem");
        let key_path = self.dir.path().join("server.key");
        std::fs::write(&cert_path, cert).unwrap();
        std::fs::write(&key_path, key).unwrap();

        ServerTlsConfig {
            cert: cert_path.display().to_string(),
            key: key_path.display().to_string(),
            ca_cert: Some(self.dir.path().join("ca.pem").display().to_string()),
            require_client_cert,
        }
    }

    /// Client side TLS, optionally presenting a certificate for `identity`
    fn connector(&self, identity: Option<&str>) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots
            .add(CertificateDer::from_pem_slice(self.ca_cert.pem().as_bytes()).unwrap())
            .unwrap();
        let builder = ClientConfig::builder().with_root_certificates(roots);

        let config = match identity {
            Some(name) => {
                let (cert, key) = self.issue(name, ExtendedKeyUsagePurpose::ClientAuth);
                let chain = vec![CertificateDer::from_pem_slice(cert.as_bytes()).unwrap()];
                let key = PrivateKeyDer::from_pem_slice(key.as_bytes()).unwrap();
                builder.with_client_auth_cert(chain, key).unwrap()
            }
            None => builder.with_no_client_auth(),
        };
        TlsConnector::from(Arc::new(config))
    }
}

async fn tls_connect(
    connector: &TlsConnector,
    port: u16,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(local(port)).await?;
    let server_name = ServerName::try_from("localhost").unwrap();
    connector.connect(server_name, tcp).await
}

fn connect_packet(client_id: &str, username: Option<&str>) -> Packet {
    Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V311,
        client_id: client_id.to_string(),
        clean_session: true,
        keep_alive: 60,
        username: username.map(str::to_string),
        password: None,
        will: None,
    }))
}

/// MQTT over any byte stream
struct StreamClient<S> {
    stream: S,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> StreamClient<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            encoder: Encoder::new(ProtocolVersion::V311),
            decoder: Decoder::new(),
            buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, packet: &Packet) -> std::io::Result<()> {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf).expect("Failed to encode");
        self.stream.write_all(&buf).await?;
        self.stream.flush().await
    }

    /// Next packet, or `None` on timeout, error or close
    async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Ok(Some((packet, consumed))) = self.decoder.decode(&self.buf) {
                let _ = self.buf.split_to(consumed);
                return Some(packet);
            }
            match timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) if n > 0 => continue,
                _ => return None,
            }
        }
    }

    async fn handshake(&mut self, client_id: &str, username: Option<&str>) -> ConnAck {
        self.send(&connect_packet(client_id, username))
            .await
            .expect("Failed to write CONNECT");
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }
}

/// MQTT over WebSocket binary frames
struct WsClient<S> {
    ws: tokio_tungstenite::WebSocketStream<S>,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WsClient<S> {
    async fn upgrade(stream: S, path: &str) -> Self {
        // TLS, if any, is already established on the stream
        let mut request = format!("ws://localhost{}", path)
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("sec-websocket-protocol", HeaderValue::from_static("mqtt"));
        let (ws, response) = tokio_tungstenite::client_async(request, stream)
            .await
            .expect("WebSocket upgrade failed");
        assert_eq!(
            response.headers().get("sec-websocket-protocol").unwrap(),
            "mqtt"
        );
        Self {
            ws,
            encoder: Encoder::new(ProtocolVersion::V311),
            decoder: Decoder::new(),
            buf: BytesMut::new(),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf).expect("Failed to encode");
        self.ws.send(Message::Binary(buf.to_vec())).await.unwrap();
    }

    async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Ok(Some((packet, consumed))) = self.decoder.decode(&self.buf) {
                let _ = self.buf.split_to(consumed);
                return Some(packet);
            }
            match timeout(Duration::from_secs(5), self.ws.next()).await {
                Ok(Some(Ok(Message::Binary(data)))) => self.buf.extend_from_slice(&data),
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }
}

fn tls_config(port: u16, tls_port: u16, tls: ServerTlsConfig) -> BrokerConfig {
    BrokerConfig {
        bind_addr: local(port),
        tls_bind_addr: Some(local(tls_port)),
        tls: Some(tls),
        ..Default::default()
    }
}

fn certificate_hooks() -> Arc<CompositeHooks> {
    let auth_config = AuthConfig {
        enabled: true,
        allow_anonymous: false,
        users: vec![UserConfig {
            username: "device-1".to_string(),
            password: None,
            password_hash: None,
            role: None,
        }],
    };
    let auth = Arc::new(AuthProvider::new(&auth_config));
    Arc::new(CompositeHooks::new().with(auth))
}

#[tokio::test]
async fn test_tls_listener_routes_to_plain_clients() {
    let pki = TestPki::new();
    let (port, tls_port) = (next_port(), next_port());
    let config = tls_config(port, tls_port, pki.server_tls(false));
    let (_broker, handle) = start(Broker::new(config)).await;

    let mut plain = StreamClient::new(TcpStream::connect(local(port)).await.unwrap());
    assert_eq!(
        plain.handshake("plain-sub", None).await.return_code,
        ConnectReturnCode::Accepted
    );
    plain
        .send(&Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters: vec![SubscribeFilter {
                filter: "secure/#".to_string(),
                qos: QoS::AtMostOnce,
            }],
        }))
        .await
        .unwrap();
    assert!(matches!(plain.recv().await, Some(Packet::SubAck(_))));

    let stream = tls_connect(&pki.connector(None), tls_port).await.unwrap();
    let mut secure = StreamClient::new(stream);
    assert_eq!(
        secure.handshake("tls-pub", None).await.return_code,
        ConnectReturnCode::Accepted
    );
    secure
        .send(&Packet::Publish(Publish {
            topic: "secure/data".into(),
            payload: bytes::Bytes::from_static(b"encrypted"),
            ..Default::default()
        }))
        .await
        .unwrap();

    match plain.recv().await {
        Some(Packet::Publish(p)) => assert_eq!(&p.payload[..], b"encrypted"),
        other => panic!("Expected PUBLISH, got {:?}", other),
    }

    handle.abort();
}

#[tokio::test]
async fn test_mutual_tls_checks_principal() {
    let pki = TestPki::new();
    let (port, tls_port) = (next_port(), next_port());
    let config = tls_config(port, tls_port, pki.server_tls(true));
    let (_broker, handle) = start(Broker::with_hooks(config, certificate_hooks())).await;
    let connector = pki.connector(Some("device-1"));

    let mut known = StreamClient::new(tls_connect(&connector, tls_port).await.unwrap());
    let ack = known.handshake("cert-known", Some("device-1")).await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);

    let mut unknown = StreamClient::new(tls_connect(&connector, tls_port).await.unwrap());
    let ack = unknown.handshake("cert-unknown", Some("intruder")).await;
    assert_eq!(ack.return_code, ConnectReturnCode::NotAuthorized);

    let mut anonymous = StreamClient::new(tls_connect(&connector, tls_port).await.unwrap());
    let ack = anonymous.handshake("cert-anon", None).await;
    assert_eq!(ack.return_code, ConnectReturnCode::NotAuthorized);

    // Without a certificate the server aborts the handshake; with TLS 1.3
    // the client only notices on its first read
    match tls_connect(&pki.connector(None), tls_port).await {
        Err(_) => {}
        Ok(stream) => {
            let mut client = StreamClient::new(stream);
            let _ = client.send(&connect_packet("no-cert", Some("device-1"))).await;
            assert!(client.recv().await.is_none());
        }
    }

    handle.abort();
}

#[tokio::test]
async fn test_tls_and_plain_do_not_mix() {
    let pki = TestPki::new();
    let (port, tls_port) = (next_port(), next_port());
    let config = tls_config(port, tls_port, pki.server_tls(false));
    let (_broker, handle) = start(Broker::new(config)).await;

    // Plain MQTT on the TLS port fails the TLS handshake
    let mut plain = StreamClient::new(TcpStream::connect(local(tls_port)).await.unwrap());
    let _ = plain.send(&connect_packet("plain-on-tls", None)).await;
    assert!(plain.recv().await.is_none());

    // A ClientHello on the plain port is a malformed MQTT packet
    let result = timeout(
        Duration::from_secs(5),
        tls_connect(&pki.connector(None), port),
    )
    .await;
    assert!(matches!(result, Ok(Err(_))));

    handle.abort();
}

#[tokio::test]
async fn test_websocket_listener() {
    let (port, ws_port) = (next_port(), next_port());
    let config = BrokerConfig {
        bind_addr: local(port),
        ws_bind_addr: Some(local(ws_port)),
        ..Default::default()
    };
    let (_broker, handle) = start(Broker::new(config)).await;

    let stream = TcpStream::connect(local(ws_port)).await.unwrap();
    let mut client = WsClient::upgrade(stream, "/mqtt").await;
    client.send(&connect_packet("ws-client", None)).await;
    match client.recv().await {
        Some(Packet::ConnAck(ack)) => assert_eq!(ack.return_code, ConnectReturnCode::Accepted),
        other => panic!("Expected CONNACK, got {:?}", other),
    }
    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));

    handle.abort();
}

#[tokio::test]
async fn test_secure_websocket_listener() {
    let pki = TestPki::new();
    let (port, wss_port) = (next_port(), next_port());
    let config = BrokerConfig {
        bind_addr: local(port),
        wss_bind_addr: Some(local(wss_port)),
        tls: Some(pki.server_tls(false)),
        ..Default::default()
    };
    let (_broker, handle) = start(Broker::new(config)).await;

    let stream = tls_connect(&pki.connector(None), wss_port).await.unwrap();
    let mut client = WsClient::upgrade(stream, "/mqtt").await;
    client.send(&connect_packet("wss-client", None)).await;
    match client.recv().await {
        Some(Packet::ConnAck(ack)) => assert_eq!(ack.return_code, ConnectReturnCode::Accepted),
        other => panic!("Expected CONNACK, got {:?}", other),
    }
    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));

    handle.abort();
}
