
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use frontdoor::acceptor::{
    create, Accept, ConfigError, ConnectionInfo, ListenerFactory, ListenerOptions, RawStream,
    TransportError, WebSocketOptions,
};
use frontdoor_proxy_header::ProxyHeader;
use harness::{capturing_options, next_connection, spawn_listener, ErrorLog, TestCert, PAYLOAD};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

/// Serves TCP connections as push-only streams, like a transport that
/// cannot peek.
struct PushOnlyTcp;

struct PushOnlyAccept(TcpListener);

#[async_trait]
impl ListenerFactory for PushOnlyTcp {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Accept>> {
        Ok(Box::new(PushOnlyAccept(TcpListener::bind(addr).await?)))
    }
}

#[async_trait]
impl Accept for PushOnlyAccept {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }

    async fn accept(&mut self) -> io::Result<(RawStream, ConnectionInfo)> {
        let (stream, peer_addr) = self.0.accept().await?;
        let info = ConnectionInfo::new(peer_addr, stream.local_addr()?);
        Ok((RawStream::PushOnly(Box::new(stream)), info))
    }
}

#[tokio::test]
async fn missing_handler_fails_for_every_transport() {
    let cert = TestCert::generate();
    let variants = [
        ListenerOptions::new(),
        ListenerOptions::new().with_tls(cert.tls_options()),
        ListenerOptions::new().with_websocket(WebSocketOptions::default()),
        ListenerOptions::new().with_websocket(WebSocketOptions {
            tls: Some(cert.tls_options()),
            http2: true,
            ..WebSocketOptions::default()
        }),
        ListenerOptions::new().with_listener_factory(PushOnlyTcp),
    ];

    for options in variants {
        assert!(matches!(create(options), Err(ConfigError::MissingHandler)));
    }
}

#[tokio::test]
async fn address_in_use_reaches_own_callback_only() {
    let first_errors = ErrorLog::default();
    let (options, mut rx) = capturing_options();
    let first = spawn_listener(first_errors.attach(options)).await;

    let second_errors = ErrorLog::default();
    let (options, _second_rx) = capturing_options();
    let result = create(second_errors.attach(options))
        .unwrap()
        .bind(first.local_addr())
        .await;

    match result {
        Err(TransportError::Bind { addr, source }) => {
            assert_eq!(addr, first.local_addr());
            assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("second bind on the same address succeeded"),
    }
    assert_eq!(second_errors.entries().len(), 1);
    assert!(first_errors.entries().is_empty());

    // The first listener is unaffected.
    let mut stream = TcpStream::connect(first.local_addr()).await.unwrap();
    stream.write_all(PAYLOAD).await.unwrap();
    stream.shutdown().await.unwrap();
    assert_eq!(next_connection(&mut rx).await.bytes, PAYLOAD);
}

#[tokio::test]
async fn custom_factory_takes_precedence_and_sniffs() {
    let cert = TestCert::generate();
    let (options, mut rx) = capturing_options();
    let listener = spawn_listener(
        options
            .with_tls(cert.tls_options())
            .with_listener_factory(PushOnlyTcp)
            .with_trust_proxy(true),
    )
    .await;

    let header = ProxyHeader::v2(
        "198.51.100.4:51000".parse().unwrap(),
        "198.51.100.1:1883".parse().unwrap(),
    )
    .encode();

    // Plain TCP works because the custom factory shadows the TLS option.
    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
    stream.write_all(&header[..10]).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    stream
        .write_all(&[&header[10..], PAYLOAD].concat())
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    let captured = next_connection(&mut rx).await;
    assert_eq!(
        captured.meta.details.source(),
        "198.51.100.4:51000".parse().unwrap()
    );
    assert_eq!(captured.meta.details.proxy_header_version, 2);
    assert_eq!(captured.bytes, PAYLOAD);
}
