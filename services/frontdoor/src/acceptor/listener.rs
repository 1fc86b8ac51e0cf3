//! Listener factory and accept loop.
//!
//! [`create`] validates options and picks one transport; [`Listener::bind`]
//! opens the socket; [`BoundListener::run`] accepts connections, runs any
//! TLS handshake or HTTP upgrade in a per-connection task and passes the
//! resulting stream to the [`ConnectionBinder`].

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use super::binder::{ConnectionBinder, RawStream};
use super::details::ConnectionInfo;
use super::error::{ConfigError, TransportError};
use super::handoff::Ancillary;
use super::options::{ListenerConfig, ListenerOptions, TransportKind};
use super::websocket::serve_http;

/// Pause after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Binds a custom transport.
#[async_trait]
pub trait ListenerFactory: Send + Sync + 'static {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Accept>>;
}

/// A bound custom transport.
#[async_trait]
pub trait Accept: Send + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    async fn accept(&mut self) -> io::Result<(RawStream, ConnectionInfo)>;
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently open.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections delivered to the handler.
    pub handed_off: AtomicU64,
    /// Connections whose details came from a proxy header.
    pub proxy_headers: AtomicU64,
    /// Connections that failed before a proxy header decision.
    pub sniff_failed: AtomicU64,
    /// Errors reported to `on_transport_error`.
    pub transport_errors: AtomicU64,
}

/// Holds a connection slot until the connection is finished.
pub(crate) struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
    stats: Arc<ListenerStats>,
}

impl ConnectionGuard {
    fn new(permit: OwnedSemaphorePermit, stats: Arc<ListenerStats>) -> Self {
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self {
            _permit: permit,
            stats,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Build a listener from `options`. Nothing is bound yet.
pub fn create(options: ListenerOptions) -> Result<Listener, ConfigError> {
    let config = ListenerConfig::from_options(options)?;
    debug!(
        transport = config.transport().name(),
        trust_proxy = config.trust_proxy(),
        "Listener created"
    );
    Ok(Listener {
        config: Arc::new(config),
    })
}

/// A configured, unbound listener.
#[derive(Debug)]
pub struct Listener {
    config: Arc<ListenerConfig>,
}

impl Listener {
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Open the listening socket. A failure is also reported to this
    /// listener's `on_transport_error`.
    pub async fn bind(self, addr: SocketAddr) -> Result<BoundListener, TransportError> {
        let stats = Arc::new(ListenerStats::default());
        let binder = ConnectionBinder::new(Arc::clone(&self.config), Arc::clone(&stats));

        let bound = match self.config.transport() {
            TransportKind::Custom(factory) => factory.bind(addr).await.map(Incoming::Custom),
            _ => TcpListener::bind(addr).await.map(Incoming::Tcp),
        };
        let (incoming, local_addr) = match bound.and_then(|incoming| {
            let local_addr = incoming.local_addr()?;
            Ok((incoming, local_addr))
        }) {
            Ok(bound) => bound,
            Err(source) => {
                binder.report(TransportError::Bind {
                    addr,
                    source: io::Error::new(source.kind(), source.to_string()),
                });
                return Err(TransportError::Bind { addr, source });
            }
        };

        info!(
            bind_addr = %local_addr,
            transport = self.config.transport().name(),
            max_connections = self.config.max_connections(),
            "Listener bound"
        );

        Ok(BoundListener {
            semaphore: Arc::new(Semaphore::new(self.config.max_connections())),
            config: self.config,
            binder,
            stats,
            incoming,
            local_addr,
        })
    }
}

enum Incoming {
    Tcp(TcpListener),
    Custom(Box<dyn Accept>),
}

impl Incoming {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Incoming::Tcp(listener) => listener.local_addr(),
            Incoming::Custom(accept) => accept.local_addr(),
        }
    }

    async fn accept(&mut self) -> io::Result<(RawStream, ConnectionInfo)> {
        match self {
            Incoming::Tcp(listener) => {
                let (stream, peer_addr) = listener.accept().await?;
                let local_addr = stream.local_addr()?;
                Ok((
                    RawStream::Peekable(stream),
                    ConnectionInfo::new(peer_addr, local_addr),
                ))
            }
            Incoming::Custom(accept) => accept.accept().await,
        }
    }
}

/// A listener with an open socket.
pub struct BoundListener {
    config: Arc<ListenerConfig>,
    binder: ConnectionBinder,
    stats: Arc<ListenerStats>,
    incoming: Incoming,
    local_addr: SocketAddr,
    semaphore: Arc<Semaphore>,
}

impl BoundListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &Arc<ListenerStats> {
        &self.stats
    }

    /// Accept connections until `shutdown` turns true. Connections already
    /// accepted keep running.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(bind_addr = %self.local_addr, "Listener started");

        loop {
            let accepted = tokio::select! {
                accepted = self.incoming.accept() => accepted,
                _ = stopped(&mut shutdown) => break,
            };

            match accepted {
                Ok((stream, info)) => self.dispatch(stream, info),
                Err(e) => {
                    self.binder.report(TransportError::Accept(e));
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        info!(bind_addr = %self.local_addr, "Listener stopped");
    }

    /// Run on a background task.
    pub fn spawn(self) -> ListenerHandle {
        let (shutdown, rx) = watch::channel(false);
        let local_addr = self.local_addr;
        let stats = Arc::clone(&self.stats);
        let task = tokio::spawn(self.run(rx));
        ListenerHandle {
            local_addr,
            stats,
            shutdown,
            task,
        }
    }

    fn dispatch(&self, stream: RawStream, info: ConnectionInfo) {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %info.peer_addr, "Connection rejected: max connections reached");
                return;
            }
        };

        let guard = Arc::new(ConnectionGuard::new(permit, Arc::clone(&self.stats)));
        let binder = self.binder.clone();
        let transport = self.config.transport().clone();

        tokio::spawn(
            serve_connection(transport, stream, info, binder, guard)
                .instrument(tracing::info_span!("connection", peer = %info.peer_addr)),
        );
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // Nobody can ask us to stop any more.
        std::future::pending::<()>().await;
    }
}

async fn serve_connection(
    transport: TransportKind,
    stream: RawStream,
    info: ConnectionInfo,
    binder: ConnectionBinder,
    guard: Arc<ConnectionGuard>,
) {
    match transport {
        TransportKind::Tcp | TransportKind::Custom(_) => {
            binder.bind(stream, info, Ancillary::None).await;
        }
        TransportKind::Tls(acceptor) => match acceptor.accept(stream.into_stream()).await {
            Ok(tls) => {
                binder
                    .bind(RawStream::PushOnly(Box::new(tls)), info, Ancillary::None)
                    .await;
            }
            Err(source) => binder.report(TransportError::TlsHandshake {
                peer_addr: info.peer_addr,
                source,
            }),
        },
        TransportKind::WebSocket {
            tls: None,
            http2,
            server,
        } => {
            serve_http(stream.into_stream(), info, binder, http2, server, guard).await;
        }
        TransportKind::WebSocket {
            tls: Some(acceptor),
            http2,
            server,
        } => match acceptor.accept(stream.into_stream()).await {
            Ok(tls) => serve_http(tls, info, binder, http2, server, guard).await,
            Err(source) => binder.report(TransportError::TlsHandshake {
                peer_addr: info.peer_addr,
                source,
            }),
        },
    }
}

/// Handle to a listener running on a background task.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    stats: Arc<ListenerStats>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the accept loop to exit.
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "Listener task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::handoff::{BrokerStream, RequestMeta};
    use tokio::io::AsyncWriteExt;

    fn options() -> ListenerOptions {
        ListenerOptions::new().with_handler(|mut stream: BrokerStream, _meta: RequestMeta| async move {
            let _ = stream.shutdown().await;
        })
    }

    #[test]
    fn test_listener_stats() {
        let stats = ListenerStats::default();
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_create_without_handler_fails() {
        assert!(matches!(
            create(ListenerOptions::new()),
            Err(ConfigError::MissingHandler)
        ));
    }

    #[tokio::test]
    async fn test_connection_limit_rejects_excess() {
        let listener = create(options().with_max_connections(1))
            .unwrap()
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let _held = Arc::clone(&listener.semaphore).try_acquire_owned().unwrap();
        let addr = listener.local_addr();
        let handle = listener.spawn();

        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        for _ in 0..50 {
            if handle.stats().connections_rejected.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.stats().connections_rejected.load(Ordering::Relaxed), 1);
        assert_eq!(handle.stats().connections_accepted.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let handle = create(options())
            .unwrap()
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
            .spawn();

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle.stopped())
            .await
            .unwrap();
    }
}
