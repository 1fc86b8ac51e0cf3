//! Listener options and their validated form.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use super::details::{
    derive_local_details, ConnectionDetails, ConnectionInfo, Decoder, DeriveLocalDetails,
    ProxyHeaderDecoder,
};
use super::error::{ConfigError, TransportError};
use super::handoff::ConnectionHandler;
use super::listener::ListenerFactory;
use super::sniffer::SniffConfig;
use super::tls::TlsOptions;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Listener-wide transport error callback.
pub type TransportErrorHandler = Arc<dyn Fn(TransportError) + Send + Sync>;

/// Smallest read buffer hyper accepts for HTTP/1.
pub const MIN_HTTP1_BUF_SIZE: usize = 8192;

/// HTTP/1 server settings for WebSocket listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http1Options {
    /// Keep connections open between requests.
    pub keep_alive: bool,
    /// Read buffer limit, at least [`MIN_HTTP1_BUF_SIZE`].
    pub max_buf_size: Option<usize>,
    /// Close connections whose request head takes longer than this.
    pub header_read_timeout: Option<Duration>,
}

impl Default for Http1Options {
    fn default() -> Self {
        Self {
            keep_alive: true,
            max_buf_size: None,
            header_read_timeout: None,
        }
    }
}

/// HTTP/2 server settings for WebSocket listeners. Unset fields keep
/// hyper's defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Http2Options {
    pub max_concurrent_streams: Option<u32>,
    pub initial_stream_window_size: Option<u32>,
    /// Interval between PING frames. `None` disables keep-alive pings.
    pub keep_alive_interval: Option<Duration>,
    /// How long to wait for a PING acknowledgement.
    pub keep_alive_timeout: Option<Duration>,
}

/// Settings for the HTTP server in front of WebSocket upgrades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HttpServerOptions {
    pub http1: Http1Options,
    /// Used only when [`WebSocketOptions::http2`] is set.
    pub http2: Http2Options,
}

/// WebSocket transport settings.
#[derive(Debug, Clone, Default)]
pub struct WebSocketOptions {
    /// Serve HTTPS instead of plain HTTP.
    pub tls: Option<TlsOptions>,
    /// Also accept WebSockets over HTTP/2 (extended CONNECT).
    pub http2: bool,
    pub server: HttpServerOptions,
}

/// Every knob of a listener. All fields are optional except `handler`,
/// which [`create`](super::create) requires.
///
/// When more than one transport is set the most specific wins: a custom
/// `listener_factory`, then `tls`, then `websocket`, then plain TCP.
#[derive(Clone)]
pub struct ListenerOptions {
    pub tls: Option<TlsOptions>,
    pub websocket: Option<WebSocketOptions>,
    pub listener_factory: Option<Arc<dyn ListenerFactory>>,
    /// Look for a proxy header at the start of every connection.
    pub trust_proxy: bool,
    pub decoder: Option<Arc<dyn Decoder>>,
    pub derive_local_details: Option<DeriveLocalDetails>,
    pub on_transport_error: Option<TransportErrorHandler>,
    pub handler: Option<Arc<dyn ConnectionHandler>>,
    pub max_connections: usize,
    pub sniff: SniffConfig,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            tls: None,
            websocket: None,
            listener_factory: None,
            trust_proxy: false,
            decoder: None,
            derive_local_details: None,
            on_transport_error: None,
            handler: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            sniff: SniffConfig::default(),
        }
    }
}

impl fmt::Debug for ListenerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerOptions")
            .field("tls", &self.tls)
            .field("websocket", &self.websocket)
            .field("listener_factory", &self.listener_factory.is_some())
            .field("trust_proxy", &self.trust_proxy)
            .field("decoder", &self.decoder.is_some())
            .field("derive_local_details", &self.derive_local_details.is_some())
            .field("on_transport_error", &self.on_transport_error.is_some())
            .field("handler", &self.handler.is_some())
            .field("max_connections", &self.max_connections)
            .field("sniff", &self.sniff)
            .finish()
    }
}

impl ListenerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: impl ConnectionHandler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_websocket(mut self, websocket: WebSocketOptions) -> Self {
        self.websocket = Some(websocket);
        self
    }

    pub fn with_listener_factory(mut self, factory: impl ListenerFactory) -> Self {
        self.listener_factory = Some(Arc::new(factory));
        self
    }

    pub fn with_trust_proxy(mut self, trust_proxy: bool) -> Self {
        self.trust_proxy = trust_proxy;
        self
    }

    pub fn with_decoder(mut self, decoder: impl Decoder) -> Self {
        self.decoder = Some(Arc::new(decoder));
        self
    }

    pub fn with_derive_local_details<F>(mut self, derive: F) -> Self
    where
        F: Fn(&ConnectionInfo) -> ConnectionDetails + Send + Sync + 'static,
    {
        self.derive_local_details = Some(Arc::new(derive));
        self
    }

    pub fn on_transport_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(TransportError) + Send + Sync + 'static,
    {
        self.on_transport_error = Some(Arc::new(callback));
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_sniff(mut self, sniff: SniffConfig) -> Self {
        self.sniff = sniff;
        self
    }
}

/// The one transport a listener runs, with TLS material already loaded.
#[derive(Clone)]
pub enum TransportKind {
    Tcp,
    Tls(TlsAcceptor),
    WebSocket {
        tls: Option<TlsAcceptor>,
        http2: bool,
        server: HttpServerOptions,
    },
    Custom(Arc<dyn ListenerFactory>),
}

impl TransportKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Tls(_) => "tls",
            TransportKind::WebSocket { tls: None, .. } => "ws",
            TransportKind::WebSocket { tls: Some(_), .. } => "wss",
            TransportKind::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSocket { http2, server, .. } => f
                .debug_struct("WebSocket")
                .field("secure", &matches!(self, TransportKind::WebSocket { tls: Some(_), .. }))
                .field("http2", http2)
                .field("server", server)
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// Validated, immutable listener configuration.
pub struct ListenerConfig {
    transport: TransportKind,
    trust_proxy: bool,
    decoder: Arc<dyn Decoder>,
    derive_local_details: DeriveLocalDetails,
    on_transport_error: TransportErrorHandler,
    handler: Arc<dyn ConnectionHandler>,
    max_connections: usize,
    sniff: SniffConfig,
}

impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("transport", &self.transport)
            .field("trust_proxy", &self.trust_proxy)
            .field("max_connections", &self.max_connections)
            .field("sniff", &self.sniff)
            .finish_non_exhaustive()
    }
}

impl ListenerConfig {
    /// Resolve the transport and fill in defaults.
    pub fn from_options(options: ListenerOptions) -> Result<Self, ConfigError> {
        let handler = options.handler.ok_or(ConfigError::MissingHandler)?;

        if options.max_connections == 0 {
            return Err(ConfigError::InvalidTransport(
                "max_connections must be at least 1".to_string(),
            ));
        }

        let transport = match (options.listener_factory, options.tls, options.websocket) {
            (Some(factory), tls, websocket) => {
                if tls.is_some() || websocket.is_some() {
                    debug!("Custom listener factory shadows TLS/WebSocket options");
                }
                TransportKind::Custom(factory)
            }
            (None, Some(tls), websocket) => {
                if websocket.is_some() {
                    debug!("TLS option shadows WebSocket options");
                }
                TransportKind::Tls(tls.stream_acceptor()?)
            }
            (None, None, Some(websocket)) => {
                if let Some(size) = websocket.server.http1.max_buf_size {
                    if size < MIN_HTTP1_BUF_SIZE {
                        return Err(ConfigError::InvalidTransport(format!(
                            "http1 max_buf_size must be at least {MIN_HTTP1_BUF_SIZE}, got {size}"
                        )));
                    }
                }
                TransportKind::WebSocket {
                    tls: websocket
                        .tls
                        .as_ref()
                        .map(|tls| tls.http_acceptor(websocket.http2))
                        .transpose()?,
                    http2: websocket.http2,
                    server: websocket.server,
                }
            }
            (None, None, None) => TransportKind::Tcp,
        };

        Ok(Self {
            transport,
            trust_proxy: options.trust_proxy,
            decoder: options
                .decoder
                .unwrap_or_else(|| Arc::new(ProxyHeaderDecoder)),
            derive_local_details: options
                .derive_local_details
                .unwrap_or_else(|| Arc::new(derive_local_details)),
            on_transport_error: options
                .on_transport_error
                .unwrap_or_else(|| Arc::new(log_transport_error)),
            handler,
            max_connections: options.max_connections,
            sniff: options.sniff,
        })
    }

    pub fn transport(&self) -> &TransportKind {
        &self.transport
    }

    pub fn trust_proxy(&self) -> bool {
        self.trust_proxy
    }

    pub fn decoder(&self) -> &dyn Decoder {
        self.decoder.as_ref()
    }

    pub fn local_details(&self, info: &ConnectionInfo) -> ConnectionDetails {
        (self.derive_local_details)(info)
    }

    pub fn handler(&self) -> Arc<dyn ConnectionHandler> {
        Arc::clone(&self.handler)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn sniff(&self) -> &SniffConfig {
        &self.sniff
    }

    /// Deliver an error to the listener's callback.
    pub fn report(&self, error: TransportError) {
        (self.on_transport_error)(error)
    }
}

fn log_transport_error(error: TransportError) {
    warn!(error = %error, "Transport error");
}
