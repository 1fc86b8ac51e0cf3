//! Transport-agnostic connection acceptance.
//!
//! A listener accepts connections over one transport (plain TCP, TLS,
//! WebSocket over HTTP/1.1, HTTPS or HTTP/2, or a custom factory), optionally
//! strips a PROXY protocol header the load balancer put in front of the
//! client's bytes, and hands the stream to the broker exactly once:
//!
//! ```text
//! create(options) -> Listener -> bind -> accept loop
//!     -> per connection: [TLS handshake | HTTP upgrade]
//!         -> ConnectionBinder -> [Sniffer] -> Handoff -> ConnectionHandler
//! ```

mod binder;
mod details;
mod error;
mod handoff;
mod listener;
mod options;
mod rewind;
mod sniffer;
mod tls;
mod websocket;

pub use binder::{BindOutcome, ConnectionBinder, RawStream};
pub use details::{
    derive_local_details, ConnectionDetails, ConnectionInfo, DecodeContext, Decoded, Decoder,
    DeriveLocalDetails, Probe, ProxyHeaderDecoder,
};
pub use error::{ConfigError, TlsError, TransportError};
pub use handoff::{
    Ancillary, AsyncStream, BrokerStream, ConnectionHandler, Handoff, RequestMeta, UpgradeRequest,
};
pub use listener::{
    create, Accept, BoundListener, Listener, ListenerFactory, ListenerHandle, ListenerStats,
};
pub use options::{
    Http1Options, Http2Options, HttpServerOptions, ListenerConfig, ListenerOptions,
    TransportErrorHandler, TransportKind, WebSocketOptions, DEFAULT_MAX_CONNECTIONS,
    MIN_HTTP1_BUF_SIZE,
};
pub use rewind::{Rewind, RewindBuffer};
pub use sniffer::{
    sniff_peekable, sniff_push_only, SniffConfig, SniffEvent, SniffOutcome, SniffState, Sniffer,
    Step, DEFAULT_MAX_HEADER_BYTES, DEFAULT_READ_CHUNK,
};
pub use tls::TlsOptions;
pub use websocket::WebSocketByteStream;
