//! Listener error types.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised while turning [`ListenerOptions`](super::ListenerOptions)
/// into a listener. Nothing is bound when one of these is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No downstream handler was configured.
    #[error("missing downstream connection handler")]
    MissingHandler,

    /// TLS material could not be loaded.
    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] TlsError),

    /// The transport options contradict each other.
    #[error("invalid transport configuration: {0}")]
    InvalidTransport(String),
}

/// Errors loading TLS server material.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Reading a PEM file failed.
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The certificate chain is empty or unparsable.
    #[error("no certificates found in PEM input")]
    NoCertificates,

    /// No private key is present in the PEM input.
    #[error("no private key found in PEM input")]
    NoPrivateKey,

    /// PEM decoding failed.
    #[error("malformed PEM input: {0}")]
    Pem(io::Error),

    /// rustls rejected the certificate/key pair.
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Errors delivered to the listener-wide `on_transport_error` callback.
///
/// None of these ever reach the downstream handler; the affected connection
/// is dropped.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Accepting a connection failed.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The TLS handshake with a client failed.
    #[error("TLS handshake with {peer_addr} failed: {source}")]
    TlsHandshake {
        peer_addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Serving HTTP or upgrading to WebSocket failed.
    #[error("WebSocket upgrade from {peer_addr} failed: {message}")]
    Upgrade {
        peer_addr: SocketAddr,
        message: String,
    },

    /// The connection errored before a proxy header decision was made.
    #[error("connection from {peer_addr} failed while sniffing: {source}")]
    Sniff {
        peer_addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}
