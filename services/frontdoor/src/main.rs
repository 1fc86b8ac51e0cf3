//! Broker front door
//!
//! Accepts client connections and hands them to the broker with resolved
//! client endpoints.
//!
//! This service:
//! - Binds one listener per configured transport (TCP, TLS, WebSocket)
//! - Optionally strips PROXY protocol headers from a trusted load balancer
//! - Logs each connection's details and drains its bytes (stand-in broker)

use std::sync::atomic::Ordering;

use anyhow::{bail, Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use frontdoor::acceptor::{
    create, BrokerStream, ListenerHandle, ListenerOptions, RequestMeta, SniffConfig, TlsOptions,
    WebSocketOptions,
};
use frontdoor::config::{Config, ListenerKind};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FRONTDOOR_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting front door");
    info!(
        listener_count = config.listeners.len(),
        trust_proxy = config.trust_proxy,
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let tls = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => Some(
            TlsOptions::from_pem_files(cert, key).context("Failed to load TLS certificate")?,
        ),
        _ => None,
    };

    let mut handles: Vec<ListenerHandle> = Vec::new();
    for binding in &config.listeners {
        let options = listener_options(&config, binding.kind, tls.clone())?;
        let listener = create(options)
            .with_context(|| format!("Invalid configuration for {}", binding.addr))?;

        match listener.bind(binding.addr).await {
            Ok(bound) => handles.push(bound.spawn()),
            Err(e) => {
                // Already reported through the listener's error callback.
                error!(bind_addr = %binding.addr, error = %e, "Failed to bind listener");
            }
        }
    }

    if handles.is_empty() {
        bail!("No listener could be bound");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    for handle in &handles {
        handle.shutdown();
    }
    for handle in handles {
        let local_addr = handle.local_addr();
        let stats = handle.stats();
        info!(
            bind_addr = %local_addr,
            accepted = stats.connections_accepted.load(Ordering::Relaxed),
            rejected = stats.connections_rejected.load(Ordering::Relaxed),
            proxy_headers = stats.proxy_headers.load(Ordering::Relaxed),
            transport_errors = stats.transport_errors.load(Ordering::Relaxed),
            "Listener summary"
        );
        handle.stopped().await;
    }

    Ok(())
}

fn listener_options(
    config: &Config,
    kind: ListenerKind,
    tls: Option<TlsOptions>,
) -> Result<ListenerOptions> {
    let mut options = ListenerOptions::new()
        .with_handler(log_and_drain)
        .with_trust_proxy(config.trust_proxy)
        .with_max_connections(config.max_connections)
        .with_sniff(SniffConfig {
            timeout: config.sniff_timeout,
            ..SniffConfig::default()
        });

    let certificate = || tls.clone().context("TLS listener without certificate");

    options = match kind {
        ListenerKind::Tcp => options,
        ListenerKind::Tls => options.with_tls(certificate()?),
        ListenerKind::Ws => options.with_websocket(WebSocketOptions::default()),
        ListenerKind::Wss => options.with_websocket(WebSocketOptions {
            tls: Some(certificate()?),
            http2: false,
            ..WebSocketOptions::default()
        }),
        ListenerKind::H2 => options.with_websocket(WebSocketOptions {
            tls: None,
            http2: true,
            ..WebSocketOptions::default()
        }),
        ListenerKind::H2s => options.with_websocket(WebSocketOptions {
            tls: Some(certificate()?),
            http2: true,
            ..WebSocketOptions::default()
        }),
    };
    Ok(options)
}

/// Stand-in broker: log who connected, then read until the client leaves.
async fn log_and_drain(mut stream: BrokerStream, meta: RequestMeta) {
    match serde_json::to_string(&meta.details) {
        Ok(details) => info!(details = %details, "Connection accepted"),
        Err(e) => error!(error = %e, "Failed to serialize connection details"),
    }

    match tokio::io::copy(&mut stream, &mut tokio::io::sink()).await {
        Ok(bytes) => info!(bytes = bytes, "Connection drained"),
        Err(e) => info!(error = %e, "Connection ended with error"),
    }
}
