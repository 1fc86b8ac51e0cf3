//! Delivery of accepted connections to the broker.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, Uri, Version};
use tokio::io::{AsyncRead, AsyncWrite};

use super::details::ConnectionDetails;

/// Byte duplex handed to the broker.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed stream; the broker owns it exclusively.
pub type BrokerStream = Box<dyn AsyncStream>;

/// The HTTP request that was upgraded to a WebSocket.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Transport-specific data attached to a connection.
#[derive(Debug, Clone, Default)]
pub enum Ancillary {
    /// The transport has nothing to add.
    #[default]
    None,
    /// WebSocket connections keep their upgrade request.
    Upgrade(UpgradeRequest),
}

/// Metadata handed to the broker with each stream.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub details: ConnectionDetails,
    pub ancillary: Ancillary,
}

/// The broker's connection-acceptance entry point.
///
/// Invoked at most once per physical connection, and never for connections
/// that failed or closed before their details were known.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: BrokerStream, meta: RequestMeta);
}

#[async_trait]
impl<F, Fut> ConnectionHandler for F
where
    F: Fn(BrokerStream, RequestMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, stream: BrokerStream, meta: RequestMeta) {
        (self)(stream, meta).await
    }
}

/// One-shot delivery of a single connection.
///
/// `deliver` consumes the handoff, so a connection cannot reach the handler
/// twice.
pub struct Handoff {
    handler: Arc<dyn ConnectionHandler>,
}

impl Handoff {
    pub fn new(handler: Arc<dyn ConnectionHandler>) -> Self {
        Self { handler }
    }

    pub async fn deliver(self, stream: BrokerStream, meta: RequestMeta) {
        self.handler.handle(stream, meta).await
    }
}
