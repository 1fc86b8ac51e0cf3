//! WebSocket transport.
//!
//! Each accepted socket is served by hyper. Upgrade requests are accepted
//! with axum's [`WebSocketUpgrade`] extractor, and the resulting socket is
//! turned into a byte duplex for the broker: binary and text payloads are
//! read as bytes, writes go out as binary messages, and a close frame reads
//! as end of stream.

use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::FromRequestParts;
use axum::response::{IntoResponse, Response};
use bytes::{Buf, Bytes};
use futures_util::{ready, Sink, Stream};
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

use super::binder::{ConnectionBinder, RawStream};
use super::details::ConnectionInfo;
use super::error::TransportError;
use super::handoff::{Ancillary, UpgradeRequest};
use super::listener::ConnectionGuard;
use super::options::HttpServerOptions;

/// Serve HTTP on `io` until the client goes away, handing every upgraded
/// WebSocket to the binder.
pub(crate) async fn serve_http<IO>(
    io: IO,
    info: ConnectionInfo,
    binder: ConnectionBinder,
    http2: bool,
    server: HttpServerOptions,
    guard: Arc<ConnectionGuard>,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let reporter = binder.clone();
    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
        let binder = binder.clone();
        let guard = Arc::clone(&guard);
        async move { Ok::<_, Infallible>(upgrade(req, info, binder, guard).await) }
    });

    let io = TokioIo::new(io);
    let http1 = server.http1;
    let result = if http2 {
        let mut builder = auto::Builder::new(TokioExecutor::new());
        {
            let mut h1 = builder.http1();
            h1.timer(TokioTimer::new()).keep_alive(http1.keep_alive);
            if let Some(size) = http1.max_buf_size {
                h1.max_buf_size(size);
            }
            if let Some(timeout) = http1.header_read_timeout {
                h1.header_read_timeout(timeout);
            }
        }
        {
            let settings = server.http2;
            let mut h2 = builder.http2();
            h2.timer(TokioTimer::new()).enable_connect_protocol();
            if let Some(max) = settings.max_concurrent_streams {
                h2.max_concurrent_streams(max);
            }
            if let Some(size) = settings.initial_stream_window_size {
                h2.initial_stream_window_size(size);
            }
            if let Some(interval) = settings.keep_alive_interval {
                h2.keep_alive_interval(interval);
            }
            if let Some(timeout) = settings.keep_alive_timeout {
                h2.keep_alive_timeout(timeout);
            }
        }
        builder.serve_connection_with_upgrades(io, service).await
    } else {
        let mut builder = hyper::server::conn::http1::Builder::new();
        builder.timer(TokioTimer::new()).keep_alive(http1.keep_alive);
        if let Some(size) = http1.max_buf_size {
            builder.max_buf_size(size);
        }
        if let Some(timeout) = http1.header_read_timeout {
            builder.header_read_timeout(timeout);
        }
        builder
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(Into::into)
    };

    if let Err(e) = result {
        reporter.report(TransportError::Upgrade {
            peer_addr: info.peer_addr,
            message: e.to_string(),
        });
    }
}

async fn upgrade(
    req: Request<Incoming>,
    info: ConnectionInfo,
    binder: ConnectionBinder,
    guard: Arc<ConnectionGuard>,
) -> Response {
    let (mut parts, _body) = req.into_parts();
    let request = UpgradeRequest {
        method: parts.method.clone(),
        uri: parts.uri.clone(),
        version: parts.version,
        headers: parts.headers.clone(),
    };

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(
                peer_addr = %info.peer_addr,
                uri = %request.uri,
                rejection = %rejection,
                "Rejected non-WebSocket request"
            );
            return rejection.into_response();
        }
    };

    let reporter = binder.clone();
    ws.on_failed_upgrade(move |e: axum::Error| {
        reporter.report(TransportError::Upgrade {
            peer_addr: info.peer_addr,
            message: e.to_string(),
        })
    })
    .on_upgrade(move |socket| async move {
        debug!(peer_addr = %info.peer_addr, version = ?request.version, "WebSocket upgraded");
        let stream = Box::new(WebSocketByteStream::new(socket));
        binder
            .bind(RawStream::PushOnly(stream), info, Ancillary::Upgrade(request))
            .await;
        drop(guard);
    })
}

/// A WebSocket read and written as a plain byte stream.
pub struct WebSocketByteStream<S = WebSocket> {
    inner: S,
    pending: Bytes,
    closed: bool,
}

impl<S> WebSocketByteStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            closed: false,
        }
    }
}

fn to_io_error(e: axum::Error) -> io::Error {
    io::Error::other(e)
}

impl<S> AsyncRead for WebSocketByteStream<S>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            if self.closed {
                return Poll::Ready(Ok(()));
            }

            let message = match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    self.closed = true;
                    return Poll::Ready(Err(to_io_error(e)));
                }
                None => {
                    self.closed = true;
                    continue;
                }
            };

            match message {
                Message::Binary(data) => self.pending = data,
                Message::Text(text) => {
                    self.pending = Bytes::copy_from_slice(text.as_str().as_bytes())
                }
                Message::Ping(_) | Message::Pong(_) => trace!("WebSocket control frame skipped"),
                Message::Close(frame) => {
                    debug!(frame = ?frame, "WebSocket closed by peer");
                    self.closed = true;
                }
            }
        }
    }
}

impl<S> AsyncWrite for WebSocketByteStream<S>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "WebSocket connection closed",
            )));
        }

        ready!(Pin::new(&mut self.inner).poll_ready(cx)).map_err(to_io_error)?;
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(to_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(to_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(to_io_error)
    }
}
