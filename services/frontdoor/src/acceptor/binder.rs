//! Connection binder: decides whether a connection is sniffed for a proxy
//! header, then hands it off.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::debug;

use super::details::{ConnectionDetails, ConnectionInfo, DecodeContext};
use super::error::TransportError;
use super::handoff::{Ancillary, AsyncStream, BrokerStream, Handoff, RequestMeta};
use super::listener::ListenerStats;
use super::options::ListenerConfig;
use super::sniffer::{sniff_peekable, sniff_push_only, SniffOutcome, Sniffer};

/// A freshly accepted connection.
pub enum RawStream {
    /// A TCP socket whose receive queue can be peeked.
    Peekable(TcpStream),
    /// Anything that hands out bytes only once.
    PushOnly(BrokerStream),
}

impl RawStream {
    pub fn into_stream(self) -> BrokerStream {
        match self {
            RawStream::Peekable(stream) => Box::new(stream),
            RawStream::PushOnly(stream) => stream,
        }
    }
}

impl std::fmt::Debug for RawStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawStream::Peekable(stream) => f.debug_tuple("Peekable").field(stream).finish(),
            RawStream::PushOnly(_) => f.write_str("PushOnly"),
        }
    }
}

/// How a connection left the binder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The handler ran to completion.
    HandedOff,
    /// The transport failed before details were known.
    Failed,
    /// The client went away (or timed out) before details were known.
    Closed,
}

enum Sniffed {
    Ready(BrokerStream, ConnectionDetails),
    Failed(io::Error),
    Closed,
}

impl<S: AsyncStream + 'static> From<SniffOutcome<S>> for Sniffed {
    fn from(outcome: SniffOutcome<S>) -> Self {
        match outcome {
            SniffOutcome::Decided { stream, details } => Sniffed::Ready(Box::new(stream), details),
            SniffOutcome::Failed(e) => Sniffed::Failed(e),
            SniffOutcome::Closed => Sniffed::Closed,
        }
    }
}

/// Shared by every connection of one listener.
#[derive(Clone)]
pub struct ConnectionBinder {
    config: Arc<ListenerConfig>,
    stats: Arc<ListenerStats>,
}

impl ConnectionBinder {
    pub fn new(config: Arc<ListenerConfig>, stats: Arc<ListenerStats>) -> Self {
        Self { config, stats }
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<ListenerStats> {
        &self.stats
    }

    /// Count and deliver a transport error.
    pub fn report(&self, error: TransportError) {
        self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
        self.config.report(error);
    }

    /// Resolve details for `stream` and hand it to the downstream handler.
    pub async fn bind(
        &self,
        stream: RawStream,
        info: ConnectionInfo,
        ancillary: Ancillary,
    ) -> BindOutcome {
        let local = self.config.local_details(&info);

        if !self.config.trust_proxy() {
            self.hand_off(stream.into_stream(), local, ancillary).await;
            return BindOutcome::HandedOff;
        }

        let sniffed = {
            let ctx = DecodeContext {
                info: &info,
                ancillary: &ancillary,
                local: &local,
            };
            let sniff = self.config.sniff();
            let sniffer = Sniffer::new(self.config.decoder(), ctx, sniff);
            let sniffing = async {
                match stream {
                    RawStream::Peekable(tcp) => {
                        Sniffed::from(sniff_peekable(tcp, sniffer, sniff).await)
                    }
                    RawStream::PushOnly(live) => {
                        Sniffed::from(sniff_push_only(live, sniffer, sniff).await)
                    }
                }
            };

            match sniff.timeout {
                Some(limit) => match tokio::time::timeout(limit, sniffing).await {
                    Ok(sniffed) => sniffed,
                    Err(_) => {
                        debug!(peer_addr = %info.peer_addr, "No proxy header decision before timeout");
                        Sniffed::Closed
                    }
                },
                None => sniffing.await,
            }
        };

        match sniffed {
            Sniffed::Ready(stream, details) => {
                if details.via_proxy_header || details.proxy_header_version != 0 {
                    self.stats.proxy_headers.fetch_add(1, Ordering::Relaxed);
                }
                self.hand_off(stream, details, ancillary).await;
                BindOutcome::HandedOff
            }
            Sniffed::Failed(source) => {
                self.stats.sniff_failed.fetch_add(1, Ordering::Relaxed);
                self.report(TransportError::Sniff {
                    peer_addr: info.peer_addr,
                    source,
                });
                BindOutcome::Failed
            }
            Sniffed::Closed => {
                debug!(peer_addr = %info.peer_addr, "Connection closed before proxy header decision");
                BindOutcome::Closed
            }
        }
    }

    async fn hand_off(&self, stream: BrokerStream, details: ConnectionDetails, ancillary: Ancillary) {
        debug!(
            source = %details.source(),
            destination = %details.destination(),
            proxy_header_version = details.proxy_header_version,
            "Handing off connection"
        );
        self.stats.handed_off.fetch_add(1, Ordering::Relaxed);
        Handoff::new(self.config.handler())
            .deliver(stream, RequestMeta { details, ancillary })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::details::{Decoded, Decoder, Probe, ProxyHeaderDecoder};
    use crate::acceptor::options::ListenerOptions;
    use crate::acceptor::sniffer::SniffConfig;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[derive(Clone, Default)]
    struct Counting(Arc<AtomicUsize>);

    impl Decoder for Counting {
        fn probe(&self, data: &[u8]) -> Probe {
            ProxyHeaderDecoder.probe(data)
        }

        fn decode(&self, ctx: &DecodeContext<'_>, data: &[u8]) -> Decoded {
            self.0.fetch_add(1, Ordering::SeqCst);
            ProxyHeaderDecoder.decode(ctx, data)
        }
    }

    type Captured = Arc<Mutex<Vec<(Vec<u8>, RequestMeta)>>>;

    type Errors = Arc<Mutex<Vec<String>>>;

    fn make_binder(
        trust_proxy: bool,
        decoder: Counting,
        sniff: SniffConfig,
    ) -> (ConnectionBinder, Captured, Errors) {
        let captured: Captured = Arc::default();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        let error_sink = Arc::clone(&errors);

        let options = ListenerOptions::new()
            .with_trust_proxy(trust_proxy)
            .with_decoder(decoder)
            .with_sniff(sniff)
            .on_transport_error(move |e| error_sink.lock().unwrap().push(e.to_string()))
            .with_handler(move |mut stream: BrokerStream, meta: RequestMeta| {
                let sink = Arc::clone(&sink);
                async move {
                    let mut bytes = Vec::new();
                    stream.read_to_end(&mut bytes).await.unwrap();
                    sink.lock().unwrap().push((bytes, meta));
                }
            });
        let config = Arc::new(ListenerConfig::from_options(options).unwrap());
        (
            ConnectionBinder::new(config, Arc::new(ListenerStats::default())),
            captured,
            errors,
        )
    }

    fn info() -> ConnectionInfo {
        ConnectionInfo::new(
            "10.2.2.2:40000".parse().unwrap(),
            "10.0.0.1:1883".parse().unwrap(),
        )
    }

    fn push_only(chunks: &[&[u8]]) -> RawStream {
        let mut builder = tokio_test::io::Builder::new();
        for chunk in chunks {
            builder.read(chunk);
        }
        RawStream::PushOnly(Box::new(builder.build()))
    }

    #[tokio::test]
    async fn test_untrusted_skips_decoder() {
        let decoder = Counting::default();
        let (binder, captured, _) = make_binder(false, decoder.clone(), SniffConfig::default());

        let header = b"PROXY TCP4 192.168.1.128 0.0.0.0 12345 4883\r\nPUBLISHxxx";
        let outcome = binder.bind(push_only(&[header]), info(), Ancillary::None).await;

        assert_eq!(outcome, BindOutcome::HandedOff);
        assert_eq!(decoder.0.load(Ordering::SeqCst), 0);
        let captured = captured.lock().unwrap();
        assert_eq!(captured[0].0, header.to_vec());
        assert_eq!(captured[0].1.details, ConnectionDetails::from_socket(&info()));
    }

    #[tokio::test]
    async fn test_trusted_strips_header() {
        let decoder = Counting::default();
        let (binder, captured, _) = make_binder(true, decoder.clone(), SniffConfig::default());

        let outcome = binder
            .bind(
                push_only(&[b"PROXY TCP4 192.168.1.128 0.0.0.0 12345 4883\r\nPUBLISHxxx"]),
                info(),
                Ancillary::None,
            )
            .await;

        assert_eq!(outcome, BindOutcome::HandedOff);
        assert_eq!(decoder.0.load(Ordering::SeqCst), 1);
        assert_eq!(binder.stats().proxy_headers.load(Ordering::Relaxed), 1);
        let captured = captured.lock().unwrap();
        assert_eq!(captured[0].0, b"PUBLISHxxx");
        assert_eq!(captured[0].1.details.source(), "192.168.1.128:12345".parse().unwrap());
    }

    #[tokio::test]
    async fn test_error_before_decision_is_reported() {
        let decoder = Counting::default();
        let (binder, captured, errors) = make_binder(true, decoder.clone(), SniffConfig::default());

        let stream = tokio_test::io::Builder::new()
            .read(b"PROXY TCP4")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let outcome = binder
            .bind(RawStream::PushOnly(Box::new(stream)), info(), Ancillary::None)
            .await;

        assert_eq!(outcome, BindOutcome::Failed);
        assert_eq!(decoder.0.load(Ordering::SeqCst), 0);
        assert!(captured.lock().unwrap().is_empty());
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(binder.stats().transport_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_close_before_decision_is_silent() {
        let (binder, captured, errors) =
            make_binder(true, Counting::default(), SniffConfig::default());

        let outcome = binder.bind(push_only(&[b"PROXY TC"]), info(), Ancillary::None).await;

        assert_eq!(outcome, BindOutcome::Closed);
        assert!(captured.lock().unwrap().is_empty());
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sniff_timeout_drops_connection() {
        let sniff = SniffConfig {
            timeout: Some(Duration::from_millis(50)),
            ..SniffConfig::default()
        };
        let (binder, captured, _) = make_binder(true, Counting::default(), sniff);

        let (_client, server) = tokio::io::duplex(64);
        let outcome = binder
            .bind(RawStream::PushOnly(Box::new(server)), info(), Ancillary::None)
            .await;

        assert_eq!(outcome, BindOutcome::Closed);
        assert!(captured.lock().unwrap().is_empty());
    }
}
