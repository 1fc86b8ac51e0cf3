//! Proxy header sniffing.
//!
//! A per-connection state machine reads the first bytes of a connection,
//! asks the [`Decoder`] once for connection details, and rebuilds a stream
//! that starts right after the header:
//!
//! ```text
//! WaitingFirstBytes -> Decoding -> Split -> (handed off)
//!         |               |
//!         +---> Errored / Closed
//! ```
//!
//! Two drivers feed it:
//! - [`sniff_peekable`] peeks the kernel queue of a TCP socket and, once the
//!   decision is made, consumes only the header bytes.
//! - [`sniff_push_only`] reads chunks into a [`RewindBuffer`] and replays
//!   everything past the header before live reads (TLS, WebSocket, custom).
//!
//! Nothing is read after the decision until the downstream handler reads,
//! so back-pressure is left to the transport.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tracing::{trace, warn};

use super::details::{ConnectionDetails, DecodeContext, Decoded, Decoder, Probe};
use super::rewind::{Rewind, RewindBuffer};

/// Default cap on bytes buffered while waiting for a complete header.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 4096;

/// Default size of each read while sniffing.
pub const DEFAULT_READ_CHUNK: usize = 4096;

/// Sniffing limits.
#[derive(Debug, Clone)]
pub struct SniffConfig {
    /// Stop waiting for more header bytes once this many are buffered and
    /// decide with what is there.
    pub max_header_bytes: usize,
    /// Size of each read from a push-only transport.
    pub read_chunk: usize,
    /// Give up on clients that send nothing decidable in time. `None` waits
    /// forever.
    pub timeout: Option<Duration>,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            read_chunk: DEFAULT_READ_CHUNK,
            timeout: None,
        }
    }
}

/// Sniffer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffState {
    WaitingFirstBytes,
    Decoding,
    Split,
    Errored,
    Closed,
}

impl SniffState {
    /// Whether no further events are accepted.
    pub fn is_final(self) -> bool {
        matches!(self, SniffState::Split | SniffState::Errored | SniffState::Closed)
    }
}

/// Events delivered by the transport.
#[derive(Debug)]
pub enum SniffEvent {
    DataAvailable(Bytes),
    Error(io::Error),
    Closed,
}

/// What the driver should do after an event.
#[derive(Debug)]
pub enum Step {
    /// Read more.
    Wait,
    /// Stop reading; split the stream at `header_len`.
    Decided(Decoded),
    /// The transport failed before a decision.
    Failed(io::Error),
    /// The transport closed before a decision.
    Closed,
    /// The event arrived after a final state and was dropped.
    Ignored,
}

/// Per-connection header sniffer.
pub struct Sniffer<'a> {
    state: SniffState,
    buffer: RewindBuffer,
    decoder: &'a dyn Decoder,
    ctx: DecodeContext<'a>,
    max_header_bytes: usize,
}

impl<'a> Sniffer<'a> {
    pub fn new(decoder: &'a dyn Decoder, ctx: DecodeContext<'a>, config: &SniffConfig) -> Self {
        Self {
            state: SniffState::WaitingFirstBytes,
            buffer: RewindBuffer::new(),
            decoder,
            ctx,
            max_header_bytes: config.max_header_bytes.max(1),
        }
    }

    pub fn state(&self) -> SniffState {
        self.state
    }

    /// Bytes held for replay.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Advance the state machine.
    pub fn on_event(&mut self, event: SniffEvent) -> Step {
        if self.state.is_final() {
            return Step::Ignored;
        }

        match event {
            SniffEvent::DataAvailable(chunk) => {
                self.buffer.feed(&chunk);
                self.state = SniffState::Decoding;

                if !self.ready(self.buffer.as_slice()) {
                    trace!(buffered = self.buffer.len(), "Waiting for more header bytes");
                    self.state = SniffState::WaitingFirstBytes;
                    return Step::Wait;
                }

                let decoded = decide(self.decoder, &self.ctx, self.buffer.as_slice());
                self.state = SniffState::Split;
                Step::Decided(decoded)
            }
            SniffEvent::Error(e) => {
                self.state = SniffState::Errored;
                Step::Failed(e)
            }
            SniffEvent::Closed => {
                self.state = SniffState::Closed;
                Step::Closed
            }
        }
    }

    /// Rebuild the stream after a decision: buffered bytes past
    /// `header_len`, then `live`.
    pub fn into_stream<S>(self, header_len: usize, live: S) -> Rewind<S> {
        self.buffer.cut(header_len, live)
    }

    fn ready(&self, data: &[u8]) -> bool {
        data.len() >= self.max_header_bytes || self.decoder.probe(data) == Probe::Complete
    }
}

/// Run the decoder. Callers move the sniffer to `Split` right after, and
/// only a non-final sniffer gets here, so it runs at most once.
fn decide(decoder: &dyn Decoder, ctx: &DecodeContext<'_>, data: &[u8]) -> Decoded {
    let mut decoded = decoder.decode(ctx, data);
    if decoded.header_len > data.len() {
        warn!(
            header_len = decoded.header_len,
            available = data.len(),
            "Decoder reported a header longer than the input, keeping all bytes"
        );
        decoded.header_len = 0;
    }
    decoded
}

/// Result of sniffing one connection.
#[derive(Debug)]
pub enum SniffOutcome<S> {
    /// Details are known; `stream` starts right after the header.
    Decided {
        stream: Rewind<S>,
        details: ConnectionDetails,
    },
    /// The transport failed before a decision.
    Failed(io::Error),
    /// The transport closed before a decision.
    Closed,
}

/// Sniff a transport that can only hand out bytes once.
pub async fn sniff_push_only<S>(
    mut stream: S,
    mut sniffer: Sniffer<'_>,
    config: &SniffConfig,
) -> SniffOutcome<S>
where
    S: AsyncRead + Unpin,
{
    let read_chunk = config.read_chunk.max(1);

    loop {
        let mut chunk = BytesMut::with_capacity(read_chunk);
        let event = match stream.read_buf(&mut chunk).await {
            Ok(0) => SniffEvent::Closed,
            Ok(_) => SniffEvent::DataAvailable(chunk.freeze()),
            Err(e) => SniffEvent::Error(e),
        };

        match sniffer.on_event(event) {
            Step::Wait => continue,
            Step::Decided(decoded) => {
                return SniffOutcome::Decided {
                    stream: sniffer.into_stream(decoded.header_len, stream),
                    details: decoded.details,
                }
            }
            Step::Failed(e) => return SniffOutcome::Failed(e),
            Step::Closed | Step::Ignored => return SniffOutcome::Closed,
        }
    }
}

/// Sniff a TCP socket by peeking at its receive queue.
///
/// When the queued bytes are enough to decide, only the header is consumed
/// and the kernel keeps everything after it. Otherwise the peeked bytes are
/// still queued, so sniffing continues with [`sniff_push_only`].
pub async fn sniff_peekable(
    mut stream: TcpStream,
    mut sniffer: Sniffer<'_>,
    config: &SniffConfig,
) -> SniffOutcome<TcpStream> {
    let mut peek_buf = vec![0u8; sniffer.max_header_bytes];
    let peeked = match stream.peek(&mut peek_buf).await {
        Ok(0) => {
            sniffer.state = SniffState::Closed;
            return SniffOutcome::Closed;
        }
        Ok(n) => &peek_buf[..n],
        Err(e) => {
            sniffer.state = SniffState::Errored;
            return SniffOutcome::Failed(e);
        }
    };

    if !sniffer.ready(peeked) {
        trace!(peeked = peeked.len(), "Header incomplete in receive queue, reading");
        return sniff_push_only(stream, sniffer, config).await;
    }

    sniffer.state = SniffState::Decoding;
    let decoded = decide(sniffer.decoder, &sniffer.ctx, peeked);
    sniffer.state = SniffState::Split;

    let mut header = vec![0u8; decoded.header_len];
    if let Err(e) = stream.read_exact(&mut header).await {
        return SniffOutcome::Failed(e);
    }

    SniffOutcome::Decided {
        stream: Rewind::passthrough(stream),
        details: decoded.details,
    }
}
