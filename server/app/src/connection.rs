//! One TCP socket plus its soft state: the frame codec, a bounded outbound byte queue, the
//! connection's own idea of its nickname (kept only for quick display/logging; [`chatcore::Directory`]
//! remains the authority on uniqueness), and the keep-alive bookkeeping the reactor drives.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::time::{Duration, Instant};

use common::error::{ErrorType, NetworkError, NetworkResult};
use mio::net::TcpStream;
use wire::{codec, FrameCodec, Message, SchemaError};

/// Bytes read off the socket per `readable()` call, before they reach the codec. Unrelated to the
/// 1 KiB retained-frame cap the codec itself enforces.
const READ_CHUNK: usize = 4096;

/// Cap on how many outbound bytes the reactor drains to the socket in one `writable()` call,
/// standing in for "one platform pipe-buffer chunk" in a portable way.
const WRITE_CHUNK: usize = 65536;

pub struct Connection {
    stream: TcpStream,
    codec: FrameCodec,
    outbound: VecDeque<u8>,

    /// Display-only cache of the registered nickname; `Directory` is authoritative.
    pub nick: Option<String>,

    ping_nonce: Option<String>,
    ping_seq: u64,
    last_activity: Instant,

    /// Set once a `quit` or fatal error has scheduled this connection for teardown; the reactor
    /// closes it once `outbound` has drained.
    pub closing: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, now: Instant) -> Connection {
        Connection {
            stream,
            codec: FrameCodec::new(),
            outbound: VecDeque::new(),
            nick: None,
            ping_nonce: None,
            ping_seq: 0,
            last_activity: now,
            closing: false,
        }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Drains every readable byte off the socket into the codec, returning each complete frame.
    /// A zero-byte read is a clean disconnect and surfaces as [`NetworkError::Fatal`].
    pub fn readable(&mut self, now: Instant) -> NetworkResult<Vec<Vec<u8>>> {
        let mut buf = [0u8; READ_CHUNK];
        let mut frames = Vec::new();
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(NetworkError::Fatal(ErrorType::Disconnected)),
                Ok(n) => {
                    self.last_activity = now;
                    frames.extend(self.codec.ingest(&buf[..n]));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(frames)
    }

    /// Validates, serializes and frames `msg`, appending it to the outbound queue. Fails only if
    /// the server itself tried to send a message that doesn't pass its own schema, which is a
    /// programming error rather than anything the peer did.
    pub fn enqueue(&mut self, msg: &Message) -> Result<(), SchemaError> {
        let payload = msg.encode()?;
        self.outbound.extend(codec::frame(&payload));
        Ok(())
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Flushes up to [`WRITE_CHUNK`] bytes. A codec whose outbound queue drains to empty is simply
    /// left with nothing more to do; the reactor decides whether to keep polling for writability.
    pub fn writable(&mut self) -> NetworkResult<()> {
        while !self.outbound.is_empty() {
            let (head, _) = self.outbound.as_slices();
            let take = head.len().min(WRITE_CHUNK);
            match self.stream.write(&head[..take]) {
                Ok(0) => return Err(NetworkError::Fatal(ErrorType::Disconnected)),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Best-effort final flush, then a hard socket shutdown.
    pub fn close(&mut self) {
        let _ = self.writable();
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_activity)
    }

    pub fn has_outstanding_ping(&self) -> bool {
        self.ping_nonce.is_some()
    }

    /// Mints a fresh nonce for an outbound `ping` and remembers it as outstanding.
    pub fn issue_ping_nonce(&mut self) -> String {
        self.ping_seq += 1;
        let nonce = format!("p{}", self.ping_seq);
        self.ping_nonce = Some(nonce.clone());
        nonce
    }

    /// Clears the outstanding-ping marker and refreshes liveness, if `nonce` matches what was
    /// last sent (a stale or forged pong is otherwise ignored).
    pub fn note_pong(&mut self, nonce: &str, now: Instant) {
        if self.ping_nonce.as_deref() == Some(nonce) {
            self.ping_nonce = None;
        }
        self.last_activity = now;
    }
}
