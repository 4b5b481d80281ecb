//! The duplex stream engine.
//!
//! A [`DuplexStream`] wraps one [`Conn`] and exposes independent send and
//! receive halves, half-close, and a single teardown path shared by the
//! caller's [`close`](DuplexStream::close) and the context-driven cancel.
//!
//! ## Lifecycle
//!
//! The stream state is a single atomic. It starts `Open` and moves exactly
//! once, by compare-and-swap, to one of:
//!
//! - `Closed`: the caller called `close`
//! - `Canceled` / `DeadlineExceeded`: the call's context fired
//! - `Failed`: a transport or framing error made the stream unusable
//!
//! Whoever wins the swap tears the conn down; everyone else observes the
//! terminal state. Once the state has left `Open`, every operation returns
//! the matching error immediately.
//!
//! The terminal status reported by the peer is recorded once, on the
//! `receive` call that returns `Ok(None)` or the peer's error; later calls
//! return the same outcome.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use connectrpc_duplex_core::{
    CompressionConfig, CompressionEncoding, EndOfStream, EnvelopeCodec, EnvelopeError, FrameKind,
    Framing, Metadata, Protocol, ProtocolAdapter, Status, TrailerPayload, decompress_payload,
    encode_frame, flags,
};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, warn};

use crate::conn::{Conn, ConnError, DEFAULT_BUFFER, PeerHead};
use crate::context::{CallContext, CancelReason};
use crate::error::StreamError;

/// Default bound on waiting for the transport to release a stream.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const OPEN: u8 = 0;
const CLOSED: u8 = 1;
const CANCELED: u8 = 2;
const DEADLINE: u8 = 3;
const FAILED: u8 = 4;

/// Observable lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closed,
    Canceled,
    DeadlineExceeded,
    Failed,
}

impl StreamState {
    fn from_u8(state: u8) -> Self {
        match state {
            OPEN => StreamState::Open,
            CLOSED => StreamState::Closed,
            CANCELED => StreamState::Canceled,
            DEADLINE => StreamState::DeadlineExceeded,
            _ => StreamState::Failed,
        }
    }
}

/// Which end of the exchange a stream sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Handler,
}

/// Per-stream limits and policies.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Largest message accepted from the peer, after decompression.
    pub read_max_bytes: Option<usize>,
    /// Largest message `send` accepts.
    pub send_max_bytes: Option<usize>,
    /// Compression applied to sent messages.
    pub compression: CompressionConfig,
    /// Bound on waiting for teardown when the context has no deadline.
    pub close_timeout: Duration,
    /// Capacity of the channels between the conn and its bodies.
    pub buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_max_bytes: None,
            send_max_bytes: None,
            compression: CompressionConfig::default(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            buffer: DEFAULT_BUFFER,
        }
    }
}

impl StreamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_max_bytes(mut self, limit: usize) -> Self {
        self.read_max_bytes = Some(limit);
        self
    }

    pub fn send_max_bytes(mut self, limit: usize) -> Self {
        self.send_max_bytes = Some(limit);
        self
    }

    pub fn compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn buffer(mut self, capacity: usize) -> Self {
        self.buffer = capacity.max(1);
        self
    }
}

/// A bidirectional stream over one [`Conn`].
///
/// Cloning yields another handle to the same stream, so a sender task, a
/// receiver task and a closer can each hold one. `send` and `receive` may
/// run concurrently with each other and with `close`; each must only be
/// driven by one task at a time.
pub struct DuplexStream<C: Conn> {
    inner: Arc<Inner<C>>,
}

impl<C: Conn> Clone for DuplexStream<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Conn> std::fmt::Debug for DuplexStream<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexStream")
            .field("protocol", &self.inner.adapter.protocol())
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Inner<C: Conn> {
    conn: C,
    adapter: &'static dyn ProtocolAdapter,
    role: Role,
    codec: String,
    config: StreamConfig,
    ctx: CallContext,
    span: Span,
    state: AtomicU8,
    send_closed: AtomicBool,
    receive_closed: AtomicBool,
    unary_sent: AtomicBool,
    head: OnceLock<PeerHead>,
    recv: tokio::sync::Mutex<RecvState>,
    trailers: OnceLock<Metadata>,
    terminal: OnceLock<StreamError>,
    done: CancellationToken,
}

struct RecvState {
    buffer: BytesMut,
    codec: EnvelopeCodec,
    encoding: Option<CompressionEncoding>,
    pending_end: Option<EndOfStream>,
    outcome: Option<Result<(), StreamError>>,
}

enum Step {
    Message(Bytes),
    End(EndOfStream),
}

impl<C: Conn> DuplexStream<C> {
    /// Wrap `conn`. Spawns a watcher that cancels the stream when `ctx`
    /// fires, so this must run inside a tokio runtime.
    pub fn new(
        conn: C,
        protocol: Protocol,
        role: Role,
        codec: impl Into<String>,
        config: StreamConfig,
        ctx: CallContext,
        span: Span,
    ) -> Self {
        let adapter = protocol.adapter();
        let envelope_codec = EnvelopeCodec::new(adapter.allowed_flags())
            .with_max_message_size(config.read_max_bytes);
        let inner = Arc::new(Inner {
            conn,
            adapter,
            role,
            codec: codec.into(),
            config,
            ctx,
            span,
            state: AtomicU8::new(OPEN),
            send_closed: AtomicBool::new(false),
            receive_closed: AtomicBool::new(false),
            unary_sent: AtomicBool::new(false),
            head: OnceLock::new(),
            recv: tokio::sync::Mutex::new(RecvState {
                buffer: BytesMut::new(),
                codec: envelope_codec,
                encoding: None,
                pending_end: None,
                outcome: None,
            }),
            trailers: OnceLock::new(),
            terminal: OnceLock::new(),
            done: CancellationToken::new(),
        });
        spawn_watcher(&inner);
        Self { inner }
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.adapter.protocol()
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn context(&self) -> &CallContext {
        &self.inner.ctx
    }

    pub fn conn(&self) -> &C {
        &self.inner.conn
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn is_send_closed(&self) -> bool {
        self.inner.send_closed.load(Ordering::Acquire)
    }

    pub fn is_receive_closed(&self) -> bool {
        self.inner.receive_closed.load(Ordering::Acquire)
    }

    /// Resolves once the stream has left the `Open` state.
    pub async fn done(&self) {
        self.inner.done.cancelled().await
    }

    /// Send one message.
    ///
    /// Suspends only on transport backpressure. Fails with
    /// [`StreamError::SendAfterClose`] after `close_send`.
    pub async fn send(&self, message: Bytes) -> Result<(), StreamError> {
        let inner = &*self.inner;
        inner.check_open()?;
        if inner.send_closed.load(Ordering::Acquire) {
            return Err(StreamError::SendAfterClose);
        }
        if let Some(limit) = inner.config.send_max_bytes {
            if message.len() > limit {
                return Err(Status::resource_exhausted(format!(
                    "message of {} bytes exceeds the send limit of {limit} bytes",
                    message.len()
                ))
                .into());
            }
        }
        let data = match inner.adapter.framing() {
            Framing::Enveloped => {
                let (payload, compressed) = inner.config.compression.compress(message)?;
                let frame_flags = if compressed { flags::COMPRESSED } else { 0 };
                encode_frame(&payload, frame_flags)?
            }
            Framing::Unary => {
                if inner.unary_sent.swap(true, Ordering::AcqRel) {
                    return Err(Status::internal("unary stream already sent its message").into());
                }
                self.encode_unary(message)?
            }
        };
        inner.write(data).await
    }

    /// Compress a whole unary body with the configured encoding.
    pub(crate) fn encode_unary(&self, message: Bytes) -> Result<Bytes, StreamError> {
        match self.inner.config.compression.encoding.compressor() {
            Some(compressor) if !message.is_empty() => compressor
                .compress(&message)
                .map_err(|e| EnvelopeError::Compression(e.to_string()).into()),
            _ => Ok(message),
        }
    }

    /// Write raw bytes to the conn, mapping conn errors to stream errors.
    pub(crate) async fn write_raw(&self, data: Bytes) -> Result<(), StreamError> {
        self.inner.write(data).await
    }

    /// Half-close the send side. The receive side stays open. Idempotent.
    pub fn close_send(&self) {
        self.inner.close_send();
    }

    /// Receive the next message.
    ///
    /// Returns `Ok(Some(message))` while messages arrive, then exactly one
    /// terminal result: `Ok(None)` on a clean end or the peer's error. The
    /// trailers become available at that point. Later calls repeat the
    /// terminal result.
    pub async fn receive(&self) -> Result<Option<Bytes>, StreamError> {
        let inner = &*self.inner;
        inner.check_open()?;
        let mut recv = inner.recv.lock().await;
        if let Some(outcome) = &recv.outcome {
            return outcome.clone().map(|()| None);
        }
        match inner.receive_step(&mut recv).await {
            Ok(Step::Message(message)) => Ok(Some(message)),
            Ok(Step::End(end)) => inner.finish_receive(&mut recv, end),
            Err(err) => inner.fail_receive(&mut recv, err),
        }
    }

    /// Headers of the peer's message head. On the client this waits for the
    /// response head and validates it.
    pub async fn peer_headers(&self) -> Result<Metadata, StreamError> {
        self.inner.check_open()?;
        let head = self.inner.peer_head().await?;
        Ok(Metadata::new(head.headers.clone()))
    }

    /// Trailers reported by the peer, available once `receive` has returned
    /// its terminal result.
    pub fn trailers(&self) -> Option<&Metadata> {
        self.inner.trailers.get()
    }

    /// The terminal error recorded during the stream's life, if any.
    pub fn terminal_error(&self) -> Option<&StreamError> {
        self.inner.terminal.get()
    }

    /// Send the terminal status in the protocol's trailer representation and
    /// finish the send side.
    pub(crate) async fn write_terminal(&self, payload: TrailerPayload) -> Result<(), StreamError> {
        let inner = &*self.inner;
        inner.check_open()?;
        match payload {
            TrailerPayload::Frame(frame) => {
                debug!(parent: &inner.span, "writing trailer frame");
                inner.write(frame).await?;
                inner.close_send();
                Ok(())
            }
            TrailerPayload::Trailers(trailers) => {
                debug!(parent: &inner.span, "writing trailers");
                inner.send_closed.store(true, Ordering::Release);
                inner
                    .conn
                    .write_trailers(trailers)
                    .await
                    .map_err(|e| inner.write_error(e))
            }
            TrailerPayload::Unary { body, .. } => {
                if !body.is_empty() {
                    inner.write(body).await?;
                }
                inner.close_send();
                Ok(())
            }
        }
    }

    /// Tear the stream down.
    ///
    /// Marks both directions closed, cancels the conn so in-flight `send`
    /// and `receive` calls return promptly, waits (bounded by the context's
    /// deadline or [`StreamConfig::close_timeout`]) for the transport to
    /// release the exchange, then returns the terminal error recorded
    /// during the stream's life. Calling it again returns the same result;
    /// calling it after the context fired returns that cancellation error.
    pub async fn close(&self) -> Result<(), StreamError> {
        let inner = &*self.inner;
        match inner
            .state
            .compare_exchange(OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!(parent: &inner.span, "closing stream");
                inner.teardown();
                inner.await_teardown().await;
                inner.terminal_result()
            }
            Err(CLOSED) => {
                inner.await_teardown().await;
                inner.terminal_result()
            }
            Err(_) => {
                inner.await_teardown().await;
                Err(inner.state_error())
            }
        }
    }

    /// Cancel the stream as if its context had been cancelled.
    ///
    /// Returns the error later operations observe: the cancellation error,
    /// or [`StreamError::AlreadyClosed`] if `close` won the race.
    pub fn cancel(&self) -> StreamError {
        self.inner.cancel(CancelReason::Canceled)
    }
}

impl<C: Conn> Inner<C> {
    /// Level-triggered context check: a context that already fired cancels
    /// the stream before the operation proceeds.
    fn check_open(&self) -> Result<(), StreamError> {
        if self.state.load(Ordering::Acquire) == OPEN {
            if let Some(reason) = self.ctx.fired() {
                return Err(self.cancel(reason));
            }
            return Ok(());
        }
        Err(self.state_error())
    }

    fn state_error(&self) -> StreamError {
        match self.state.load(Ordering::Acquire) {
            CANCELED | OPEN => StreamError::Canceled,
            DEADLINE => StreamError::DeadlineExceeded,
            FAILED => self
                .terminal
                .get()
                .cloned()
                .unwrap_or(StreamError::ConnClosed),
            _ => StreamError::AlreadyClosed,
        }
    }

    fn conn_error(&self, err: ConnError) -> StreamError {
        match err {
            ConnError::Canceled => self.state_error(),
            other => other.into(),
        }
    }

    fn terminal_result(&self) -> Result<(), StreamError> {
        match self.terminal.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn write(&self, data: Bytes) -> Result<(), StreamError> {
        self.conn.write(data).await.map_err(|e| self.write_error(e))
    }

    /// A transport failure on the send path ends the stream. `Closed` only
    /// means the peer stopped reading; its verdict arrives through `receive`.
    fn write_error(&self, err: ConnError) -> StreamError {
        match err {
            ConnError::Transport(message) => self.fail(StreamError::Transport(message)),
            other => self.conn_error(other),
        }
    }

    /// Record `err` as the terminal error and tear the stream down, unless
    /// the stream already left `Open`; then the state's error wins. A
    /// failure caused by our own context firing reports the context.
    fn fail(&self, err: StreamError) -> StreamError {
        if let Some(reason) = self.ctx.fired() {
            return self.cancel(reason);
        }
        match self
            .state
            .compare_exchange(OPEN, FAILED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                warn!(parent: &self.span, error = %err, "stream failed");
                let _ = self.terminal.set(err.clone());
                self.teardown();
                err
            }
            Err(_) => self.state_error(),
        }
    }

    fn close_send(&self) {
        if !self.send_closed.swap(true, Ordering::AcqRel) {
            debug!(parent: &self.span, "send side half-closed");
            self.conn.close_send();
        }
    }

    fn cancel(&self, reason: CancelReason) -> StreamError {
        let (next, err) = match reason {
            CancelReason::Canceled => (CANCELED, StreamError::Canceled),
            CancelReason::DeadlineExceeded => (DEADLINE, StreamError::DeadlineExceeded),
        };
        match self
            .state
            .compare_exchange(OPEN, next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!(parent: &self.span, reason = ?reason, "stream canceled");
                self.teardown();
                err
            }
            Err(_) => self.state_error(),
        }
    }

    /// Runs once, by whoever moved the state out of `Open`.
    fn teardown(&self) {
        self.send_closed.store(true, Ordering::Release);
        self.receive_closed.store(true, Ordering::Release);
        self.conn.cancel();
        self.done.cancel();
    }

    async fn await_teardown(&self) {
        let bound = match self.ctx.remaining() {
            Some(remaining) if !remaining.is_zero() => remaining.min(self.config.close_timeout),
            _ => self.config.close_timeout,
        };
        if tokio::time::timeout(bound, self.conn.closed()).await.is_err() {
            warn!(parent: &self.span, timeout = ?bound, "transport did not release the stream in time");
        } else {
            debug!(parent: &self.span, "stream torn down");
        }
    }

    async fn peer_head(&self) -> Result<&PeerHead, StreamError> {
        if let Some(head) = self.head.get() {
            return Ok(head);
        }
        let head = self
            .conn
            .peer_head()
            .await
            .map_err(|e| self.conn_error(e))?;
        if self.role == Role::Client {
            self.adapter
                .validate_response(head.status, &head.headers, &self.codec)?;
        }
        Ok(self.head.get_or_init(|| head))
    }

    fn receive_encoding(
        &self,
        recv: &mut RecvState,
        head: &PeerHead,
    ) -> Result<CompressionEncoding, StreamError> {
        if let Some(encoding) = recv.encoding {
            return Ok(encoding);
        }
        let value = head
            .headers
            .get(self.adapter.encoding_header())
            .and_then(|v| v.to_str().ok());
        let encoding = CompressionEncoding::from_header(value).ok_or_else(|| {
            Status::unimplemented(format!(
                "unsupported compression {:?}",
                value.unwrap_or_default()
            ))
        })?;
        recv.encoding = Some(encoding);
        Ok(encoding)
    }

    async fn receive_step(&self, recv: &mut RecvState) -> Result<Step, StreamError> {
        if let Some(end) = recv.pending_end.take() {
            return Ok(Step::End(end));
        }
        let head = self.peer_head().await?;
        let encoding = self.receive_encoding(recv, head)?;
        match self.adapter.framing() {
            Framing::Enveloped => self.next_envelope(recv, head, encoding).await,
            Framing::Unary => self.read_unary(recv, head, encoding).await,
        }
    }

    async fn next_envelope(
        &self,
        recv: &mut RecvState,
        head: &PeerHead,
        encoding: CompressionEncoding,
    ) -> Result<Step, StreamError> {
        let limit = self.config.read_max_bytes;
        loop {
            if let Some(envelope) = recv.codec.decode(&mut recv.buffer)? {
                return match self.adapter.classify(envelope.flags)? {
                    FrameKind::Message { compressed } => {
                        let payload = if compressed {
                            decompress_payload(envelope.payload, encoding, limit)?
                        } else {
                            envelope.payload
                        };
                        Ok(Step::Message(payload))
                    }
                    FrameKind::Trailer { compressed } => {
                        if self.role == Role::Handler {
                            return Err(EnvelopeError::MalformedFrame(envelope.flags).into());
                        }
                        let payload = if compressed {
                            decompress_payload(envelope.payload, encoding, limit)?
                        } else {
                            envelope.payload
                        };
                        debug!(parent: &self.span, "trailer frame received");
                        Ok(Step::End(self.adapter.unwrap_trailer_frame(&payload)?))
                    }
                };
            }
            match self.conn.read().await.map_err(|e| self.conn_error(e))? {
                Some(chunk) => recv.buffer.extend_from_slice(&chunk),
                None => {
                    // decode() drained every whole frame, so leftover bytes
                    // are a truncated one.
                    recv.codec.decode_eof(&mut recv.buffer)?;
                    return self.end_of_body(head);
                }
            }
        }
    }

    fn end_of_body(&self, head: &PeerHead) -> Result<Step, StreamError> {
        match self.role {
            Role::Handler => Ok(Step::End(EndOfStream::default())),
            Role::Client => {
                let trailers = self.conn.trailers();
                let end =
                    self.adapter
                        .unwrap_trailers(head.status, &head.headers, trailers.as_ref())?;
                Ok(Step::End(end))
            }
        }
    }

    async fn read_unary(
        &self,
        recv: &mut RecvState,
        head: &PeerHead,
        encoding: CompressionEncoding,
    ) -> Result<Step, StreamError> {
        let limit = self.config.read_max_bytes;
        let mut body = BytesMut::new();
        while let Some(chunk) = self.conn.read().await.map_err(|e| self.conn_error(e))? {
            body.extend_from_slice(&chunk);
            if let Some(limit) = limit {
                if body.len() > limit {
                    return Err(EnvelopeError::FrameTooLarge {
                        size: body.len(),
                        limit,
                    }
                    .into());
                }
            }
        }
        let body = body.freeze();
        let body = if encoding.is_identity() || body.is_empty() {
            body
        } else {
            decompress_payload(body, encoding, limit)?
        };
        match self.role {
            Role::Handler => {
                recv.pending_end = Some(EndOfStream::default());
                Ok(Step::Message(body))
            }
            Role::Client => {
                let response = self.adapter.unwrap_unary(head.status, &head.headers, body)?;
                match response.message {
                    Some(message) => {
                        recv.pending_end = Some(response.end);
                        Ok(Step::Message(message))
                    }
                    None => Ok(Step::End(response.end)),
                }
            }
        }
    }

    fn finish_receive(
        &self,
        recv: &mut RecvState,
        end: EndOfStream,
    ) -> Result<Option<Bytes>, StreamError> {
        self.receive_closed.store(true, Ordering::Release);
        // A stream cancelled while the trailers were in flight reports the
        // cancellation, not the late trailers.
        if self.state.load(Ordering::Acquire) != OPEN {
            let err = self.state_error();
            recv.outcome = Some(Err(err.clone()));
            return Err(err);
        }
        let _ = self.trailers.set(end.trailers);
        let outcome = match end.error {
            None => Ok(()),
            Some(status) => {
                let err = StreamError::Status(status);
                let _ = self.terminal.set(err.clone());
                Err(err)
            }
        };
        debug!(parent: &self.span, ok = outcome.is_ok(), "receive side reached end of stream");
        recv.outcome = Some(outcome.clone());
        outcome.map(|()| None)
    }

    fn fail_receive(
        &self,
        recv: &mut RecvState,
        err: StreamError,
    ) -> Result<Option<Bytes>, StreamError> {
        self.receive_closed.store(true, Ordering::Release);
        let err = self.fail(err);
        recv.outcome = Some(Err(err.clone()));
        Err(err)
    }
}

impl<C: Conn> Drop for Inner<C> {
    fn drop(&mut self) {
        if *self.state.get_mut() == OPEN {
            self.conn.cancel();
        }
        self.done.cancel();
    }
}

/// Convert the context firing into `cancel`. The task holds only a weak
/// reference and exits once the stream is done.
fn spawn_watcher<C: Conn>(inner: &Arc<Inner<C>>) {
    let weak: Weak<Inner<C>> = Arc::downgrade(inner);
    let ctx = inner.ctx.clone();
    let done = inner.done.clone();
    tokio::spawn(async move {
        let reason = tokio::select! {
            biased;
            _ = done.cancelled() => return,
            reason = ctx.done() => reason,
        };
        if let Some(inner) = weak.upgrade() {
            inner.cancel(reason);
        }
    });
}
