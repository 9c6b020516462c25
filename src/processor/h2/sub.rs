//! Per-connection frame state machine.
//!
//! # Data Flow
//! ```text
//! PREFACE (frontend only)
//!     → FIRST_SETTINGS_HEADER → FIRST_SETTINGS_PAYLOAD
//!     → FRAME_HEADER → HEADERS_PAYLOAD  → (CONTINUATION_HEADER → CONTINUATION_PAYLOAD)*
//!                    → DATA_PAYLOAD     (proxied, clamped to the target's send window)
//!                    → OTHER_PAYLOAD
//!     → FRAME_HEADER ...
//! ```
//!
//! Header blocks are assembled across CONTINUATION frames, decoded once with
//! this connection's decoder, and re-encoded for the target direction.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::context::H2Context;
use super::frame::{
    Frame, FrameHeader, FrameType, Headers, PushPromise, Settings, ACK, END_STREAM, HEADER_LEN,
    MAX_PAYLOAD_LEN, PREFACE,
};
use super::hpack::{HeaderDecoder, HeaderEncoder, HeaderList};
use super::{backend_handshake, server_settings};
use super::stream::StreamRef;
use crate::observability::metrics;
use crate::processor::{
    ConnId, HandleTodo, Hint, ProcessError, ProcessorTodo, ProxyDone, Target, Want,
};

/// Length of a tunnel proxy segment; the tunnel never ends on its own.
const TUNNEL_LEN: usize = usize::MAX;

const FORWARDED_FOR: &[u8] = b"x-forwarded-for";
const CLIENT_PORT: &[u8] = b"x-client-port";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preface,
    FirstSettingsHeader,
    FirstSettingsPayload,
    FrameHeader,
    HeadersPayload,
    DataPayload,
    OtherPayload,
    ContinuationHeader,
    ContinuationPayload,
}

#[derive(Debug)]
enum BlockKind {
    Headers { end_stream: bool },
    PushPromise { promised_id: u32 },
}

#[derive(Debug)]
struct HeaderBlock {
    kind: BlockKind,
    stream_id: u32,
    fragments: BytesMut,
}

#[derive(Debug)]
struct DataTransfer {
    source: StreamRef,
    target: StreamRef,
    remaining: usize,
    in_flight: Option<usize>,
    end_stream: bool,
}

#[derive(Debug)]
struct PendingHeaders {
    stream_id: u32,
    headers: HeaderList,
    end_stream: bool,
}

#[derive(Debug, Default)]
struct Output {
    send: Option<Bytes>,
    require_connection: bool,
}

impl Output {
    fn none() -> Self {
        Self::default()
    }

    fn send(bytes: Bytes) -> Self {
        Self {
            send: Some(bytes),
            require_connection: false,
        }
    }
}

#[derive(Debug)]
pub struct H2SubContext {
    conn_id: ConnId,
    peer_addr: SocketAddr,
    state: State,
    want: usize,
    frame: Option<FrameHeader>,
    discard: bool,
    block: Option<HeaderBlock>,
    data: Option<DataTransfer>,
    pending: Option<PendingHeaders>,
    decoder: HeaderDecoder,
    produced: BytesMut,
}

fn proxy_target(source: ConnId, target: ConnId) -> Option<Target> {
    source.is_frontend().then_some(Target::Conn(target))
}

fn header_value<'a>(headers: &'a HeaderList, name: &[u8]) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_slice())
}

fn strip_forwarding(headers: &mut HeaderList) {
    headers.retain(|(n, _)| {
        !n.eq_ignore_ascii_case(FORWARDED_FOR) && !n.eq_ignore_ascii_case(CLIENT_PORT)
    });
}

/// Serialize a header block as HEADERS or PUSH_PROMISE plus CONTINUATION
/// frames, each no larger than `max_frame`.
fn encode_block(
    kind: &BlockKind,
    stream_id: u32,
    headers: &HeaderList,
    encoder: &mut HeaderEncoder,
    max_frame: usize,
) -> Bytes {
    let mut block = encoder.encode(headers);
    let mut dst = BytesMut::new();

    let first_max = match kind {
        BlockKind::Headers { .. } => max_frame,
        BlockKind::PushPromise { .. } => max_frame - 4,
    };
    let first = block.split_to(block.len().min(first_max));
    let end_headers = block.is_empty();
    let frame = match kind {
        BlockKind::Headers { end_stream } => Frame::Headers(Headers {
            stream_id,
            end_stream: *end_stream,
            end_headers,
            priority: None,
            pad_len: None,
            fragment: first,
        }),
        BlockKind::PushPromise { promised_id } => Frame::PushPromise(PushPromise {
            stream_id,
            end_headers,
            promised_id: *promised_id,
            pad_len: None,
            fragment: first,
        }),
    };
    frame.encode(&mut dst);

    while !block.is_empty() {
        let fragment = block.split_to(block.len().min(max_frame));
        Frame::Continuation {
            stream_id,
            end_headers: block.is_empty(),
            fragment,
        }
        .encode(&mut dst);
    }
    dst.freeze()
}

impl H2SubContext {
    pub(crate) fn new(conn_id: ConnId, peer_addr: SocketAddr) -> Self {
        let (state, want) = if conn_id.is_frontend() {
            (State::Preface, PREFACE.len())
        } else {
            (State::FirstSettingsHeader, HEADER_LEN)
        };
        Self {
            conn_id,
            peer_addr,
            state,
            want,
            frame: None,
            discard: false,
            block: None,
            data: None,
            pending: None,
            decoder: HeaderDecoder::new(),
            produced: BytesMut::new(),
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub(crate) fn process(&mut self, ctx: &mut H2Context) -> ProcessorTodo {
        if let Some(tunnel) = ctx.tunnel {
            return ProcessorTodo::proxy(TUNNEL_LEN, proxy_target(self.conn_id, tunnel));
        }
        if self.state == State::DataPayload {
            return self.data_chunk(ctx);
        }
        if self.pending.is_some() {
            return ProcessorTodo::handle(Want::Nothing);
        }
        ProcessorTodo::handle(Want::Exactly(self.want))
    }

    fn data_chunk(&mut self, ctx: &mut H2Context) -> ProcessorTodo {
        let source = self.conn_id;
        let Some(transfer) = self.data.as_mut() else {
            return ProcessorTodo::handle(Want::Exactly(self.want));
        };
        let target = proxy_target(source, transfer.target.conn);
        if let Some(len) = transfer.in_flight {
            return ProcessorTodo::proxy(len, target);
        }
        let capacity = ctx.send_capacity(transfer.target);
        if capacity == 0 {
            debug!(conn = %source, to = %transfer.target.conn, "Send window exhausted, pausing");
            ctx.block(transfer.target.conn, source);
            return ProcessorTodo::proxy(0, target);
        }
        let len = transfer.remaining.min(capacity);
        transfer.in_flight = Some(len);
        ProcessorTodo::proxy(len, target)
    }

    pub(crate) fn proxy_done(&mut self, ctx: &mut H2Context) -> Option<ProxyDone> {
        if ctx.tunnel.is_some() {
            return None;
        }
        let transfer = self.data.as_mut()?;
        let sent = transfer.in_flight.take().unwrap_or(0);
        ctx.consume_send(transfer.target, sent);
        transfer.remaining -= sent;
        if transfer.remaining > 0 {
            return Some(ProxyDone { frame_ends: false });
        }
        let transfer = self.data.take()?;
        if transfer.end_stream {
            ctx.end_stream(transfer.source);
        }
        self.expect_frame();
        Some(ProxyDone { frame_ends: true })
    }

    pub(crate) fn feed(&mut self, ctx: &mut H2Context, data: Bytes) -> Result<HandleTodo, ProcessError> {
        ctx.sweep(self.conn_id);
        let output = match self.pending.take() {
            Some(pending) => self.flush_pending(ctx, pending)?,
            None => match self.state {
                State::Preface => self.read_preface(data)?,
                State::FirstSettingsHeader | State::FrameHeader | State::ContinuationHeader => {
                    self.read_header(ctx, data)?
                }
                State::FirstSettingsPayload
                | State::HeadersPayload
                | State::OtherPayload
                | State::ContinuationPayload => self.read_payload(ctx, data)?,
                State::DataPayload => {
                    return Err(ProcessError::violation("DATA payload must be proxied"));
                }
            },
        };

        let routed = output.send.is_some() || output.require_connection;
        let target = (self.conn_id.is_frontend() && routed).then(|| ctx.connection());
        let produce = (!self.produced.is_empty()).then(|| self.produced.split().freeze());
        Ok(HandleTodo {
            send: output.send,
            require_connection: output.require_connection,
            target,
            produce,
            frame_ends: self.state != State::DataPayload,
        })
    }

    fn expect_frame(&mut self) {
        self.state = State::FrameHeader;
        self.want = HEADER_LEN;
    }

    fn read_preface(&mut self, data: Bytes) -> Result<Output, ProcessError> {
        if data.as_ref() != PREFACE.as_slice() {
            return Err(ProcessError::violation("invalid connection preface"));
        }
        self.produced.extend_from_slice(&server_settings());
        self.state = State::FirstSettingsHeader;
        self.want = HEADER_LEN;
        Ok(Output::none())
    }

    fn read_header(&mut self, ctx: &mut H2Context, data: Bytes) -> Result<Output, ProcessError> {
        let header = FrameHeader::parse(&data)?;
        if self.conn_id.is_frontend() {
            ctx.current_target = None;
        }

        match self.state {
            State::FirstSettingsHeader => {
                if header.kind != FrameType::Settings || header.has(ACK) {
                    return Err(ProcessError::violation("connection must start with SETTINGS"));
                }
                self.state = State::FirstSettingsPayload;
            }
            State::ContinuationHeader => {
                let expected = self.block.as_ref().map(|b| b.stream_id);
                if header.kind != FrameType::Continuation || Some(header.stream_id) != expected {
                    return Err(ProcessError::violation(format!(
                        "expected CONTINUATION, got {:?} on stream {}",
                        header.kind, header.stream_id
                    )));
                }
                self.state = State::ContinuationPayload;
            }
            _ => match header.kind {
                FrameType::Data => return self.begin_data(ctx, header),
                FrameType::Headers | FrameType::PushPromise => self.state = State::HeadersPayload,
                FrameType::Continuation => {
                    return Err(ProcessError::violation("CONTINUATION without a header block"));
                }
                _ => self.state = State::OtherPayload,
            },
        }

        self.frame = Some(header);
        if header.length == 0 {
            return self.read_payload(ctx, Bytes::new());
        }
        self.want = header.length;
        Ok(Output::none())
    }

    fn begin_data(&mut self, ctx: &mut H2Context, header: FrameHeader) -> Result<Output, ProcessError> {
        if header.stream_id == 0 {
            return Err(ProcessError::violation("DATA on stream 0"));
        }
        let source = StreamRef::new(self.conn_id, header.stream_id);
        for update in ctx.receive_data(source, header.length)? {
            update.encode(&mut self.produced);
        }

        let Some(target) = ctx.route(source) else {
            warn!(conn = %self.conn_id, stream = header.stream_id, "DATA for a stream without a session, dropping");
            self.frame = Some(header);
            if header.length == 0 {
                self.expect_frame();
            } else {
                self.discard = true;
                self.state = State::OtherPayload;
                self.want = header.length;
            }
            return Ok(Output::none());
        };

        if self.conn_id.is_frontend() {
            ctx.current_target = Some(target.conn);
        }
        let end_stream = header.has(END_STREAM);
        let rewritten = FrameHeader {
            stream_id: target.stream,
            ..header
        };

        if header.length == 0 {
            if end_stream {
                ctx.end_stream(source);
            }
            self.expect_frame();
        } else {
            self.data = Some(DataTransfer {
                source,
                target,
                remaining: header.length,
                in_flight: None,
                end_stream,
            });
            self.state = State::DataPayload;
        }
        Ok(Output::send(rewritten.to_bytes()))
    }

    fn read_payload(&mut self, ctx: &mut H2Context, payload: Bytes) -> Result<Output, ProcessError> {
        let header = self
            .frame
            .take()
            .ok_or_else(|| ProcessError::violation("payload without a frame header"))?;
        let state = self.state;
        self.expect_frame();
        if std::mem::take(&mut self.discard) {
            return Ok(Output::none());
        }
        match state {
            State::FirstSettingsPayload => self.first_settings(ctx, &header, payload),
            State::HeadersPayload | State::ContinuationPayload => {
                self.header_block(ctx, &header, payload)
            }
            _ => self.control_frame(ctx, &header, payload),
        }
    }

    fn first_settings(
        &mut self,
        ctx: &mut H2Context,
        header: &FrameHeader,
        payload: Bytes,
    ) -> Result<Output, ProcessError> {
        let Frame::Settings(settings) = Frame::decode(header, payload.clone())? else {
            return Err(ProcessError::violation("connection must start with SETTINGS"));
        };
        if self.conn_id.is_frontend() {
            ctx.client_handshake = Some(backend_handshake(header, &payload, &settings));
        }
        ctx.apply_settings(self.conn_id, &settings, true)?;
        Frame::Settings(Settings::ack()).encode(&mut self.produced);
        debug!(conn = %self.conn_id, params = settings.params.len(), "Initial SETTINGS received");
        Ok(Output::none())
    }

    fn header_block(
        &mut self,
        ctx: &mut H2Context,
        header: &FrameHeader,
        payload: Bytes,
    ) -> Result<Output, ProcessError> {
        let end_headers = match Frame::decode(header, payload)? {
            Frame::Headers(h) => {
                self.block = Some(HeaderBlock {
                    kind: BlockKind::Headers {
                        end_stream: h.end_stream,
                    },
                    stream_id: h.stream_id,
                    fragments: BytesMut::from(&h.fragment[..]),
                });
                h.end_headers
            }
            Frame::PushPromise(p) => {
                self.block = Some(HeaderBlock {
                    kind: BlockKind::PushPromise {
                        promised_id: p.promised_id,
                    },
                    stream_id: p.stream_id,
                    fragments: BytesMut::from(&p.fragment[..]),
                });
                p.end_headers
            }
            Frame::Continuation {
                end_headers,
                fragment,
                ..
            } => {
                let block = self
                    .block
                    .as_mut()
                    .ok_or_else(|| ProcessError::violation("CONTINUATION without a header block"))?;
                if block.fragments.len() + fragment.len() > MAX_PAYLOAD_LEN {
                    return Err(ProcessError::violation("header block too large"));
                }
                block.fragments.extend_from_slice(&fragment);
                end_headers
            }
            other => {
                return Err(ProcessError::violation(format!(
                    "unexpected {:?} in header block",
                    other.kind()
                )));
            }
        };

        if !end_headers {
            self.state = State::ContinuationHeader;
            self.want = HEADER_LEN;
            return Ok(Output::none());
        }

        let Some(block) = self.block.take() else {
            return Err(ProcessError::violation("header block missing"));
        };
        let mut headers = self.decoder.decode(&block.fragments)?;
        strip_forwarding(&mut headers);
        match block.kind {
            BlockKind::Headers { end_stream } => {
                if self.conn_id.is_frontend() {
                    self.request_headers(ctx, block.stream_id, headers, end_stream)
                } else {
                    self.response_headers(ctx, block.stream_id, headers, end_stream)
                }
            }
            BlockKind::PushPromise { promised_id } => {
                self.push_promise(ctx, block.stream_id, promised_id, headers)
            }
        }
    }

    fn request_headers(
        &mut self,
        ctx: &mut H2Context,
        stream_id: u32,
        mut headers: HeaderList,
        end_stream: bool,
    ) -> Result<Output, ProcessError> {
        let at = StreamRef::new(ConnId::FRONTEND, stream_id);
        let known = ctx
            .peers
            .get(&ConnId::FRONTEND)
            .is_some_and(|p| p.streams.contains(stream_id));
        if !known {
            ctx.open_remote(at)?;
            metrics::record_h2_stream();
        }

        let host = header_value(&headers, b":authority")
            .or_else(|| header_value(&headers, b"host"))
            .map(|v| String::from_utf8_lossy(v).into_owned());
        let uri = header_value(&headers, b":path").map(|v| String::from_utf8_lossy(v).into_owned());
        let connect = header_value(&headers, b":method") == Some(b"CONNECT".as_slice());

        headers.push((FORWARDED_FOR.to_vec(), ctx.client.ip().to_string().into_bytes()));
        headers.push((CLIENT_PORT.to_vec(), ctx.client.port().to_string().into_bytes()));

        if let Some(stream) = ctx
            .peers
            .get_mut(&ConnId::FRONTEND)
            .and_then(|p| p.streams.get_mut(stream_id))
        {
            if host.is_some() || uri.is_some() {
                stream.hint = Hint::of_host_uri(host, uri);
            }
            ctx.current_hint = stream.hint.clone();
        }
        if connect {
            debug!(stream = stream_id, "CONNECT request, tunnel pending");
            ctx.upgrade = Some(stream_id);
        }

        let pending = PendingHeaders {
            stream_id,
            headers,
            end_stream,
        };
        if ctx.route(at).is_some() {
            return self.flush_pending(ctx, pending);
        }

        trace!(stream = stream_id, hint = %ctx.current_hint, "Stream needs a backend");
        ctx.pending_stream = Some(stream_id);
        self.pending = Some(pending);
        Ok(Output {
            send: None,
            require_connection: true,
        })
    }

    /// Serialize frontend headers once the stream has a backend.
    fn flush_pending(&mut self, ctx: &mut H2Context, pending: PendingHeaders) -> Result<Output, ProcessError> {
        let source = StreamRef::new(ConnId::FRONTEND, pending.stream_id);
        let target = ctx.route(source).ok_or_else(|| {
            ProcessError::violation(format!("stream {} has no backend", pending.stream_id))
        })?;
        ctx.current_target = Some(target.conn);
        let max_frame = ctx.peer_mut(target.conn)?.max_frame_size;
        let bytes = encode_block(
            &BlockKind::Headers {
                end_stream: pending.end_stream,
            },
            target.stream,
            &pending.headers,
            &mut ctx.backend_encoder,
            max_frame,
        );
        if pending.end_stream {
            ctx.end_stream(source);
        }
        Ok(Output::send(bytes))
    }

    fn response_headers(
        &mut self,
        ctx: &mut H2Context,
        stream_id: u32,
        headers: HeaderList,
        end_stream: bool,
    ) -> Result<Output, ProcessError> {
        let source = StreamRef::new(self.conn_id, stream_id);
        let Some(target) = ctx.route(source) else {
            warn!(conn = %self.conn_id, stream = stream_id, "HEADERS for a stream without a session, dropping");
            return Ok(Output::none());
        };

        if ctx.upgrade == Some(target.stream) && header_value(&headers, b":status") == Some(b"200".as_slice()) {
            debug!(conn = %self.conn_id, stream = stream_id, "CONNECT accepted, switching to tunnel");
            ctx.upgrade = None;
            ctx.tunnel = Some(self.conn_id);
        }

        let max_frame = ctx.peer_mut(ConnId::FRONTEND)?.max_frame_size;
        let bytes = encode_block(
            &BlockKind::Headers { end_stream },
            target.stream,
            &headers,
            &mut ctx.frontend_encoder,
            max_frame,
        );
        if end_stream {
            ctx.end_stream(source);
        }
        Ok(Output::send(bytes))
    }

    fn push_promise(
        &mut self,
        ctx: &mut H2Context,
        stream_id: u32,
        promised_id: u32,
        headers: HeaderList,
    ) -> Result<Output, ProcessError> {
        if self.conn_id.is_frontend() {
            return Err(ProcessError::violation("PUSH_PROMISE from the client"));
        }
        let associated = ctx
            .route(StreamRef::new(self.conn_id, stream_id))
            .ok_or_else(|| {
                ProcessError::violation(format!("PUSH_PROMISE on unknown stream {stream_id}"))
            })?;

        let promised = StreamRef::new(self.conn_id, promised_id);
        ctx.open_remote(promised)?;
        let frontend_id = ctx.open_local(ConnId::FRONTEND)?;
        let pushed = StreamRef::new(ConnId::FRONTEND, frontend_id);
        if !ctx.sessions.bind(pushed, promised) {
            return Err(ProcessError::violation("promised stream already paired"));
        }
        // the client never sends on a pushed stream
        ctx.end_stream(pushed);
        metrics::record_h2_push_promise();
        debug!(conn = %self.conn_id, promised = promised_id, frontend = frontend_id, "Relaying PUSH_PROMISE");

        let max_frame = ctx.peer_mut(ConnId::FRONTEND)?.max_frame_size;
        Ok(Output::send(encode_block(
            &BlockKind::PushPromise {
                promised_id: frontend_id,
            },
            associated.stream,
            &headers,
            &mut ctx.frontend_encoder,
            max_frame,
        )))
    }

    fn control_frame(
        &mut self,
        ctx: &mut H2Context,
        header: &FrameHeader,
        payload: Bytes,
    ) -> Result<Output, ProcessError> {
        match Frame::decode(header, payload)? {
            Frame::Settings(settings) => {
                if !settings.ack {
                    ctx.apply_settings(self.conn_id, &settings, false)?;
                    Frame::Settings(Settings::ack()).encode(&mut self.produced);
                }
                Ok(Output::none())
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                ctx.window_update(StreamRef::new(self.conn_id, stream_id), increment)?;
                Ok(Output::none())
            }
            Frame::Ping { ack, opaque } => {
                if !ack {
                    Frame::Ping { ack: true, opaque }.encode(&mut self.produced);
                }
                Ok(Output::none())
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                let source = StreamRef::new(self.conn_id, stream_id);
                let Some(target) = ctx.route(source) else {
                    warn!(conn = %self.conn_id, stream = stream_id, "RST_STREAM without a session, dropping");
                    return Ok(Output::none());
                };
                ctx.reset_stream(source);
                if self.conn_id.is_frontend() {
                    ctx.current_target = Some(target.conn);
                }
                Ok(Output::send(
                    Frame::RstStream {
                        stream_id: target.stream,
                        error_code,
                    }
                    .to_bytes(),
                ))
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug,
            } => {
                let source = StreamRef::new(self.conn_id, last_stream_id);
                let Some(target) = ctx.route(source).filter(|_| last_stream_id != 0) else {
                    warn!(conn = %self.conn_id, last_stream = last_stream_id, "GOAWAY without a session, dropping");
                    return Ok(Output::none());
                };
                if self.conn_id.is_frontend() {
                    ctx.current_target = Some(target.conn);
                }
                Ok(Output::send(
                    Frame::GoAway {
                        last_stream_id: target.stream,
                        error_code,
                        debug,
                    }
                    .to_bytes(),
                ))
            }
            Frame::Priority { stream_id, .. } => {
                trace!(conn = %self.conn_id, stream = stream_id, "Dropping PRIORITY");
                Ok(Output::none())
            }
            other => Err(ProcessError::violation(format!(
                "unexpected {:?} frame",
                other.kind()
            ))),
        }
    }

    /// The engine chose a backend for the stream waiting in `ctx`.
    pub(crate) fn bind_pending(&mut self, ctx: &mut H2Context) -> Result<(), ProcessError> {
        let Some(stream_id) = ctx.pending_stream.take() else {
            return Ok(());
        };
        let backend_stream = ctx.open_local(self.conn_id)?;
        let front = StreamRef::new(ConnId::FRONTEND, stream_id);
        let back = StreamRef::new(self.conn_id, backend_stream);
        if !ctx.sessions.bind(front, back) {
            return Err(ProcessError::violation(format!(
                "stream {stream_id} is already bound"
            )));
        }
        ctx.current_target = Some(self.conn_id);
        debug!(
            stream = stream_id,
            conn = %self.conn_id,
            backend_stream,
            peer = %self.peer_addr,
            "Stream bound to backend"
        );
        Ok(())
    }
}
