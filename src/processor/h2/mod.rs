//! Stream-multiplexing processor.
//!
//! Terminates the client's h2 connection, assigns each request stream to a
//! backend chosen from its `:authority` and `:path`, and rewrites stream ids,
//! header blocks and flow-control credit in both directions. Streams of one
//! client may land on several backends; streams to the same backend address
//! share one backend connection.

pub mod frame;
pub mod hpack;
pub mod stream;
pub mod window;

mod context;
mod sub;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

pub use context::H2Context;
pub use sub::H2SubContext;

use self::frame::{Frame, FrameHeader, Setting, Settings, DEFAULT_MAX_FRAME_SIZE, PREFACE};
use self::hpack::DEFAULT_TABLE_SIZE;
use self::window::DEFAULT_WINDOW;
use super::{ConnId, DisconnectTodo, HandleTodo, ProcessError, Processor, ProcessorTodo, ProxyDone};
use crate::relay::PauseHandle;

/// How long ended streams keep their pairing, so late frames still route.
pub const DEFAULT_STREAM_LINGER: Duration = Duration::from_millis(2000);
pub const MAX_CONCURRENT_STREAMS: u32 = 128;

/// SETTINGS the proxy announces to the client.
pub(crate) fn server_settings() -> Bytes {
    let settings = Settings {
        ack: false,
        params: vec![
            Setting::new(Setting::HEADER_TABLE_SIZE, DEFAULT_TABLE_SIZE as u32),
            Setting::new(Setting::INITIAL_WINDOW_SIZE, DEFAULT_WINDOW as u32),
            Setting::new(Setting::MAX_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE as u32),
            Setting::new(Setting::MAX_CONCURRENT_STREAMS, MAX_CONCURRENT_STREAMS),
            Setting::new(Setting::ENABLE_CONNECT_PROTOCOL, 1),
        ],
    };
    Frame::Settings(settings).to_bytes()
}

/// Preface plus the client's first SETTINGS frame, replayed to every backend.
/// Sent verbatim unless it would let a backend use a larger header table
/// than the backend decoders accept.
pub(crate) fn backend_handshake(header: &FrameHeader, payload: &[u8], settings: &Settings) -> Bytes {
    let mut dst = BytesMut::from(&PREFACE[..]);
    let oversized = settings
        .get(Setting::HEADER_TABLE_SIZE)
        .is_some_and(|size| size as usize > DEFAULT_TABLE_SIZE);
    if oversized {
        let params = settings
            .params
            .iter()
            .map(|param| match param.id {
                Setting::HEADER_TABLE_SIZE => {
                    Setting::new(param.id, param.value.min(DEFAULT_TABLE_SIZE as u32))
                }
                _ => *param,
            })
            .collect();
        Frame::Settings(Settings { ack: false, params }).encode(&mut dst);
    } else {
        header.encode(&mut dst);
        dst.extend_from_slice(payload);
    }
    dst.freeze()
}

/// Used for backends opened before the client's handshake was seen.
fn default_client_handshake() -> Bytes {
    let mut dst = BytesMut::from(&PREFACE[..]);
    Frame::Settings(Settings::default()).encode(&mut dst);
    dst.freeze()
}

#[derive(Debug, Clone)]
pub struct H2Processor {
    linger: Duration,
}

impl H2Processor {
    pub fn new(linger: Duration) -> Self {
        Self { linger }
    }
}

impl Default for H2Processor {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_LINGER)
    }
}

impl Processor for H2Processor {
    type Context = H2Context;
    type SubContext = H2SubContext;

    fn name(&self) -> &'static str {
        "h2"
    }

    fn init(&self, client: SocketAddr) -> H2Context {
        H2Context::new(client, self.linger)
    }

    fn init_sub(
        &self,
        ctx: &mut H2Context,
        conn_id: ConnId,
        peer: SocketAddr,
        delegate: PauseHandle,
    ) -> H2SubContext {
        ctx.add_peer(conn_id, delegate);
        H2SubContext::new(conn_id, peer)
    }

    fn process(&self, ctx: &mut H2Context, sub: &mut H2SubContext) -> ProcessorTodo {
        sub.process(ctx)
    }

    fn feed(
        &self,
        ctx: &mut H2Context,
        sub: &mut H2SubContext,
        data: Bytes,
    ) -> Result<HandleTodo, ProcessError> {
        sub.feed(ctx, data)
    }

    fn proxy_done(&self, ctx: &mut H2Context, sub: &mut H2SubContext) -> Option<ProxyDone> {
        sub.proxy_done(ctx)
    }

    fn chosen(&self, ctx: &mut H2Context, backend: &mut H2SubContext) {
        if ctx.pending_stream.is_none() {
            return;
        }
        if let Err(err) = backend.bind_pending(ctx) {
            warn!(conn = %backend.conn_id(), error = %err, "Could not bind stream");
        }
    }

    fn connected(&self, ctx: &mut H2Context, _sub: &mut H2SubContext) -> Option<HandleTodo> {
        let handshake = ctx
            .client_handshake
            .clone()
            .unwrap_or_else(default_client_handshake);
        Some(HandleTodo {
            produce: Some(handshake),
            ..HandleTodo::default()
        })
    }

    fn remote_closed(&self, _ctx: &mut H2Context, _sub: &mut H2SubContext) -> Option<HandleTodo> {
        None
    }

    fn disconnected(
        &self,
        ctx: &mut H2Context,
        sub: &mut H2SubContext,
        error: bool,
    ) -> Option<DisconnectTodo> {
        let conn = sub.conn_id();
        if conn.is_frontend() || ctx.tunnel == Some(conn) {
            return None;
        }
        if !ctx.flush(conn) {
            debug!(conn = %conn, error, "Backend lost with open streams");
            return None;
        }
        ctx.remove_peer(conn);
        Some(DisconnectTodo::silent())
    }
}
