//! Raw TCP relaying: one backend per session, bytes proxied untouched.

use std::net::SocketAddr;

use bytes::Bytes;

use super::{
    ConnId, DisconnectTodo, HandleTodo, Hint, ProcessError, Processor, ProcessorTodo, ProxyDone,
    Target, Want,
};
use crate::relay::PauseHandle;

/// Proxy segments never end; the relay runs until one side closes.
const OPEN_ENDED: usize = usize::MAX;

#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[derive(Debug)]
pub struct PassContext {
    backend: Option<ConnId>,
}

#[derive(Debug)]
pub struct PassSub {
    conn_id: ConnId,
}

impl Processor for PassThrough {
    type Context = PassContext;
    type SubContext = PassSub;

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn init(&self, _client: SocketAddr) -> PassContext {
        PassContext { backend: None }
    }

    fn init_sub(
        &self,
        _ctx: &mut PassContext,
        conn_id: ConnId,
        _peer: SocketAddr,
        _delegate: PauseHandle,
    ) -> PassSub {
        PassSub { conn_id }
    }

    fn process(&self, ctx: &mut PassContext, sub: &mut PassSub) -> ProcessorTodo {
        if sub.conn_id.is_backend() {
            return ProcessorTodo::proxy(OPEN_ENDED, None);
        }
        match ctx.backend {
            Some(id) => ProcessorTodo::proxy(OPEN_ENDED, Some(Target::Conn(id))),
            // connect before the client speaks; some protocols start server-side
            None => ProcessorTodo::handle(Want::Nothing),
        }
    }

    fn feed(
        &self,
        _ctx: &mut PassContext,
        _sub: &mut PassSub,
        _data: Bytes,
    ) -> Result<HandleTodo, ProcessError> {
        Ok(HandleTodo {
            require_connection: true,
            target: Some(Target::Select(Hint::none())),
            ..HandleTodo::default()
        })
    }

    fn proxy_done(&self, _ctx: &mut PassContext, _sub: &mut PassSub) -> Option<ProxyDone> {
        None
    }

    fn chosen(&self, ctx: &mut PassContext, backend: &mut PassSub) {
        ctx.backend = Some(backend.conn_id);
    }

    fn connected(&self, _ctx: &mut PassContext, _sub: &mut PassSub) -> Option<HandleTodo> {
        None
    }

    fn remote_closed(&self, _ctx: &mut PassContext, _sub: &mut PassSub) -> Option<HandleTodo> {
        None
    }

    fn disconnected(
        &self,
        _ctx: &mut PassContext,
        _sub: &mut PassSub,
        _error: bool,
    ) -> Option<DisconnectTodo> {
        None
    }
}
