use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::ops::Bound;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::connector::{BackendTarget, Connector};
use super::error::{is_transient_io, CloseReason, RelayError};
use super::flow::{ByteFlow, Step};
use super::pause::PauseHandle;
use crate::net::OutBuffer;
use crate::observability::metrics;
use crate::processor::{ConnId, Mode, Processor, Target, Want};

/// Buffer sizing and limits for one session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub in_buffer_size: usize,
    pub out_buffer_size: usize,
    pub max_backends: u16,
    /// Relay large proxy segments by reference instead of copying.
    pub zero_copy: bool,
    /// Overrides the processor's zero-copy threshold.
    pub zero_copy_threshold: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            in_buffer_size: 16 * 1024,
            out_buffer_size: 16 * 1024,
            max_backends: ConnId::MAX_BACKEND,
            zero_copy: true,
            zero_copy_threshold: None,
        }
    }
}

/// I/O the session task must perform on behalf of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open a TCP connection for a newly created backend.
    Connect { id: ConnId, target: BackendTarget },
    /// Send FIN to a backend.
    ShutdownWrite(ConnId),
    /// Close a connection; `ConnId::FRONTEND` ends the session after its output is flushed.
    Close(ConnId),
}

struct Conn<S> {
    sub: S,
    input: BytesMut,
    output: OutBuffer,
    pause: PauseHandle,
    /// Bytes the processor is waiting for; may exceed the input buffer size.
    want: usize,
    remote_closed: bool,
}

struct Frontend<S> {
    conn: Conn<S>,
    /// Bytes the frontend's own processor produces for the client.
    own: ByteFlow,
}

struct Backend<S> {
    id: ConnId,
    target: BackendTarget,
    conn: Conn<S>,
    to_backend: ByteFlow,
    to_frontend: ByteFlow,
    connected: bool,
    shutdown_requested: bool,
    write_shutdown: bool,
}

#[derive(Debug)]
struct IdAllocator {
    next: u16,
    max: u16,
    released: BTreeSet<u16>,
}

impl IdAllocator {
    fn new(max: u16) -> Self {
        Self {
            next: 1,
            max: max.clamp(1, ConnId::MAX_BACKEND),
            released: BTreeSet::new(),
        }
    }

    fn allocate(&mut self) -> Option<ConnId> {
        if let Some(id) = self.released.pop_first() {
            return ConnId::backend(id);
        }
        if self.next > self.max {
            return None;
        }
        let id = self.next;
        self.next += 1;
        ConnId::backend(id)
    }

    fn release(&mut self, id: ConnId) {
        self.released.insert(id.as_u16());
    }
}

fn take_input<S>(conn: &mut Conn<S>, want: Want) -> Option<Bytes> {
    match want {
        Want::Nothing | Want::Exactly(0) => Some(Bytes::new()),
        Want::Exactly(n) => {
            if conn.input.len() < n {
                conn.want = n;
                return None;
            }
            conn.want = 0;
            Some(conn.input.split_to(n).freeze())
        }
        Want::Available => {
            if conn.input.is_empty() {
                return None;
            }
            conn.want = 0;
            Some(conn.input.split().freeze())
        }
    }
}

/// Sans-IO state machine for one client session.
pub struct RelayEngine<P: Processor> {
    processor: Arc<P>,
    connector: Arc<dyn Connector>,
    client: SocketAddr,
    config: EngineConfig,
    zero_copy_threshold: usize,
    waker: Arc<Notify>,
    ctx: P::Context,
    frontend: Frontend<P::SubContext>,
    backends: BTreeMap<ConnId, Backend<P::SubContext>>,
    ids: IdAllocator,
    /// Backend currently allowed to write to the frontend.
    handling: Option<ConnId>,
    last_handled: ConnId,
    actions: VecDeque<Action>,
    closed: Option<CloseReason>,
}

impl<P: Processor> RelayEngine<P> {
    pub fn new(
        processor: Arc<P>,
        connector: Arc<dyn Connector>,
        client: SocketAddr,
        config: EngineConfig,
        waker: Arc<Notify>,
    ) -> Self {
        let mut ctx = processor.init(client);
        let pause = PauseHandle::new(waker.clone());
        let sub = processor.init_sub(&mut ctx, ConnId::FRONTEND, client, pause.clone());
        let zero_copy_threshold = config
            .zero_copy_threshold
            .unwrap_or_else(|| processor.zero_copy_threshold());

        let frontend = Frontend {
            conn: Conn {
                sub,
                input: BytesMut::with_capacity(config.in_buffer_size),
                output: OutBuffer::new(config.out_buffer_size, config.zero_copy),
                pause,
                want: 0,
                remote_closed: false,
            },
            own: ByteFlow::new(),
        };

        Self {
            processor,
            connector,
            client,
            ids: IdAllocator::new(config.max_backends),
            config,
            zero_copy_threshold,
            waker,
            ctx,
            frontend,
            backends: BTreeMap::new(),
            handling: None,
            last_handled: ConnId::FRONTEND,
            actions: VecDeque::new(),
            closed: None,
        }
    }

    /// Give the processor a first chance to act before any byte arrives.
    pub fn start(&mut self) {
        self.drive();
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed
    }

    pub fn take_actions(&mut self) -> Vec<Action> {
        self.actions.drain(..).collect()
    }

    /// Session-wide processor state.
    pub fn context(&self) -> &P::Context {
        &self.ctx
    }

    pub fn backend_ids(&self) -> Vec<ConnId> {
        self.backends.keys().copied().collect()
    }

    pub fn backend_target(&self, id: ConnId) -> Option<&BackendTarget> {
        self.backends.get(&id).map(|b| &b.target)
    }

    /// The frontend's pause handle, for callers outside the processor.
    pub fn frontend_pause(&self) -> PauseHandle {
        self.frontend.conn.pause.clone()
    }

    pub fn input_mut(&mut self, conn: ConnId) -> Option<&mut BytesMut> {
        if conn.is_frontend() {
            Some(&mut self.frontend.conn.input)
        } else {
            self.backends.get_mut(&conn).map(|b| &mut b.conn.input)
        }
    }

    pub fn output_mut(&mut self, conn: ConnId) -> Option<&mut OutBuffer> {
        if conn.is_frontend() {
            Some(&mut self.frontend.conn.output)
        } else {
            self.backends.get_mut(&conn).map(|b| &mut b.conn.output)
        }
    }

    /// How many more bytes may be read from `conn` right now.
    pub fn read_budget(&self, conn: ConnId) -> usize {
        let c = if conn.is_frontend() {
            &self.frontend.conn
        } else {
            match self.backends.get(&conn) {
                Some(b) => &b.conn,
                None => return 0,
            }
        };
        self.config
            .in_buffer_size
            .max(c.want)
            .saturating_sub(c.input.len())
    }

    pub fn wants_read(&self, conn: ConnId) -> bool {
        if self.closed.is_some() {
            return false;
        }
        let c = if conn.is_frontend() {
            &self.frontend.conn
        } else {
            match self.backends.get(&conn) {
                Some(b) if b.connected => &b.conn,
                _ => return false,
            }
        };
        !c.remote_closed && !c.pause.is_held() && self.read_budget(conn) > 0
    }

    pub fn wants_write(&self, conn: ConnId) -> bool {
        if conn.is_frontend() {
            !self.frontend.conn.output.is_empty()
        } else {
            self.backends
                .get(&conn)
                .is_some_and(|b| b.connected && !b.conn.output.is_empty())
        }
    }

    pub fn on_readable(&mut self, _conn: ConnId) {
        self.drive();
    }

    pub fn on_written(&mut self, _conn: ConnId) {
        self.drive();
    }

    /// A pause handle was resumed; re-evaluate every connection.
    pub fn on_tick(&mut self) {
        self.frontend.conn.pause.take_resume();
        for backend in self.backends.values() {
            backend.conn.pause.take_resume();
        }
        self.drive();
    }

    pub fn on_connected(&mut self, id: ConnId) {
        let Some(backend) = self.backends.get_mut(&id) else {
            return;
        };
        backend.connected = true;
        debug!(conn = %id, backend = %backend.target, "Backend connected");
        self.drive();
    }

    pub fn on_connect_failed(&mut self, id: ConnId, err: io::Error) {
        if let Some(backend) = self.backends.get(&id) {
            warn!(conn = %id, backend = %backend.target, error = %err, "Backend connect failed");
        }
        self.backend_gone(id, Some(err));
        self.drive();
    }

    /// FIN received from `conn`.
    pub fn on_remote_closed(&mut self, conn: ConnId) {
        if self.closed.is_some() {
            return;
        }
        if conn.is_frontend() {
            if self.frontend.conn.remote_closed {
                return;
            }
            debug!("Client half-closed");
            self.frontend.conn.remote_closed = true;
            for backend in self.backends.values_mut() {
                backend.shutdown_requested = true;
            }
        } else {
            let Some(backend) = self.backends.get_mut(&conn) else {
                return;
            };
            if backend.conn.remote_closed {
                return;
            }
            debug!(conn = %conn, backend = %backend.target, "Backend half-closed");
            backend.conn.remote_closed = true;
            if let Some(todo) = self
                .processor
                .remote_closed(&mut self.ctx, &mut backend.conn.sub)
            {
                if let Some(send) = todo.send.filter(|b| !b.is_empty()) {
                    backend.to_frontend.write(send, true);
                }
                if let Some(produce) = todo.produce.filter(|b| !b.is_empty()) {
                    if !backend.write_shutdown {
                        backend.to_backend.write(produce, false);
                    }
                }
            }
            if !self.frontend.conn.remote_closed {
                backend.to_backend.mark_closing();
            }
        }
        self.drive();
    }

    pub fn on_error(&mut self, conn: ConnId, err: io::Error) {
        if self.closed.is_some() {
            return;
        }
        if conn.is_frontend() {
            let err = RelayError::Io { conn, source: err };
            if err.is_transient() {
                debug!(error = %err, "Client connection dropped");
                self.close_all(CloseReason::FrontendClosed);
            } else {
                warn!(error = %err, "Client connection failed");
                self.close_all(CloseReason::IoError);
            }
        } else {
            self.backend_gone(conn, Some(err));
            self.drive();
        }
    }

    /// Tear down the session (graceful shutdown).
    pub fn shutdown(&mut self) {
        self.close_all(CloseReason::Shutdown);
    }

    fn drive(&mut self) {
        while self.closed.is_none() {
            match self.pump() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(err) => {
                    self.fail(err);
                    break;
                }
            }
        }
        self.check_half_close();
    }

    fn pump(&mut self) -> Result<bool, RelayError> {
        let mut progress = self.read_frontend()?;
        let ids: Vec<ConnId> = self.backends.keys().copied().collect();
        for id in ids {
            if self.closed.is_some() {
                return Ok(false);
            }
            progress |= self.write_backend(id);
            progress |= self.read_backend(id)?;
            progress |= self.settle_backend(id);
        }
        progress |= self.write_frontend();
        Ok(progress)
    }

    fn read_frontend(&mut self) -> Result<bool, RelayError> {
        let mut progress = false;
        loop {
            if self.closed.is_some() || self.frontend.conn.pause.is_held() {
                return Ok(progress);
            }
            let todo = self
                .processor
                .process(&mut self.ctx, &mut self.frontend.conn.sub);
            if self.frontend.conn.input.is_empty() && !todo.want.is_nothing() {
                self.frontend.conn.want = todo.want.len();
                return Ok(progress);
            }

            match todo.mode {
                Mode::Proxy => {
                    let target = todo.target.ok_or_else(|| {
                        RelayError::violation(ConnId::FRONTEND, "proxy request without a target")
                    })?;
                    let id = self.select_backend(target)?;
                    if todo.want.is_nothing() {
                        self.processor
                            .proxy_done(&mut self.ctx, &mut self.frontend.conn.sub);
                        progress = true;
                        continue;
                    }
                    let backend = self
                        .backends
                        .get_mut(&id)
                        .ok_or(RelayError::UnknownBackend(id))?;
                    if !backend.to_backend.proxy(todo.want.len()) {
                        return Ok(progress);
                    }
                    progress = true;
                }
                Mode::Handle => {
                    let Some(data) = take_input(&mut self.frontend.conn, todo.want) else {
                        return Ok(progress);
                    };
                    let handled = self
                        .processor
                        .feed(&mut self.ctx, &mut self.frontend.conn.sub, data)
                        .map_err(|e| RelayError::violation(ConnId::FRONTEND, e.to_string()))?;
                    progress = true;

                    if let Some(produce) = handled.produce.filter(|b| !b.is_empty()) {
                        self.frontend.own.write(produce, true);
                    }
                    let send = handled.send.filter(|b| !b.is_empty());
                    if send.is_none() && !handled.require_connection {
                        continue;
                    }
                    let target = handled.target.ok_or_else(|| {
                        RelayError::violation(ConnId::FRONTEND, "output without a target")
                    })?;
                    let id = self.select_backend(target)?;
                    if let Some(send) = send {
                        let backend = self
                            .backends
                            .get_mut(&id)
                            .ok_or(RelayError::UnknownBackend(id))?;
                        backend.to_backend.write(send, false);
                    }
                }
            }
        }
    }

    fn read_backend(&mut self, id: ConnId) -> Result<bool, RelayError> {
        let mut progress = false;
        loop {
            if self.closed.is_some() {
                return Ok(progress);
            }
            let Some(backend) = self.backends.get_mut(&id) else {
                return Ok(progress);
            };
            if backend.conn.pause.is_held() {
                return Ok(progress);
            }
            let todo = self.processor.process(&mut self.ctx, &mut backend.conn.sub);
            if backend.conn.input.is_empty() && !todo.want.is_nothing() {
                backend.conn.want = todo.want.len();
                return Ok(progress);
            }

            match todo.mode {
                Mode::Proxy => {
                    if todo.want.is_nothing() {
                        let done = self.processor.proxy_done(&mut self.ctx, &mut backend.conn.sub);
                        if done.is_some_and(|d| d.frame_ends) {
                            backend.to_frontend.inform_frame_ends();
                        }
                        progress = true;
                        continue;
                    }
                    if !backend.to_frontend.proxy(todo.want.len()) {
                        return Ok(progress);
                    }
                    progress = true;
                }
                Mode::Handle => {
                    let Some(data) = take_input(&mut backend.conn, todo.want) else {
                        return Ok(progress);
                    };
                    let handled = self
                        .processor
                        .feed(&mut self.ctx, &mut backend.conn.sub, data)
                        .map_err(|e| RelayError::violation(id, e.to_string()))?;
                    progress = true;

                    // replies after our FIN have nowhere to go
                    if let Some(produce) = handled.produce.filter(|b| !b.is_empty()) {
                        if !backend.write_shutdown {
                            backend.to_backend.write(produce, false);
                        }
                    }
                    match handled.send.filter(|b| !b.is_empty()) {
                        Some(send) => backend.to_frontend.write(send, handled.frame_ends),
                        None if handled.frame_ends => backend.to_frontend.inform_frame_ends(),
                        None => {}
                    }
                }
            }
        }
    }

    fn write_backend(&mut self, id: ConnId) -> bool {
        let Some(backend) = self.backends.get_mut(&id) else {
            return false;
        };
        if !backend.connected {
            return false;
        }
        let mut progress = false;
        loop {
            match backend.to_backend.transfer(
                &mut self.frontend.conn.input,
                &mut backend.conn.output,
                self.zero_copy_threshold,
            ) {
                Step::Idle | Step::Blocked => return progress,
                Step::Progress => progress = true,
                Step::ProxyComplete => {
                    let done = self
                        .processor
                        .proxy_done(&mut self.ctx, &mut self.frontend.conn.sub);
                    backend.to_backend.finish_proxy(done);
                    progress = true;
                }
            }
        }
    }

    /// Copy backend flows and the frontend's own bytes into the frontend
    /// output, one backend at a time and only at frame boundaries.
    fn write_frontend(&mut self) -> bool {
        let mut progress = false;
        loop {
            if let Some(id) = self.handling {
                let Some(backend) = self.backends.get_mut(&id) else {
                    self.handling = None;
                    continue;
                };
                loop {
                    match backend.to_frontend.transfer(
                        &mut backend.conn.input,
                        &mut self.frontend.conn.output,
                        self.zero_copy_threshold,
                    ) {
                        Step::Idle | Step::Blocked => break,
                        Step::Progress => progress = true,
                        Step::ProxyComplete => {
                            let done = self.processor.proxy_done(&mut self.ctx, &mut backend.conn.sub);
                            backend.to_frontend.finish_proxy(done);
                            progress = true;
                        }
                    }
                }
                if backend.to_frontend.is_idle() && backend.to_frontend.frame_ends() {
                    self.last_handled = id;
                    self.handling = None;
                } else {
                    return progress;
                }
            }

            let mut none = BytesMut::new();
            while self.frontend.own.transfer(
                &mut none,
                &mut self.frontend.conn.output,
                self.zero_copy_threshold,
            ) == Step::Progress
            {
                progress = true;
            }
            if self.frontend.own.has_pending() {
                return progress;
            }

            let after = (Bound::Excluded(self.last_handled), Bound::Unbounded);
            let next = self
                .backends
                .range(after)
                .chain(self.backends.range(..=self.last_handled))
                .find(|(_, b)| b.to_frontend.has_pending())
                .map(|(id, _)| *id);
            match next {
                Some(id) => self.handling = Some(id),
                None => return progress,
            }
        }
    }

    fn settle_backend(&mut self, id: ConnId) -> bool {
        let frontend_empty = self.frontend.conn.input.is_empty();
        let Some(backend) = self.backends.get_mut(&id) else {
            return false;
        };
        let drained = backend.to_backend.is_drained(frontend_empty) && backend.conn.output.is_empty();
        if backend.shutdown_requested && !backend.write_shutdown && backend.connected && drained {
            backend.write_shutdown = true;
            self.actions.push_back(Action::ShutdownWrite(id));
        }
        if backend.to_backend.is_closing()
            && drained
            && backend.to_frontend.is_drained(backend.conn.input.is_empty())
        {
            self.backend_gone(id, None);
            return true;
        }
        false
    }

    fn check_half_close(&mut self) {
        if self.closed.is_some() || !self.frontend.conn.remote_closed {
            return;
        }
        let frontend_empty = self.frontend.conn.input.is_empty();
        let settled = self.backends.values().all(|b| {
            b.conn.remote_closed
                && b.conn.output.is_empty()
                && b.to_backend.is_drained(frontend_empty)
                && b.to_frontend.is_drained(b.conn.input.is_empty())
        });
        if settled {
            debug!("All backends drained after client half-close");
            self.close_all(CloseReason::HalfClosed);
        }
    }

    fn select_backend(&mut self, target: Target) -> Result<ConnId, RelayError> {
        let hint = match target {
            Target::Conn(id) if id.is_backend() => {
                return if self.backends.contains_key(&id) {
                    Ok(id)
                } else {
                    Err(RelayError::UnknownBackend(id))
                };
            }
            Target::Conn(id) => {
                return Err(RelayError::violation(id, "the frontend cannot be a target"));
            }
            Target::Select(hint) => hint,
        };

        let target = self
            .connector
            .resolve(self.client, &hint)
            .ok_or_else(|| RelayError::BackendUnavailable { hint: hint.clone() })?;

        if let Some(backend) = self.backends.values_mut().find(|b| {
            b.target.addr == target.addr && !b.conn.remote_closed && !b.to_backend.is_closing()
        }) {
            debug!(conn = %backend.id, backend = %backend.target, hint = %hint, "Reusing backend");
            self.processor.chosen(&mut self.ctx, &mut backend.conn.sub);
            return Ok(backend.id);
        }

        let id = self.ids.allocate().ok_or(RelayError::ResourceExhaustion {
            max: self.ids.max,
        })?;
        let pause = PauseHandle::new(self.waker.clone());
        let sub = self
            .processor
            .init_sub(&mut self.ctx, id, target.addr, pause.clone());
        let mut backend = Backend {
            id,
            target: target.clone(),
            conn: Conn {
                sub,
                input: BytesMut::with_capacity(self.config.in_buffer_size),
                output: OutBuffer::new(self.config.out_buffer_size, self.config.zero_copy),
                pause,
                want: 0,
                remote_closed: false,
            },
            to_backend: ByteFlow::new(),
            to_frontend: ByteFlow::new(),
            connected: false,
            shutdown_requested: self.frontend.conn.remote_closed,
            write_shutdown: false,
        };

        if let Some(todo) = self.processor.connected(&mut self.ctx, &mut backend.conn.sub) {
            if let Some(produce) = todo.produce.filter(|b| !b.is_empty()) {
                backend.to_backend.write(produce, false);
            }
        }
        self.processor.chosen(&mut self.ctx, &mut backend.conn.sub);

        info!(conn = %id, backend = %target, hint = %hint, "Opening backend");
        self.actions.push_back(Action::Connect { id, target });
        self.backends.insert(id, backend);
        Ok(id)
    }

    fn backend_gone(&mut self, id: ConnId, error: Option<io::Error>) {
        let Some(mut backend) = self.backends.remove(&id) else {
            return;
        };
        let todo = self
            .processor
            .disconnected(&mut self.ctx, &mut backend.conn.sub, error.is_some());
        self.actions.push_back(Action::Close(id));
        self.ids.release(id);
        if self.handling == Some(id) {
            self.handling = None;
        }

        if todo.is_some_and(|t| t.silent) {
            debug!(conn = %id, backend = %backend.target, "Backend released");
            return;
        }

        let reason = match &error {
            Some(err) if is_transient_io(err) => {
                debug!(conn = %id, backend = %backend.target, error = %err, "Backend dropped");
                CloseReason::BackendClosed
            }
            Some(err) => {
                warn!(conn = %id, backend = %backend.target, error = %err, "Backend failed");
                CloseReason::IoError
            }
            None => {
                debug!(conn = %id, backend = %backend.target, "Backend closed");
                CloseReason::BackendClosed
            }
        };
        self.close_all(reason);
    }

    fn fail(&mut self, err: RelayError) {
        match &err {
            RelayError::ProtocolViolation { .. } | RelayError::UnknownBackend(_) => {
                warn!(error = %err, "Closing session");
                metrics::record_protocol_violation();
            }
            RelayError::BackendUnavailable { .. } | RelayError::ResourceExhaustion { .. } => {
                error!(error = %err, "Closing session");
            }
            RelayError::Io { .. } if err.is_transient() => {
                debug!(error = %err, "Closing session");
            }
            RelayError::Io { .. } => {
                warn!(error = %err, "Closing session");
            }
        }
        self.close_all(err.close_reason());
    }

    fn close_all(&mut self, reason: CloseReason) {
        if self.closed.is_some() {
            return;
        }
        self.closed = Some(reason);
        for id in self.backends.keys() {
            self.actions.push_back(Action::Close(*id));
        }
        self.backends.clear();
        self.handling = None;
        self.actions.push_back(Action::Close(ConnId::FRONTEND));
        metrics::record_session_closed(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::passthrough::PassThrough;
    use crate::processor::Hint;

    struct FixedConnector(SocketAddr);

    impl Connector for FixedConnector {
        fn resolve(&self, _client: SocketAddr, _hint: &Hint) -> Option<BackendTarget> {
            Some(BackendTarget::new("fixed", self.0))
        }
    }

    struct Refuse;

    impl Connector for Refuse {
        fn resolve(&self, _client: SocketAddr, _hint: &Hint) -> Option<BackendTarget> {
            None
        }
    }

    fn engine(connector: Arc<dyn Connector>, config: EngineConfig) -> RelayEngine<PassThrough> {
        let client: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        RelayEngine::new(
            Arc::new(PassThrough),
            connector,
            client,
            config,
            Arc::new(Notify::new()),
        )
    }

    fn drain(out: &mut OutBuffer) -> Vec<u8> {
        let mut data = Vec::new();
        while let Some(chunk) = out.front() {
            let chunk = chunk.to_vec();
            out.advance(chunk.len());
            data.extend_from_slice(&chunk);
        }
        data
    }

    fn backend_addr() -> SocketAddr {
        "10.0.0.2:8080".parse().unwrap()
    }

    #[test]
    fn passthrough_connects_eagerly_and_relays_both_ways() {
        let mut engine = engine(
            Arc::new(FixedConnector(backend_addr())),
            EngineConfig::default(),
        );
        engine.start();

        let actions = engine.take_actions();
        let id = ConnId::backend(1).unwrap();
        assert_eq!(
            actions,
            vec![Action::Connect {
                id,
                target: BackendTarget::new("fixed", backend_addr())
            }]
        );

        engine.input_mut(ConnId::FRONTEND).unwrap().extend_from_slice(b"ping");
        engine.on_readable(ConnId::FRONTEND);
        assert!(!engine.wants_write(id));

        engine.on_connected(id);
        assert_eq!(drain(engine.output_mut(id).unwrap()), b"ping");

        engine.input_mut(id).unwrap().extend_from_slice(b"pong");
        engine.on_readable(id);
        assert_eq!(drain(engine.output_mut(ConnId::FRONTEND).unwrap()), b"pong");
    }

    #[test]
    fn large_payload_is_adopted_without_copy() {
        let mut engine = engine(
            Arc::new(FixedConnector(backend_addr())),
            EngineConfig {
                out_buffer_size: 64,
                ..EngineConfig::default()
            },
        );
        engine.start();
        let id = ConnId::backend(1).unwrap();
        engine.on_connected(id);

        let payload = vec![42u8; 8192];
        engine
            .input_mut(ConnId::FRONTEND)
            .unwrap()
            .extend_from_slice(&payload);
        engine.on_readable(ConnId::FRONTEND);

        let out = engine.output_mut(id).unwrap();
        assert_eq!(out.adopted_in_flight(), 8192);
        assert_eq!(drain(out), payload);
    }

    #[test]
    fn copy_path_respects_output_capacity() {
        let mut engine = engine(
            Arc::new(FixedConnector(backend_addr())),
            EngineConfig {
                out_buffer_size: 4,
                zero_copy: false,
                ..EngineConfig::default()
            },
        );
        engine.start();
        let id = ConnId::backend(1).unwrap();
        engine.on_connected(id);

        engine
            .input_mut(ConnId::FRONTEND)
            .unwrap()
            .extend_from_slice(b"abcdefgh");
        engine.on_readable(ConnId::FRONTEND);
        assert_eq!(drain(engine.output_mut(id).unwrap()), b"abcd");
        engine.on_written(id);
        assert_eq!(drain(engine.output_mut(id).unwrap()), b"efgh");
    }

    #[test]
    fn refused_hint_closes_session() {
        let mut engine = engine(Arc::new(Refuse), EngineConfig::default());
        engine.start();
        assert!(engine.is_closed());
        assert_eq!(engine.close_reason(), Some(CloseReason::BackendUnavailable));
        assert_eq!(engine.take_actions(), vec![Action::Close(ConnId::FRONTEND)]);
    }

    #[test]
    fn client_half_close_waits_for_backend_then_closes_once() {
        let mut engine = engine(
            Arc::new(FixedConnector(backend_addr())),
            EngineConfig::default(),
        );
        engine.start();
        let id = ConnId::backend(1).unwrap();
        engine.on_connected(id);
        engine.take_actions();

        engine
            .input_mut(ConnId::FRONTEND)
            .unwrap()
            .extend_from_slice(b"req");
        engine.on_readable(ConnId::FRONTEND);
        engine.on_remote_closed(ConnId::FRONTEND);
        assert!(engine.take_actions().is_empty());

        drain(engine.output_mut(id).unwrap());
        engine.on_written(id);
        assert_eq!(engine.take_actions(), vec![Action::ShutdownWrite(id)]);

        engine.input_mut(id).unwrap().extend_from_slice(b"resp");
        engine.on_readable(id);
        engine.on_remote_closed(id);
        assert!(engine.is_closed());
        assert_eq!(engine.close_reason(), Some(CloseReason::HalfClosed));

        let closes: Vec<_> = engine
            .take_actions()
            .into_iter()
            .filter(|a| *a == Action::Close(ConnId::FRONTEND))
            .collect();
        assert_eq!(closes.len(), 1);
        assert_eq!(drain(engine.output_mut(ConnId::FRONTEND).unwrap()), b"resp");
    }

    #[test]
    fn paused_frontend_is_not_read() {
        let mut engine = engine(
            Arc::new(FixedConnector(backend_addr())),
            EngineConfig::default(),
        );
        engine.start();
        let id = ConnId::backend(1).unwrap();
        engine.on_connected(id);

        let pause = engine.frontend_pause();
        pause.pause();
        assert!(!engine.wants_read(ConnId::FRONTEND));
        engine
            .input_mut(ConnId::FRONTEND)
            .unwrap()
            .extend_from_slice(b"held");
        engine.on_readable(ConnId::FRONTEND);
        assert!(engine.output_mut(id).unwrap().is_empty());

        pause.resume();
        engine.on_readable(ConnId::FRONTEND);
        assert!(engine.output_mut(id).unwrap().is_empty());
        assert!(!engine.wants_read(ConnId::FRONTEND));

        engine.on_tick();
        assert_eq!(drain(engine.output_mut(id).unwrap()), b"held");
    }

    #[test]
    fn id_allocator_reuses_released_ids() {
        let mut ids = IdAllocator::new(2);
        let a = ids.allocate().unwrap();
        let b = ids.allocate().unwrap();
        assert!(ids.allocate().is_none());
        ids.release(a);
        assert_eq!(ids.allocate(), Some(a));
        assert_ne!(a, b);
    }
}
