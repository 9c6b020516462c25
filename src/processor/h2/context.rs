//! Session-wide state shared by every connection of one h2 session.
//!
//! Registries and windows of all connections live here, keyed by `ConnId`,
//! so operations that touch two connections at once (routing a frame,
//! charging a send window, waking a blocked source) need a single borrow.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::frame::{Frame, Setting, Settings, DEFAULT_MAX_FRAME_SIZE, MAX_WINDOW};
use super::hpack::{HeaderEncoder, DEFAULT_TABLE_SIZE};
use super::stream::{Role, SessionTable, StreamRef, StreamRegistry};
use super::window::{RecvWindow, SendWindow, DEFAULT_WINDOW};
use crate::processor::{ConnId, Hint, ProcessError, Target};
use crate::relay::PauseHandle;

/// Per-connection protocol state.
#[derive(Debug)]
pub(crate) struct Peer {
    pub streams: StreamRegistry,
    pub send: SendWindow,
    pub recv: RecvWindow,
    /// SETTINGS_INITIAL_WINDOW_SIZE announced by this peer.
    pub initial_send: i64,
    pub max_frame_size: usize,
    pub delegate: PauseHandle,
    /// Connections paused until this peer grants more credit.
    pub blocked: Vec<ConnId>,
}

impl Peer {
    fn new(role: Role, delegate: PauseHandle) -> Self {
        Self {
            streams: StreamRegistry::new(role),
            send: SendWindow::new(DEFAULT_WINDOW),
            recv: RecvWindow::new(DEFAULT_WINDOW),
            initial_send: DEFAULT_WINDOW,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            delegate,
            blocked: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct H2Context {
    pub(crate) client: SocketAddr,
    /// Client preface and first SETTINGS frame, replayed to each new backend.
    pub(crate) client_handshake: Option<Bytes>,
    pub(crate) peers: HashMap<ConnId, Peer>,
    pub(crate) sessions: SessionTable,
    pub(crate) frontend_encoder: HeaderEncoder,
    pub(crate) backend_encoder: HeaderEncoder,
    /// Backend the frontend frame being handled is routed to.
    pub(crate) current_target: Option<ConnId>,
    pub(crate) current_hint: Hint,
    /// Frontend stream waiting for `chosen` to pick its backend.
    pub(crate) pending_stream: Option<u32>,
    /// Frontend stream that issued a CONNECT request.
    pub(crate) upgrade: Option<u32>,
    /// Backend carrying the raw tunnel once CONNECT succeeded.
    pub(crate) tunnel: Option<ConnId>,
    pub(crate) linger: Duration,
}

impl H2Context {
    pub fn new(client: SocketAddr, linger: Duration) -> Self {
        Self {
            client,
            client_handshake: None,
            peers: HashMap::new(),
            sessions: SessionTable::new(),
            frontend_encoder: HeaderEncoder::new(DEFAULT_TABLE_SIZE),
            backend_encoder: HeaderEncoder::literal_only(),
            current_target: None,
            current_hint: Hint::none(),
            pending_stream: None,
            upgrade: None,
            tunnel: None,
            linger,
        }
    }

    pub fn frontend_encoder(&self) -> &HeaderEncoder {
        &self.frontend_encoder
    }

    pub fn backend_encoder(&self) -> &HeaderEncoder {
        &self.backend_encoder
    }

    pub fn is_tunnel(&self) -> bool {
        self.tunnel.is_some()
    }

    pub(crate) fn add_peer(&mut self, conn: ConnId, delegate: PauseHandle) {
        let role = if conn.is_frontend() {
            Role::Server
        } else {
            Role::Client
        };
        self.peers.insert(conn, Peer::new(role, delegate));
    }

    pub(crate) fn peer_mut(&mut self, conn: ConnId) -> Result<&mut Peer, ProcessError> {
        self.peers
            .get_mut(&conn)
            .ok_or_else(|| ProcessError::violation(format!("{conn} has no protocol state")))
    }

    /// Where frontend output goes: the routed backend, or a fresh selection.
    pub(crate) fn connection(&self) -> Target {
        match self.current_target {
            Some(id) => Target::Conn(id),
            None => Target::Select(self.current_hint.clone()),
        }
    }

    pub(crate) fn route(&self, from: StreamRef) -> Option<StreamRef> {
        self.sessions.peer(from)
    }

    pub(crate) fn apply_settings(
        &mut self,
        conn: ConnId,
        settings: &Settings,
        first: bool,
    ) -> Result<(), ProcessError> {
        for param in &settings.params {
            match param.id {
                Setting::HEADER_TABLE_SIZE if conn.is_frontend() => {
                    self.frontend_encoder.set_max_table_size(param.value as usize);
                }
                Setting::INITIAL_WINDOW_SIZE if first => {
                    let value = i64::from(param.value);
                    if value > MAX_WINDOW {
                        return Err(ProcessError::violation("initial window size too large"));
                    }
                    let peer = self.peer_mut(conn)?;
                    let delta = value - peer.initial_send;
                    peer.initial_send = value;
                    for stream in peer.streams.iter_mut() {
                        stream.send.adjust(delta)?;
                    }
                }
                Setting::MAX_FRAME_SIZE if first => {
                    if !(16_384..=16_777_215).contains(&param.value) {
                        return Err(ProcessError::violation("max frame size out of range"));
                    }
                    self.peer_mut(conn)?.max_frame_size = param.value as usize;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Register a stream opened by `conn`'s peer.
    pub(crate) fn open_remote(&mut self, at: StreamRef) -> Result<(), ProcessError> {
        let peer = self.peer_mut(at.conn)?;
        let send = peer.initial_send;
        peer.streams.open_remote(at.stream, send, DEFAULT_WINDOW)?;
        Ok(())
    }

    /// Open a stream on `conn` on behalf of the proxy.
    pub(crate) fn open_local(&mut self, conn: ConnId) -> Result<u32, ProcessError> {
        let peer = self.peer_mut(conn)?;
        let send = peer.initial_send;
        Ok(peer.streams.open_local(send, DEFAULT_WINDOW))
    }

    /// Charge a received DATA payload; returns WINDOW_UPDATE frames to send back.
    pub(crate) fn receive_data(&mut self, at: StreamRef, len: usize) -> Result<Vec<Frame>, ProcessError> {
        let peer = self.peer_mut(at.conn)?;
        let mut updates = Vec::new();
        if let Some(increment) = peer.recv.consume(len)? {
            updates.push(Frame::WindowUpdate {
                stream_id: 0,
                increment,
            });
        }
        if let Some(stream) = peer.streams.get_mut(at.stream) {
            if let Some(increment) = stream.recv.consume(len)? {
                updates.push(Frame::WindowUpdate {
                    stream_id: at.stream,
                    increment,
                });
            }
        }
        Ok(updates)
    }

    /// Bytes that may be relayed to `to` right now.
    pub(crate) fn send_capacity(&self, to: StreamRef) -> usize {
        let Some(peer) = self.peers.get(&to.conn) else {
            return 0;
        };
        let stream = peer
            .streams
            .get(to.stream)
            .map_or(usize::MAX, |s| s.send.capacity());
        peer.send.capacity().min(stream)
    }

    pub(crate) fn consume_send(&mut self, to: StreamRef, len: usize) {
        if let Some(peer) = self.peers.get_mut(&to.conn) {
            peer.send.consume(len);
            if let Some(stream) = peer.streams.get_mut(to.stream) {
                stream.send.consume(len);
            }
        }
    }

    /// Pause `source` until `target` grants more credit.
    pub(crate) fn block(&mut self, target: ConnId, source: ConnId) {
        if let Some(peer) = self.peers.get_mut(&target) {
            if !peer.blocked.contains(&source) {
                peer.blocked.push(source);
            }
        }
        if let Some(peer) = self.peers.get(&source) {
            peer.delegate.pause();
        }
    }

    pub(crate) fn window_update(&mut self, at: StreamRef, increment: u32) -> Result<(), ProcessError> {
        let peer = self.peer_mut(at.conn)?;
        if at.stream == 0 {
            peer.send.grant(increment)?;
        } else if let Some(stream) = peer.streams.get_mut(at.stream) {
            stream.send.grant(increment)?;
        }
        let blocked = std::mem::take(&mut peer.blocked);
        for source in blocked {
            if let Some(source) = self.peers.get(&source) {
                source.delegate.resume();
            }
        }
        Ok(())
    }

    /// `from` sent END_STREAM; mark both ends of its session.
    pub(crate) fn end_stream(&mut self, from: StreamRef) {
        let now = Instant::now();
        if let Some(stream) = self.stream_mut(from) {
            stream.inbound_ended = true;
        }
        self.retire_if_done(from, now);
        if let Some(to) = self.sessions.peer(from) {
            if let Some(stream) = self.stream_mut(to) {
                stream.outbound_ended = true;
            }
            self.retire_if_done(to, now);
        }
    }

    /// Schedule both ends of `from`'s session for removal.
    pub(crate) fn reset_stream(&mut self, from: StreamRef) {
        let at = Instant::now() + self.linger;
        let to = self.sessions.peer(from);
        for r in std::iter::once(from).chain(to) {
            if let Some(peer) = self.peers.get_mut(&r.conn) {
                peer.streams.schedule_removal(r.stream, at);
            }
        }
    }

    /// Drop lingering streams of `conn` and their pairings.
    pub(crate) fn sweep(&mut self, conn: ConnId) {
        let now = Instant::now();
        let removed = match self.peers.get_mut(&conn) {
            Some(peer) => peer.streams.sweep(now),
            None => return,
        };
        for id in removed {
            self.sessions.unbind(StreamRef::new(conn, id));
        }
    }

    /// Drop every ended stream of `conn` now. Returns whether none remain.
    pub(crate) fn flush(&mut self, conn: ConnId) -> bool {
        let Some(peer) = self.peers.get_mut(&conn) else {
            return true;
        };
        let removed = peer.streams.flush();
        let empty = peer.streams.is_empty();
        for id in removed {
            self.sessions.unbind(StreamRef::new(conn, id));
        }
        empty
    }

    pub(crate) fn remove_peer(&mut self, conn: ConnId) {
        self.peers.remove(&conn);
        for peer in self.peers.values_mut() {
            peer.blocked.retain(|c| *c != conn);
        }
        if self.current_target == Some(conn) {
            self.current_target = None;
        }
    }

    fn stream_mut(&mut self, at: StreamRef) -> Option<&mut super::stream::Stream> {
        self.peers.get_mut(&at.conn)?.streams.get_mut(at.stream)
    }

    fn retire_if_done(&mut self, at: StreamRef, now: Instant) {
        let linger = self.linger;
        if let Some(peer) = self.peers.get_mut(&at.conn) {
            let done = peer
                .streams
                .get(at.stream)
                .is_some_and(|s| s.inbound_ended && s.outbound_ended);
            if done {
                peer.streams.schedule_removal(at.stream, now + linger);
            }
        }
    }
}
