//! Streams, per-connection stream registries, and the cross-connection
//! session table that pairs a frontend stream with a backend stream.

use std::collections::HashMap;
use std::time::Instant;

use super::window::{RecvWindow, SendWindow};
use crate::processor::{ConnId, Hint, ProcessError};

/// Which side of the connection the proxy plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Towards the frontend: peer streams are odd, pushed streams even.
    Server,
    /// Towards a backend: our streams are odd, pushed streams even.
    Client,
}

#[derive(Debug)]
pub struct Stream {
    pub id: u32,
    pub send: SendWindow,
    pub recv: RecvWindow,
    /// The peer sent END_STREAM.
    pub inbound_ended: bool,
    /// END_STREAM was relayed towards the peer.
    pub outbound_ended: bool,
    pub hint: Hint,
    remove_at: Option<Instant>,
}

impl Stream {
    fn new(id: u32, send: i64, recv: i64) -> Self {
        Self {
            id,
            send: SendWindow::new(send),
            recv: RecvWindow::new(recv),
            inbound_ended: false,
            outbound_ended: false,
            hint: Hint::none(),
            remove_at: None,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.remove_at.is_some()
    }
}

#[derive(Debug)]
pub struct StreamRegistry {
    role: Role,
    streams: HashMap<u32, Stream>,
    next_local: u32,
    last_remote: u32,
}

impl StreamRegistry {
    pub fn new(role: Role) -> Self {
        let next_local = match role {
            Role::Server => 2,
            Role::Client => 1,
        };
        Self {
            role,
            streams: HashMap::new(),
            next_local,
            last_remote: 0,
        }
    }

    /// Register a stream the peer opened (a request from the client, or a
    /// stream promised by a backend).
    pub fn open_remote(&mut self, id: u32, send: i64, recv: i64) -> Result<&mut Stream, ProcessError> {
        let odd = id % 2 == 1;
        let expected_odd = self.role == Role::Server;
        if id == 0 || odd != expected_odd {
            return Err(ProcessError::violation(format!(
                "stream id {id} has the wrong parity for a peer-initiated stream"
            )));
        }
        if id <= self.last_remote || self.streams.contains_key(&id) {
            return Err(ProcessError::violation(format!("stream id {id} was already used")));
        }
        self.last_remote = id;
        Ok(self.streams.entry(id).or_insert(Stream::new(id, send, recv)))
    }

    /// Allocate a fresh id for a stream the proxy opens.
    pub fn open_local(&mut self, send: i64, recv: i64) -> u32 {
        while self.streams.contains_key(&self.next_local) {
            self.next_local += 2;
        }
        let id = self.next_local;
        self.next_local += 2;
        self.streams.insert(id, Stream::new(id, send, recv));
        id
    }

    pub fn get(&self, id: u32) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    /// Remove `id` at `at` unless already scheduled.
    pub fn schedule_removal(&mut self, id: u32, at: Instant) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.remove_at.get_or_insert(at);
        }
    }

    /// Drop streams whose linger period is over.
    pub fn sweep(&mut self, now: Instant) -> Vec<u32> {
        self.remove_where(|s| s.remove_at.is_some_and(|at| at <= now))
    }

    /// Drop every ended stream regardless of linger.
    pub fn flush(&mut self) -> Vec<u32> {
        self.remove_where(|s| s.remove_at.is_some())
    }

    fn remove_where(&mut self, pred: impl Fn(&Stream) -> bool) -> Vec<u32> {
        let ids: Vec<u32> = self
            .streams
            .values()
            .filter(|s| pred(s))
            .map(|s| s.id)
            .collect();
        for id in &ids {
            self.streams.remove(id);
        }
        ids
    }
}

/// A stream on a specific connection of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamRef {
    pub conn: ConnId,
    pub stream: u32,
}

impl StreamRef {
    pub fn new(conn: ConnId, stream: u32) -> Self {
        Self { conn, stream }
    }
}

/// Bidirectional pairing of streams across connections.
#[derive(Debug, Default)]
pub struct SessionTable {
    links: HashMap<StreamRef, StreamRef>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair `a` with `b`. Fails when either side is already paired.
    pub fn bind(&mut self, a: StreamRef, b: StreamRef) -> bool {
        if a == b || self.links.contains_key(&a) || self.links.contains_key(&b) {
            return false;
        }
        self.links.insert(a, b);
        self.links.insert(b, a);
        true
    }

    pub fn peer(&self, r: StreamRef) -> Option<StreamRef> {
        self.links.get(&r).copied()
    }

    /// Remove the pairing of `r`, returning its former peer.
    pub fn unbind(&mut self, r: StreamRef) -> Option<StreamRef> {
        let other = self.links.remove(&r)?;
        self.links.remove(&other);
        Some(other)
    }

    /// Number of live pairings.
    pub fn len(&self) -> usize {
        self.links.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
