//! Tokio driver for one relay session.
//!
//! # Data Flow
//! ```text
//! TcpStream readiness (frontend + backends)
//!     → try_read_buf into the engine's input buffer → engine.on_readable
//!     → try_write from the engine's output buffer → engine.on_written
//! Engine actions
//!     → Connect: spawned connect task, result back over mpsc
//!     → ShutdownWrite / Close: performed on the owned streams
//! PauseHandle::resume
//!     → Notify → engine.on_tick
//! ```
//!
//! # Design Decisions
//! - One task owns every socket of the session and the engine; only
//!   connects run elsewhere, so the engine needs no locking
//! - Read interest is dropped while a connection is paused or its input is
//!   full, leaving backpressure to TCP

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncWriteExt, Interest, Ready};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, trace, warn};

use crate::observability::metrics::{self, Direction};
use crate::processor::{ConnId, Processor};
use crate::relay::{Action, CloseReason, Connector, EngineConfig, RelayEngine};

/// How long a closing session may spend flushing its last bytes to the client.
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub engine: EngineConfig,
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

type ConnectResult = (ConnId, u64, io::Result<TcpStream>);

enum Event {
    Ready(ConnId, io::Result<Ready>),
    Connected(ConnectResult),
    Tick,
    Shutdown,
}

struct Driver<P: Processor> {
    engine: RelayEngine<P>,
    frontend: TcpStream,
    backends: HashMap<ConnId, TcpStream>,
    /// Connect attempt per backend id; results of stale attempts are dropped.
    connecting: HashMap<ConnId, u64>,
    attempts: u64,
    connect_tx: mpsc::UnboundedSender<ConnectResult>,
    connect_timeout: Duration,
}

/// Run one client session to completion. Returns why it closed.
pub async fn run_session<P: Processor>(
    processor: Arc<P>,
    connector: Arc<dyn Connector>,
    frontend: TcpStream,
    client: SocketAddr,
    config: SessionConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Option<CloseReason> {
    let _ = frontend.set_nodelay(true);
    let waker = Arc::new(Notify::new());
    let engine = RelayEngine::new(processor, connector, client, config.engine, waker.clone());
    let (connect_tx, mut connect_rx) = mpsc::unbounded_channel();
    let mut driver = Driver {
        engine,
        frontend,
        backends: HashMap::new(),
        connecting: HashMap::new(),
        attempts: 0,
        connect_tx,
        connect_timeout: config.connect_timeout,
    };

    metrics::record_session_opened();
    driver.engine.start();

    let reason = loop {
        if driver.run_actions().await {
            break driver.engine.close_reason();
        }

        let event = {
            let mut ready: FuturesUnordered<_> = driver
                .interests()
                .into_iter()
                .filter_map(|(id, interest)| {
                    let stream = if id.is_frontend() {
                        &driver.frontend
                    } else {
                        driver.backends.get(&id)?
                    };
                    Some(async move { (id, stream.ready(interest).await) })
                })
                .collect();

            tokio::select! {
                Some((id, result)) = ready.next(), if !ready.is_empty() => Event::Ready(id, result),
                Some(result) = connect_rx.recv() => Event::Connected(result),
                _ = waker.notified() => Event::Tick,
                _ = shutdown.recv() => Event::Shutdown,
            }
        };

        match event {
            Event::Ready(id, Ok(ready)) => driver.on_ready(id, ready),
            Event::Ready(id, Err(err)) => driver.engine.on_error(id, err),
            Event::Connected(result) => driver.on_connect_result(result),
            Event::Tick => driver.engine.on_tick(),
            Event::Shutdown => {
                debug!(client = %client, "Shutdown requested");
                driver.engine.shutdown();
            }
        }
    };

    metrics::record_session_finished();
    debug!(client = %client, reason = reason.map_or("unknown", |r| r.as_str()), "Session finished");
    reason
}

impl<P: Processor> Driver<P> {
    /// Read/write interest for every connection the engine wants serviced.
    fn interests(&self) -> Vec<(ConnId, Interest)> {
        let ids = std::iter::once(ConnId::FRONTEND).chain(self.backends.keys().copied());
        ids.filter_map(|id| {
            let read = self.engine.wants_read(id).then_some(Interest::READABLE);
            let write = self.engine.wants_write(id).then_some(Interest::WRITABLE);
            match (read, write) {
                (Some(r), Some(w)) => Some((id, r | w)),
                (Some(i), None) | (None, Some(i)) => Some((id, i)),
                (None, None) => None,
            }
        })
        .collect()
    }

    /// Execute queued engine actions. Returns true once the session is over.
    async fn run_actions(&mut self) -> bool {
        for action in self.engine.take_actions() {
            match action {
                Action::Connect { id, target } => {
                    self.attempts += 1;
                    let attempt = self.attempts;
                    self.connecting.insert(id, attempt);
                    let tx = self.connect_tx.clone();
                    let timeout = self.connect_timeout;
                    tokio::spawn(async move {
                        let result = match tokio::time::timeout(timeout, TcpStream::connect(target.addr)).await {
                            Ok(result) => result,
                            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "backend connect timed out")),
                        };
                        let _ = tx.send((id, attempt, result));
                    });
                }
                Action::ShutdownWrite(id) => {
                    if let Some(stream) = self.backends.get_mut(&id) {
                        if let Err(err) = stream.shutdown().await {
                            debug!(conn = %id, error = %err, "Write shutdown failed");
                        }
                    }
                }
                Action::Close(id) if id.is_frontend() => {
                    self.finish().await;
                    return true;
                }
                Action::Close(id) => {
                    self.connecting.remove(&id);
                    self.backends.remove(&id);
                }
            }
        }
        false
    }

    fn on_connect_result(&mut self, (id, attempt, result): ConnectResult) {
        if self.connecting.get(&id) != Some(&attempt) {
            trace!(conn = %id, "Dropping stale connect result");
            return;
        }
        self.connecting.remove(&id);
        metrics::record_backend_connect(result.is_ok());
        match result {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                self.backends.insert(id, stream);
                self.engine.on_connected(id);
            }
            Err(err) => self.engine.on_connect_failed(id, err),
        }
    }

    fn on_ready(&mut self, id: ConnId, ready: Ready) {
        if ready.is_writable() {
            if let Err(err) = self.write(id) {
                self.engine.on_error(id, err);
                return;
            }
            self.engine.on_written(id);
        }
        if ready.is_readable() || ready.is_read_closed() {
            self.read(id);
        }
    }

    fn write(&mut self, id: ConnId) -> io::Result<()> {
        let stream = if id.is_frontend() {
            &self.frontend
        } else {
            match self.backends.get(&id) {
                Some(stream) => stream,
                None => return Ok(()),
            }
        };
        let Some(output) = self.engine.output_mut(id) else {
            return Ok(());
        };
        let direction = if id.is_frontend() {
            Direction::Downstream
        } else {
            Direction::Upstream
        };
        while let Some(chunk) = output.front() {
            match stream.try_write(chunk) {
                Ok(n) => {
                    output.advance(n);
                    metrics::record_bytes(direction, n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn read(&mut self, id: ConnId) {
        while self.engine.wants_read(id) {
            let budget = self.engine.read_budget(id);
            let stream = if id.is_frontend() {
                &self.frontend
            } else {
                match self.backends.get(&id) {
                    Some(stream) => stream,
                    None => return,
                }
            };
            let Some(input) = self.engine.input_mut(id) else {
                return;
            };
            let direction = if id.is_frontend() {
                Direction::Upstream
            } else {
                Direction::Downstream
            };
            match stream.try_read_buf(&mut input.limit(budget)) {
                Ok(0) => {
                    self.engine.on_remote_closed(id);
                    return;
                }
                Ok(n) => {
                    trace!(conn = %id, bytes = n, "Read");
                    metrics::record_bytes(direction, n);
                    self.engine.on_readable(id);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    self.engine.on_error(id, err);
                    return;
                }
            }
        }
    }

    /// Flush what is left for the client, then close it.
    async fn finish(&mut self) {
        self.backends.clear();
        let flush = async {
            while let Some(output) = self.engine.output_mut(ConnId::FRONTEND) {
                let Some(chunk) = output.front() else {
                    break;
                };
                match self.frontend.write(chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => output.advance(n),
                }
            }
        };
        if tokio::time::timeout(FINAL_FLUSH_TIMEOUT, flush).await.is_err() {
            warn!(client = %self.engine.client(), "Timed out flushing final bytes");
        }
        let _ = self.frontend.shutdown().await;
    }
}
