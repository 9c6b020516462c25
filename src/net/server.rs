//! Accept loop and processor selection.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, Instrument};

use crate::config::{ProcessorKind, RelayConfig};
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Listener, ListenerError};
use crate::net::session::{run_session, SessionConfig};
use crate::processor::h2::H2Processor;
use crate::processor::passthrough::PassThrough;
use crate::processor::Processor;
use crate::relay::{Connector, EngineConfig};

/// How long running sessions get to close after shutdown is triggered.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Server {
    kind: ProcessorKind,
    session: SessionConfig,
    stream_linger: Duration,
    connector: Arc<dyn Connector>,
    tracker: ConnectionTracker,
}

impl Server {
    pub fn new(config: &RelayConfig, connector: Arc<dyn Connector>) -> Self {
        let relay = &config.relay;
        let engine = EngineConfig {
            in_buffer_size: relay.in_buffer_size,
            out_buffer_size: relay.out_buffer_size,
            max_backends: relay.max_backends_per_session,
            zero_copy: relay.zero_copy_threshold != Some(0),
            zero_copy_threshold: relay.zero_copy_threshold,
        };
        Self {
            kind: relay.processor,
            session: SessionConfig {
                engine,
                connect_timeout: config.timeouts.connect(),
            },
            stream_linger: config.h2.stream_linger(),
            connector,
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept until `shutdown` fires, then wait for sessions to drain.
    pub async fn run(self, listener: Listener, shutdown: Shutdown) -> Result<(), ListenerError> {
        match self.kind {
            ProcessorKind::H2 => {
                let processor = Arc::new(H2Processor::new(self.stream_linger));
                self.serve(processor, listener, shutdown).await
            }
            ProcessorKind::Tcp => self.serve(Arc::new(PassThrough), listener, shutdown).await,
        }
    }

    async fn serve<P: Processor>(
        self,
        processor: Arc<P>,
        listener: Listener,
        shutdown: Shutdown,
    ) -> Result<(), ListenerError> {
        let threshold = self
            .session
            .engine
            .zero_copy_threshold
            .unwrap_or_else(|| processor.zero_copy_threshold());
        info!(processor = processor.name(), zero_copy_threshold = threshold, "Relay started");
        let mut stop = shutdown.subscribe();

        while !shutdown.is_triggered() {
            let (stream, client, permit) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(ListenerError::Accept(e)) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                    Err(e) => return Err(e),
                },
                _ = stop.recv() => break,
            };

            let guard = self.tracker.track();
            let span = tracing::info_span!("session", id = %guard.id(), client = %client);
            let task = run_session(
                processor.clone(),
                self.connector.clone(),
                stream,
                client,
                self.session.clone(),
                shutdown.subscribe(),
            );
            tokio::spawn(
                async move {
                    debug!("Session started");
                    task.await;
                    drop(permit);
                    drop(guard);
                }
                .instrument(span),
            );
        }

        info!(active = self.tracker.active_count(), "Listener stopped, draining sessions");
        if !self.tracker.wait_idle(DRAIN_TIMEOUT).await {
            error!(active = self.tracker.active_count(), "Sessions still running after drain timeout");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("kind", &self.kind)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
