//! OS signal handling.
//!
//! # Responsibilities
//! - SIGTERM/SIGINT trigger graceful shutdown
//! - SIGHUP requests a config reload, not shutdown

use tokio::sync::mpsc;

use crate::lifecycle::Shutdown;

/// Wait for signals until shutdown. Each SIGHUP sends one reload request.
#[cfg(unix)]
pub async fn handle_signals(shutdown: Shutdown, reload: mpsc::UnboundedSender<()>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = term.recv() => {
                tracing::info!("SIGTERM received, shutting down");
                break;
            }
            _ = int.recv() => {
                tracing::info!("SIGINT received, shutting down");
                break;
            }
            _ = hup.recv() => {
                tracing::info!("SIGHUP received, reloading configuration");
                let _ = reload.send(());
            }
        }
    }
    shutdown.trigger();
    Ok(())
}

#[cfg(not(unix))]
pub async fn handle_signals(shutdown: Shutdown, _reload: mpsc::UnboundedSender<()>) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received, shutting down");
    shutdown.trigger();
    Ok(())
}
