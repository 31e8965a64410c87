//! OS signal handling: map termination signals onto the stop token.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::CoreResult;

/// Spawn a task cancelling `token` on SIGINT, SIGTERM or SIGQUIT.
pub fn spawn_signal_listener(token: CancellationToken) -> CoreResult<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = quit.recv() => "SIGQUIT",
        };
        info!(signal = name, "termination signal received, shutting down");
        token.cancel();
    });

    Ok(())
}
