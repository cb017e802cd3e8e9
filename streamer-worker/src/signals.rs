use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Wait for SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    Ok(())
}

/// Cancel `shutdown` once the process is asked to stop.
///
/// If the signal handlers cannot be installed, the token is cancelled right away: a consumer that
/// could not be stopped cleanly would stay registered in its group.
pub fn cancel_on_shutdown_signal(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(error) = wait_for_shutdown_signal().await {
            error!(%error, "failed to listen for shutdown signals");
        }
        shutdown.cancel();
    });
}
