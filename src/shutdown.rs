use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a SIGTERM/SIGINT handler and hand back a `CancellationToken`
/// cancelled on the first signal.
///
/// The consumer loop stops polling on cancellation, the executor forwards
/// termination to the in-flight child, and the supervisor propagates the
/// signal downward. A second signal is not intercepted; the default
/// disposition then kills the process outright.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, draining before exit");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, draining before exit");
            }
        }

        token_clone.cancel();
    });

    token
}
