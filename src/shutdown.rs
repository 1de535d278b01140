use tokio_util::sync::CancellationToken;

/// Install a handler for SIGTERM and ctrl-c.
///
/// Returns a `CancellationToken` that is cancelled when either signal
/// arrives. The dispatcher and monitor loops watch this token and drain
/// gracefully; in-flight executions are left to finish on their own.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received ctrl-c, initiating graceful shutdown");
            }
            _ = terminate => {
                tracing::info!("received SIGTERM, initiating graceful shutdown");
            }
        }

        trigger.cancel();
    });

    token
}
