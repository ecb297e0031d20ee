use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token when SIGINT or SIGTERM arrives.
///
/// Components watch this token to drain gracefully: no new work is
/// accepted, in-flight bundles complete or time out, then the process
/// exits. A second signal has no further effect; forced executor teardown
/// goes through [`install_force_handler`] instead.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = token.clone();
        tokio::spawn(async move {
            let mut events = signal(kind).expect("failed to install signal handler");
            events.recv().await;
            tracing::info!(signal = name, "Drain requested");
            token.cancel();
        });
    }
    token
}

/// Install the forced-shutdown handler for SIGUSR1.
///
/// The returned token is cancelled when SIGUSR1 arrives; executors respond
/// by signal-escalating their running task processes immediately.
pub fn install_force_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigusr1 =
            signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");
        sigusr1.recv().await;
        tracing::warn!("Received SIGUSR1, forcing executor shutdown");
        token_clone.cancel();
    });

    token
}
