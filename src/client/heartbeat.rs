use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use uuid::Uuid;

use crate::protocol::{ClientState, Message, PeerHeartbeat};
use crate::task::HOSTNAME;

fn heartbeat(client_id: Uuid, state: ClientState) -> Message {
    Message::Heartbeat(PeerHeartbeat {
        client_id,
        client_host: HOSTNAME.clone(),
        time: Utc::now(),
        state,
    })
}

/// Periodically notify the server that this client is alive; one final
/// notice marks the client finished so the server can deregister it.
pub async fn run_heartbeat(
    client_id: Uuid,
    outgoing: mpsc::Sender<Message>,
    heartrate: u64,
    stop: CancellationToken,
) {
    tracing::debug!("Started (heartbeat)");
    let mut interval = tokio::time::interval(Duration::from_secs(heartrate.max(1)));
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                if outgoing.send(heartbeat(client_id, ClientState::Running)).await.is_err() {
                    tracing::debug!("Writer gone, stopping heartbeat");
                    return;
                }
                tracing::trace!("Heartbeat sent");
            }
        }
    }
    let _ = outgoing.send(heartbeat(client_id, ClientState::Finished)).await;
    tracing::debug!("Done (heartbeat)");
}
