use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Duration;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::{Ack, ClientState, FrameCodec, Message};
use crate::server::queue::ServerQueue;
use crate::server::registry::{Registration, Registry};
use crate::store::TaskStore;
use crate::task::{Bundle, HOSTNAME, INSTANCE};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub auth: String,
    pub no_confirm: bool,
}

/// Accept client connections, perform the authenticated handshake, and run
/// the per-connection reader/writer pair until drain or disconnect.
pub async fn serve(
    listener: TcpListener,
    config: DispatcherConfig,
    queue: ServerQueue,
    outbound_requeue: mpsc::WeakSender<Bundle>,
    registry: Arc<RwLock<Registry>>,
    store: Option<TaskStore>,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::debug!("Started (dispatcher)");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                tokio::spawn(handle_connection(
                    stream,
                    addr,
                    config.clone(),
                    queue.clone(),
                    outbound_requeue.clone(),
                    registry.clone(),
                    store.clone(),
                ));
            }
        }
    }
    tracing::debug!("Done (dispatcher)");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: DispatcherConfig,
    queue: ServerQueue,
    outbound_requeue: mpsc::WeakSender<Bundle>,
    registry: Arc<RwLock<Registry>>,
    store: Option<TaskStore>,
) {
    let mut framed = Framed::new(stream, FrameCodec::new(&config.auth));
    let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(Message::Hello(hello)))) => hello,
        Ok(Some(Err(err))) => {
            tracing::error!(peer = %addr, error = %err, "Handshake failed, closing connection");
            return;
        }
        _ => {
            tracing::warn!(peer = %addr, "No handshake from peer, closing connection");
            return;
        }
    };
    if hello.token != config.auth {
        tracing::error!(peer = %addr, client_id = %hello.client_id, "Authentication token mismatch");
        return;
    }
    let welcome = Message::Ack(Ack {
        client_id: *INSTANCE,
        client_host: HOSTNAME.clone(),
        task_ids: Vec::new(),
    });
    if framed.send(welcome).await.is_err() {
        tracing::warn!(peer = %addr, "Peer closed during handshake");
        return;
    }
    let connection = CancellationToken::new();
    registry.write().await.register(Registration::new(
        hello.client_id,
        hello.client_host.clone(),
        hello.num_tasks,
        connection.clone(),
    ));
    if let Some(store) = &store {
        if let Err(err) = store.register_client(hello.client_id, &hello.client_host).await {
            tracing::error!(error = %err, "Failed to record client registration");
        }
    }

    let (sink, mut frames) = framed.split();
    let (ack_tx, ack_rx) = mpsc::channel::<Ack>(4);
    let writer = tokio::spawn(writer_loop(
        sink,
        queue.clone(),
        outbound_requeue,
        connection.clone(),
        ack_rx,
        config.no_confirm,
    ));

    let mut finished = false;
    loop {
        tokio::select! {
            _ = connection.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(Message::BundleIn(bundle))) => {
                    registry.write().await.beat(hello.client_id);
                    if queue.completed_tx.send(bundle).is_err() {
                        tracing::warn!("Receiver gone, dropping returned bundle");
                    }
                }
                Some(Ok(Message::Heartbeat(heartbeat))) => {
                    registry.write().await.beat(heartbeat.client_id);
                    tracing::trace!(client_id = %heartbeat.client_id, state = ?heartbeat.state, "Heartbeat");
                    if heartbeat.state == ClientState::Finished {
                        finished = true;
                        break;
                    }
                }
                Some(Ok(Message::Ack(ack))) => {
                    if let Some(store) = &store {
                        if let Err(err) = store
                            .attribute(ack.client_id, &ack.client_host, &ack.task_ids)
                            .await
                        {
                            tracing::error!(error = %err, "Failed to attribute bundle");
                        }
                    }
                    let _ = ack_tx.try_send(ack);
                }
                Some(Ok(other)) => {
                    tracing::warn!(peer = %addr, message = ?other.tag(), "Unexpected frame from client");
                }
                Some(Err(err)) => {
                    // malformed frame or MAC mismatch: connection-fatal
                    tracing::error!(peer = %addr, error = %err, "Closing connection");
                    break;
                }
                // EOF: leave the registration for the eviction sweep
                None => break,
            }
        }
    }
    connection.cancel();
    let _ = writer.await;
    if finished {
        registry.write().await.remove(hello.client_id);
        if let Some(store) = &store {
            let _ = store.client_disconnected(hello.client_id, false).await;
        }
        tracing::info!(client_id = %hello.client_id, "Client disconnected");
    } else {
        tracing::debug!(client_id = %hello.client_id, "Connection lost, eviction sweep will follow");
    }
}

/// Deliver outgoing bundles to one client. Without `no_confirm`, the next
/// bundle is not pulled until the previous one is acknowledged. A closed
/// queue means drain: tell the client to disconnect.
async fn writer_loop(
    mut sink: futures::stream::SplitSink<Framed<TcpStream, FrameCodec>, Message>,
    queue: ServerQueue,
    outbound_requeue: mpsc::WeakSender<Bundle>,
    connection: CancellationToken,
    mut ack_rx: mpsc::Receiver<Ack>,
    no_confirm: bool,
) {
    loop {
        tokio::select! {
            _ = connection.cancelled() => return,
            bundle = queue.next_bundle() => match bundle {
                None => {
                    let _ = sink.send(Message::Disconnect).await;
                    return;
                }
                Some(bundle) => {
                    if sink.send(Message::BundleOut(bundle.clone())).await.is_err() {
                        requeue(&outbound_requeue, bundle);
                        return;
                    }
                    if !no_confirm {
                        tokio::select! {
                            _ = connection.cancelled() => return,
                            ack = ack_rx.recv() => {
                                if ack.is_none() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Push an undeliverable bundle back onto the outbound queue, best effort.
fn requeue(outbound: &mpsc::WeakSender<Bundle>, bundle: Bundle) {
    match outbound.upgrade() {
        Some(sender) => {
            if let Err(err) = sender.try_send(bundle) {
                tracing::warn!(error = %err, "Could not requeue undelivered bundle");
            }
        }
        None => tracing::debug!("Queue closed, undelivered bundle dropped"),
    }
}

/// Periodic sweep removing registrations whose heartbeat went silent and
/// reverting their in-flight tasks.
pub async fn run_evictor(
    registry: Arc<RwLock<Registry>>,
    store: Option<TaskStore>,
    evict_after: u64,
    sweep_interval: u64,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        let silent = registry
            .read()
            .await
            .evictable(chrono::Duration::seconds(evict_after as i64));
        for client_id in silent {
            let Some(registration) = registry.write().await.remove(client_id) else {
                continue;
            };
            tracing::warn!(
                client_id = %client_id,
                client_host = %registration.client_host,
                "Evicting client (heartbeat silence)"
            );
            registration.connection.cancel();
            if let Some(store) = &store {
                match store.revert_orphaned(client_id).await {
                    Ok(reverted) => {
                        if reverted > 0 {
                            tracing::info!(count = reverted, "Reverted in-flight tasks of evicted client");
                        }
                    }
                    Err(err) => tracing::error!(error = %err, "Failed to revert evicted client tasks"),
                }
                let _ = store.client_disconnected(client_id, true).await;
            }
        }
    }
}
