use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use crate::protocol::Message;
use crate::task::Task;

/// Accumulate finished tasks and return them to the server in bundles
/// bounded by size or wait time. The final partial bundle is flushed when
/// the executor pool closes the channel.
pub async fn run_collector(
    mut finished_rx: mpsc::Receiver<Task>,
    outgoing: mpsc::Sender<Message>,
    bundlesize: usize,
    bundlewait: u64,
) {
    tracing::debug!("Started (collector)");
    let wait = Duration::from_secs(bundlewait);
    let mut buffer: Vec<Task> = Vec::new();
    let mut last_flush = Instant::now();
    loop {
        let deadline = if buffer.is_empty() {
            Instant::now() + Duration::from_secs(3600)
        } else {
            last_flush + wait
        };
        tokio::select! {
            task = finished_rx.recv() => match task {
                Some(task) => {
                    buffer.push(task);
                    if buffer.len() >= bundlesize.max(1) {
                        flush(&mut buffer, &outgoing).await;
                        last_flush = Instant::now();
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline) => {
                flush(&mut buffer, &outgoing).await;
                last_flush = Instant::now();
            }
        }
    }
    flush(&mut buffer, &outgoing).await;
    tracing::debug!("Done (collector)");
}

async fn flush(buffer: &mut Vec<Task>, outgoing: &mpsc::Sender<Message>) {
    if buffer.is_empty() {
        return;
    }
    let bundle = std::mem::take(buffer);
    let count = bundle.len();
    if outgoing.send(Message::BundleIn(bundle)).await.is_err() {
        tracing::warn!(count, "Writer gone, dropping return bundle");
        return;
    }
    tracing::trace!(count, "Returned bundle");
}
