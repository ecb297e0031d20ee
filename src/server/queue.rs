use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::task::Bundle;

/// Server-local queues: a bounded FIFO of outgoing task bundles (capacity
/// `server.queuesize`, blocking the scheduler when full) and an unbounded
/// return path for completed bundles. The outbound receiver is shared so
/// any client connection can pull the next bundle; the channel closing is
/// the drain signal for every consumer.
#[derive(Debug, Clone)]
pub struct ServerQueue {
    outbound_rx: Arc<Mutex<mpsc::Receiver<Bundle>>>,
    pub completed_tx: mpsc::UnboundedSender<Bundle>,
}

impl ServerQueue {
    pub fn new(
        queuesize: usize,
    ) -> (
        Self,
        mpsc::Sender<Bundle>,
        mpsc::UnboundedReceiver<Bundle>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queuesize.max(1));
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound_rx: Arc::new(Mutex::new(outbound_rx)),
                completed_tx,
            },
            outbound_tx,
            completed_rx,
        )
    }

    /// Pull the next outgoing bundle. Returns `None` once every producer
    /// has dropped its sender and the queue is empty (drain).
    pub async fn next_bundle(&self) -> Option<Bundle> {
        self.outbound_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn bounded_queue_blocks_producer() {
        let (queue, tx, _completed) = ServerQueue::new(1);
        let bundle = vec![Task::new("echo 1", &BTreeMap::new()).unwrap()];
        tx.send(bundle.clone()).await.unwrap();
        // capacity one: a second send must not complete until a pull
        assert!(tx.try_send(bundle.clone()).is_err());
        assert!(queue.next_bundle().await.is_some());
        assert!(tx.try_send(bundle).is_ok());
    }

    #[tokio::test]
    async fn closed_queue_drains_to_none() {
        let (queue, tx, _completed) = ServerQueue::new(2);
        let bundle = vec![Task::new("echo 1", &BTreeMap::new()).unwrap()];
        tx.send(bundle).await.unwrap();
        drop(tx);
        assert!(queue.next_bundle().await.is_some());
        assert!(queue.next_bundle().await.is_none());
    }
}
