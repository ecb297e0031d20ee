use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Live client registration held by the dispatcher.
#[derive(Debug, Clone)]
pub struct Registration {
    pub client_id: Uuid,
    pub client_host: String,
    pub num_tasks: usize,
    pub last_heartbeat: DateTime<Utc>,
    /// Cancelling tears down the connection tasks for this client.
    pub connection: CancellationToken,
}

impl Registration {
    pub fn new(
        client_id: Uuid,
        client_host: String,
        num_tasks: usize,
        connection: CancellationToken,
    ) -> Self {
        Self {
            client_id,
            client_host,
            num_tasks,
            last_heartbeat: Utc::now(),
            connection,
        }
    }
}

/// Registration map, written by the dispatcher and swept by the evictor.
#[derive(Debug, Default)]
pub struct Registry {
    clients: HashMap<Uuid, Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: Registration) {
        tracing::info!(
            client_id = %registration.client_id,
            client_host = %registration.client_host,
            num_tasks = registration.num_tasks,
            "Client registered"
        );
        self.clients.insert(registration.client_id, registration);
    }

    /// Record a heartbeat; unknown ids are ignored (already evicted).
    pub fn beat(&mut self, client_id: Uuid) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(registration) => {
                registration.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, client_id: Uuid) -> Option<Registration> {
        self.clients.remove(&client_id)
    }

    /// Clients silent for longer than `evict_after`.
    pub fn evictable(&self, evict_after: Duration) -> Vec<Uuid> {
        let now = Utc::now();
        self.clients
            .values()
            .filter(|registration| now - registration.last_heartbeat > evict_after)
            .map(|registration| registration.client_id)
            .collect()
    }

    pub fn active(&self) -> usize {
        self.clients.len()
    }

    /// Total executor slots across registered clients.
    pub fn total_executors(&self) -> usize {
        self.clients.values().map(|r| r.num_tasks).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Remove and return every registration.
    pub fn drain_all(&mut self) -> Vec<Registration> {
        self.clients.drain().map(|(_, registration)| registration).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(num_tasks: usize) -> Registration {
        Registration::new(
            Uuid::new_v4(),
            "node-1".to_string(),
            num_tasks,
            CancellationToken::new(),
        )
    }

    #[test]
    fn register_and_beat() {
        let mut registry = Registry::new();
        let reg = registration(2);
        let id = reg.client_id;
        registry.register(reg);
        assert_eq!(registry.active(), 1);
        assert!(registry.beat(id));
        assert!(!registry.beat(Uuid::new_v4()));
    }

    #[test]
    fn eviction_by_heartbeat_age() {
        let mut registry = Registry::new();
        let mut reg = registration(1);
        reg.last_heartbeat = Utc::now() - Duration::seconds(120);
        let id = reg.client_id;
        registry.register(reg);
        assert!(registry.evictable(Duration::seconds(600)).is_empty());
        assert_eq!(registry.evictable(Duration::seconds(60)), vec![id]);
    }

    #[test]
    fn executor_totals() {
        let mut registry = Registry::new();
        registry.register(registration(2));
        registry.register(registration(3));
        assert_eq!(registry.total_executors(), 5);
    }
}
