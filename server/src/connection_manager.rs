//! Connection bookkeeping: id allocation, ping freshness, and expiry.

use log::{info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// A client the server has completed the `!connect` handshake with.
#[derive(Debug, Clone)]
pub struct Connection {
    pub endpoint: SocketAddr,
    pub last_ping: Instant,
}

/// Maps connection ids to endpoints and sweeps out clients that stopped
/// pinging. Ids are unique for the lifetime of the server.
pub struct ConnectionManager {
    connections: HashMap<u32, Connection>,
    next_id: u32,
    connection_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(connection_timeout: Duration) -> Self {
        Self {
            connections: HashMap::new(),
            next_id: 1,
            connection_timeout,
        }
    }

    pub fn add_connection(&mut self, endpoint: SocketAddr) -> u32 {
        let id = self.next_id;
        self.next_id += 1;

        self.connections.insert(
            id,
            Connection {
                endpoint,
                last_ping: Instant::now(),
            },
        );
        info!("connection {} registered from {}", id, endpoint);

        id
    }

    /// Refreshes the ping timestamp; unknown ids are logged and ignored.
    pub fn update_ping(&mut self, id: u32) {
        match self.connections.get_mut(&id) {
            Some(connection) => connection.last_ping = Instant::now(),
            None => warn!("ping for unknown connection {}", id),
        }
    }

    /// Drops every connection whose last ping is older than the timeout and
    /// returns the removed ids.
    pub fn cleanup_expired(&mut self) -> Vec<u32> {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .connections
            .iter()
            .filter(|(_, connection)| now.duration_since(connection.last_ping) > self.connection_timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.connections.remove(id);
            info!("connection {} expired", id);
        }

        expired
    }

    /// Endpoint snapshot for broadcasting.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.connections
            .values()
            .map(|connection| connection.endpoint)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> SocketAddr {
        format!("[::1]:{}", port).parse().unwrap()
    }

    #[test]
    fn ids_are_monotone_starting_at_one() {
        let mut manager = ConnectionManager::new(DEFAULT_CONNECTION_TIMEOUT);

        assert_eq!(manager.add_connection(endpoint(4000)), 1);
        assert_eq!(manager.add_connection(endpoint(4001)), 2);
        assert_eq!(manager.add_connection(endpoint(4002)), 3);
        assert_eq!(manager.len(), 3);
    }

    #[test]
    fn ids_are_never_reused() {
        let mut manager = ConnectionManager::new(Duration::from_millis(0));

        let first = manager.add_connection(endpoint(4000));
        std::thread::sleep(Duration::from_millis(5));
        manager.cleanup_expired();
        assert!(manager.is_empty());

        let second = manager.add_connection(endpoint(4000));
        assert!(second > first);
    }

    #[test]
    fn update_ping_keeps_a_connection_alive() {
        let mut manager = ConnectionManager::new(Duration::from_millis(50));
        let id = manager.add_connection(endpoint(4000));

        std::thread::sleep(Duration::from_millis(40));
        manager.update_ping(id);
        std::thread::sleep(Duration::from_millis(40));

        assert!(manager.cleanup_expired().is_empty());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn update_ping_for_unknown_id_is_a_noop() {
        let mut manager = ConnectionManager::new(DEFAULT_CONNECTION_TIMEOUT);
        manager.update_ping(42);
        assert!(manager.is_empty());
    }

    #[test]
    fn cleanup_removes_only_expired_connections() {
        let mut manager = ConnectionManager::new(Duration::from_millis(50));
        let stale = manager.add_connection(endpoint(4000));

        std::thread::sleep(Duration::from_millis(60));
        let fresh = manager.add_connection(endpoint(4001));

        let expired = manager.cleanup_expired();
        assert_eq!(expired, vec![stale]);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.endpoints(), vec![endpoint(4001)]);
        let _ = fresh;
    }

    #[test]
    fn endpoints_reflect_current_connections() {
        let mut manager = ConnectionManager::new(DEFAULT_CONNECTION_TIMEOUT);
        manager.add_connection(endpoint(4000));
        manager.add_connection(endpoint(4001));

        let mut endpoints = manager.endpoints();
        endpoints.sort();
        assert_eq!(endpoints, vec![endpoint(4000), endpoint(4001)]);
    }
}
