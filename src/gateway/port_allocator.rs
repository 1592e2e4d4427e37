//! Port allocation for per-session web-terminal gateways.

use std::collections::HashMap;
use std::net::TcpListener;
use tokio::sync::Mutex;

use crate::core::errors::{OrchestratorError, Result};

/// Hands out loopback ports from a bounded inclusive range.
///
/// Leases are process-local and reset on restart; gateways that survived a
/// restart are reseeded via [`PortAllocator::reseed`].
pub struct PortAllocator {
    start: u16,
    end: u16,
    leased: Mutex<HashMap<u16, String>>,
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("start", &self.start)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

impl PortAllocator {
    /// Create an allocator over `[start, end]` inclusive
    #[must_use]
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            leased: Mutex::new(HashMap::new()),
        }
    }

    /// Check if a port is actually available in the OS by trying to bind it.
    fn is_port_available(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    /// Lease the lowest free port in the range.
    pub async fn acquire(&self, sid: &str) -> Result<u16> {
        let mut leased = self.leased.lock().await;

        for port in self.start..=self.end {
            if !leased.contains_key(&port) && Self::is_port_available(port) {
                leased.insert(port, sid.to_string());
                tracing::info!(port, sid, "Leased gateway port");
                return Ok(port);
            }
        }

        Err(OrchestratorError::NoFreePort {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the pool.
    pub async fn release(&self, port: u16) {
        if self.leased.lock().await.remove(&port).is_some() {
            tracing::info!(port, "Released gateway port");
        }
    }

    /// Re-register a lease for a gateway that survived a restart.
    pub async fn reseed(&self, port: u16, sid: &str) {
        if port < self.start || port > self.end {
            tracing::warn!(port, sid, "Ignoring out-of-range lease reseed");
            return;
        }
        self.leased.lock().await.insert(port, sid.to_string());
        tracing::debug!(port, sid, "Reseeded gateway port lease");
    }

    /// Session holding a port, if any
    pub async fn lease_of(&self, port: u16) -> Option<String> {
        self.leased.lock().await.get(&port).cloned()
    }

    /// Snapshot of all live leases, ordered by port
    pub async fn leases(&self) -> Vec<(u16, String)> {
        let mut all: Vec<(u16, String)> = self
            .leased
            .lock()
            .await
            .iter()
            .map(|(port, sid)| (*port, sid.clone()))
            .collect();
        all.sort_by_key(|(port, _)| *port);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_hands_out_distinct_ports() {
        let allocator = PortAllocator::new(19300, 19310);
        let a = allocator.acquire("s1").await.unwrap();
        let b = allocator.acquire("s2").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(allocator.lease_of(a).await.as_deref(), Some("s1"));
        assert_eq!(allocator.lease_of(b).await.as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn test_release_returns_port_to_pool() {
        let allocator = PortAllocator::new(19320, 19321);
        let port = allocator.acquire("s1").await.unwrap();
        allocator.release(port).await;
        assert!(allocator.lease_of(port).await.is_none());

        // Lowest free port is handed out again
        let again = allocator.acquire("s2").await.unwrap();
        assert_eq!(again, port);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_no_free_port() {
        let allocator = PortAllocator::new(19330, 19330);
        allocator.acquire("s1").await.unwrap();
        let err = allocator.acquire("s2").await.unwrap_err();
        assert_eq!(err.kind(), "NoFreePort");
    }

    #[tokio::test]
    async fn test_reseed_registers_existing_lease() {
        let allocator = PortAllocator::new(19340, 19345);
        allocator.reseed(19342, "old1").await;
        assert_eq!(allocator.lease_of(19342).await.as_deref(), Some("old1"));

        // The reseeded port is skipped by acquire
        let port = allocator.acquire("new1").await.unwrap();
        assert_ne!(port, 19342);
    }

    #[tokio::test]
    async fn test_reseed_ignores_out_of_range() {
        let allocator = PortAllocator::new(19350, 19355);
        allocator.reseed(80, "bad").await;
        assert!(allocator.lease_of(80).await.is_none());
    }

    #[tokio::test]
    async fn test_leases_snapshot_sorted() {
        let allocator = PortAllocator::new(19360, 19365);
        allocator.reseed(19363, "b").await;
        allocator.reseed(19361, "a").await;
        let leases = allocator.leases().await;
        assert_eq!(leases.len(), 2);
        assert!(leases[0].0 < leases[1].0);
    }
}
