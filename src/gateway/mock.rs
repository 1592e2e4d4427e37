//! In-memory gateway supervisor for tests.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::api::protocol::ServerEvent;
use crate::core::errors::{OrchestratorError, Result};

use super::port_allocator::PortAllocator;
use super::supervisor::GatewayInstance;
use super::traits::GatewayControl;

/// A gateway supervisor that leases real ports but spawns nothing.
pub struct MockGateway {
    ports: Arc<PortAllocator>,
    instances: DashMap<String, GatewayInstance>,
    events: broadcast::Sender<ServerEvent>,
    /// When set, `start` fails with `GatewayStartFailed`
    pub fail_start: Mutex<bool>,
}

impl std::fmt::Debug for MockGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockGateway")
            .field("instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}

impl MockGateway {
    /// Create a mock over the given allocator
    #[must_use]
    pub fn new(ports: Arc<PortAllocator>, events: broadcast::Sender<ServerEvent>) -> Self {
        Self {
            ports,
            instances: DashMap::new(),
            events,
            fail_start: Mutex::new(false),
        }
    }
}

#[async_trait]
impl GatewayControl for MockGateway {
    async fn start(&self, sid: &str, window_name: &str) -> Result<GatewayInstance> {
        if self.instances.contains_key(sid) {
            return Err(OrchestratorError::Conflict {
                reason: format!("gateway already running for {sid}"),
            });
        }
        if self.fail_start.lock().is_ok_and(|f| *f) {
            return Err(OrchestratorError::GatewayStartFailed {
                sid: sid.to_string(),
                reason: "mock failure".to_string(),
            });
        }

        let port = self.ports.acquire(sid).await?;
        let instance = GatewayInstance {
            sid: sid.to_string(),
            port,
            pid: None,
            window_name: window_name.to_string(),
            started_at: Utc::now(),
        };
        self.instances.insert(sid.to_string(), instance.clone());
        Ok(instance)
    }

    fn get(&self, sid: &str) -> Option<GatewayInstance> {
        self.instances.get(sid).map(|i| i.clone())
    }

    fn all(&self) -> Vec<GatewayInstance> {
        self.instances.iter().map(|i| i.clone()).collect()
    }

    async fn stop(&self, sid: &str) -> Result<()> {
        if let Some((_, instance)) = self.instances.remove(sid) {
            self.ports.release(instance.port).await;
            let _ = self.events.send(ServerEvent::GatewayStopped {
                sid: sid.to_string(),
                port: instance.port,
            });
        }
        Ok(())
    }

    async fn cleanup(&self) {
        let sids: Vec<String> = self.instances.iter().map(|i| i.key().clone()).collect();
        for sid in sids {
            let _ = self.stop(&sid).await;
        }
    }

    fn port_allocator(&self) -> Arc<PortAllocator> {
        Arc::clone(&self.ports)
    }
}
