//! Trait seam for the gateway supervisor, enabling mock-backed tests.

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::errors::Result;

use super::port_allocator::PortAllocator;
use super::supervisor::GatewayInstance;

/// Gateway lifecycle operations the orchestrator depends on.
#[async_trait]
pub trait GatewayControl: Send + Sync {
    /// Spawn a gateway for `sid` attached to `window_name`
    async fn start(&self, sid: &str, window_name: &str) -> Result<GatewayInstance>;

    /// Look up the gateway for a session
    fn get(&self, sid: &str) -> Option<GatewayInstance>;

    /// All live gateways
    fn all(&self) -> Vec<GatewayInstance>;

    /// Stop a session's gateway and release its port
    async fn stop(&self, sid: &str) -> Result<()>;

    /// Stop every gateway
    async fn cleanup(&self);

    /// The allocator backing this supervisor
    fn port_allocator(&self) -> Arc<PortAllocator>;
}
