/// In-memory supervisor for tests.
pub mod mock;
/// Bounded port pool for gateway processes.
pub mod port_allocator;
/// Web-terminal process supervisor.
pub mod supervisor;
/// Trait seam for dependency injection.
pub mod traits;

pub use mock::MockGateway;
pub use port_allocator::PortAllocator;
pub use supervisor::{GatewayInstance, GatewaySupervisor};
pub use traits::GatewayControl;
