//! Manager side of the pool: worker supervision, balancing, and proxying.

pub mod balancer;
pub mod manager;
pub mod proxy;
pub mod readiness;
pub mod restart;

pub use balancer::{LoadBalancer, LoadLease, WorkerSlot, pick_two};
pub use manager::{ClusterManager, PoolStatus, WorkerInfo, route_connection};
pub use proxy::{ProxyStats, proxy_connection, splice};
pub use readiness::{GateState, ReadinessGate};
pub use restart::{RestartPolicy, RestartTracker};
