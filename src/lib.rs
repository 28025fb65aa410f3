pub mod api;
pub mod error;
pub mod models;
pub mod services;

pub use api::{ClusterNode, ClusterSnapshot, ClusterVm, PveApi, PveClient, VncTicket};
pub use error::GatewayError;
pub use models::{ConsoleTarget, GatewayConfig, TargetKind};
pub use services::gateway::ConsoleGateway;
pub use services::proxy_config::ProxyConfig;
pub use services::session::{SessionState, VncSession};
pub use services::session_manager::{SessionInfo, VncSessionManager};
