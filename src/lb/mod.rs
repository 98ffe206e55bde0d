/// Load balancer for replicated OpenAI-compatible model servers
///
/// This module maps logical model names to ordered replica lists and picks one
/// replica per request, either by strict round-robin or by the lowest queue
/// depth reported on each backend's metrics surface. Requests and responses,
/// streamed tokens included, are proxied through unchanged.

pub mod error;
pub mod policy;
pub mod poller;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod types;

pub use error::{ConfigError, PollError, RouterError};
pub use policy::{LoadAwareSelector, RotatingSelector, SelectionPolicy};
pub use poller::{parse_queue_depth, LoadSample, LoadTable, MetricsPoller, PollSummary};
pub use registry::EndpointRegistry;
pub use router::LoadBalancer;
pub use types::{
    EndpointRef, FailureKind, LbConfig, ModelRoute, ModelSpec, PolicyKind, ProxyResult,
    DEFAULT_QUEUE_METRIC,
};
