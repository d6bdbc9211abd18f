//! CONNECT ingress, relay and request routing

pub mod http_client;
pub mod policy;
pub mod router;
pub mod server;
pub mod sidecar;
pub mod tunnel;

pub use http_client::HttpClient;
pub use policy::{Decision, HostPattern, InterceptPolicy};
pub use router::{Origin, RequestRouter, RoutingRule};
pub use server::ConnectAcceptor;
pub use sidecar::{run_tunnel, Sidecar};
