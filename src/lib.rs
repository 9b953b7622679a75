#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! vaws tunnel library — local access to private cloud resources.
//!
//! This library exposes the building blocks behind the `vaws` console:
//! - `tunnel` — SSM port forwarders to ECS containers, persisted and re-adopted
//! - `gateway` — local reverse proxies for public and VPC-private API Gateway stages
//! - `supervisor` — process-group spawning, output capture, group kill
//! - `ports` — loopback port allocation and the cross-manager claim registry
//! - `ssm` — `aws ssm start-session` argv construction
//! - `resources` — descriptors for the things tunnels point at
//! - `config` — configuration loading
//! - `error` — error taxonomy

pub mod config;
pub mod error;
pub mod gateway;
pub mod ports;
pub mod resources;
pub mod ssm;
pub mod supervisor;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::TunnelError;
pub use gateway::{GatewayTunnel, GatewayTunnelManager};
pub use ports::PortClaims;
pub use tunnel::store::TunnelStore;
pub use tunnel::{TcpTunnel, TcpTunnelManager, TunnelStatus};
