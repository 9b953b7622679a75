//! Error taxonomy shared by both tunnel managers.

use thiserror::Error;

/// Failures surfaced synchronously by tunnel operations.
///
/// Failures that happen after a start has returned (forwarder dies, listener
/// collapses) are never reported through this type; they are recorded on the
/// registry entry and observed by polling.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A specifically requested local port is claimed by a live tunnel.
    #[error("local port {port} is already in use by tunnel {owner}")]
    PortInUse { port: u16, owner: String },

    /// The OS refused to bind a loopback port.
    #[error("no local port available: {0}")]
    PortUnavailable(String),

    /// The cloud CLI could not be launched.
    #[error("failed to start session command: {0}")]
    SpawnFailed(String),

    /// The local proxy could not reach its upstream.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Gateway descriptor is neither a REST (v1) nor an HTTP (v2) API.
    #[error("unsupported API kind: {0}")]
    UnsupportedApiKind(String),

    /// A private gateway has no VPC endpoint that can be resolved.
    #[error("private API {0} has no resolvable VPC endpoint")]
    NoVpcEndpoint(String),

    /// A terminated or failed entry already holds this id. It has to be
    /// removed (or cleared) before the tunnel can be started again.
    #[error("tunnel {0} already exists")]
    AlreadyExists(String),

    #[error("tunnel {0} not found")]
    NotFound(String),

    /// Restart or removal requested for a tunnel that is still running.
    #[error("tunnel {0} is still active")]
    StillActive(String),

    /// The session forwarder exited before the tunnel became usable.
    #[error("session exited during startup: {0}")]
    StartupExited(String),

    /// An `execute-api` hostname is needed but no region is configured and
    /// none can be read from the invoke URL.
    #[error("AWS region is not configured")]
    MissingRegion,

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Short machine-readable code, used in log fields and CLI output.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PortInUse { .. } => "PORT_IN_USE",
            Self::PortUnavailable(_) => "PORT_UNAVAILABLE",
            Self::SpawnFailed(_) => "SPAWN_FAILED",
            Self::UpstreamUnreachable(_) => "UPSTREAM_UNREACHABLE",
            Self::UnsupportedApiKind(_) => "UNSUPPORTED_API_KIND",
            Self::NoVpcEndpoint(_) => "NO_VPC_ENDPOINT",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::NotFound(_) => "NOT_FOUND",
            Self::StillActive(_) => "STILL_ACTIVE",
            Self::StartupExited(_) => "STARTUP_EXITED",
            Self::MissingRegion => "MISSING_REGION",
            Self::InvalidUrl { .. } => "INVALID_URL",
            Self::Tls(_) => "TLS_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}
