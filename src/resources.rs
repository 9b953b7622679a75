//! Descriptors handed to the tunnel managers by the resource browser.
//!
//! Enumerating these from the cloud account happens elsewhere; the managers
//! only consume the fields below.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;
use crate::util::short_name;

/// A container inside a running service task, the far end of a TCP tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTarget {
    pub service_name: String,
    /// Full cluster ARN (a bare cluster name is accepted too).
    pub cluster_arn: String,
    /// Task ARN or bare task id.
    pub task_id: String,
    pub container_name: String,
    /// Container runtime id, the last component of the session target.
    pub runtime_id: String,
}

impl ForwardTarget {
    /// Cluster name without the ARN prefix.
    pub fn cluster_name(&self) -> &str {
        short_name(&self.cluster_arn)
    }

    /// Task id without the ARN prefix.
    pub fn task_short_id(&self) -> &str {
        short_name(&self.task_id)
    }
}

/// API Gateway flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApiKind {
    /// REST API (v1).
    Rest,
    /// HTTP API (v2).
    Http,
}

impl fmt::Display for ApiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rest => "REST",
            Self::Http => "HTTP",
        })
    }
}

impl FromStr for ApiKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rest" | "v1" => Ok(Self::Rest),
            "http" | "v2" => Ok(Self::Http),
            _ => Err(TunnelError::UnsupportedApiKind(s.to_string())),
        }
    }
}

/// REST API endpoint configuration type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EndpointType {
    #[default]
    Regional,
    Edge,
    Private,
}

impl FromStr for EndpointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "REGIONAL" => Ok(Self::Regional),
            "EDGE" => Ok(Self::Edge),
            "PRIVATE" => Ok(Self::Private),
            other => Err(format!("unknown endpoint type: {other}")),
        }
    }
}

/// An API Gateway API, REST (v1) or HTTP (v2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum GatewayApi {
    Rest {
        id: String,
        name: String,
        #[serde(default)]
        endpoint_type: EndpointType,
        /// VPC endpoints explicitly attached to a private REST API.
        #[serde(default)]
        vpc_endpoint_ids: Vec<String>,
    },
    Http {
        id: String,
        name: String,
    },
}

impl GatewayApi {
    /// Build a descriptor from a loosely-typed kind string (`rest`/`v1`,
    /// `http`/`v2`). HTTP APIs ignore endpoint type and VPC endpoints.
    pub fn from_parts(
        kind: &str,
        id: &str,
        name: &str,
        endpoint_type: EndpointType,
        vpc_endpoint_ids: Vec<String>,
    ) -> Result<Self, TunnelError> {
        Ok(match kind.parse::<ApiKind>()? {
            ApiKind::Rest => Self::Rest {
                id: id.to_string(),
                name: name.to_string(),
                endpoint_type,
                vpc_endpoint_ids,
            },
            ApiKind::Http => Self::Http {
                id: id.to_string(),
                name: name.to_string(),
            },
        })
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Rest { id, .. } | Self::Http { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Rest { name, .. } | Self::Http { name, .. } => name,
        }
    }

    pub fn kind(&self) -> ApiKind {
        match self {
            Self::Rest { .. } => ApiKind::Rest,
            Self::Http { .. } => ApiKind::Http,
        }
    }

    pub fn endpoint_type(&self) -> EndpointType {
        match self {
            Self::Rest { endpoint_type, .. } => *endpoint_type,
            Self::Http { .. } => EndpointType::Regional,
        }
    }

    pub fn vpc_endpoint_ids(&self) -> &[String] {
        match self {
            Self::Rest {
                vpc_endpoint_ids, ..
            } => vpc_endpoint_ids,
            Self::Http { .. } => &[],
        }
    }
}

/// A deployed stage of an API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    /// Public invoke URL, e.g. `https://abc123.execute-api.eu-west-1.amazonaws.com/prod`.
    pub invoke_url: String,
}

/// Jump host reachable through Session Manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bastion {
    pub instance_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// An `execute-api` interface VPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcEndpoint {
    pub id: String,
    /// Private DNS names, most specific first.
    #[serde(default)]
    pub dns_entries: Vec<String>,
}
