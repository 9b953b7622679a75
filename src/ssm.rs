//! `aws ssm start-session` command construction.

use crate::config::AwsConfig;
use crate::resources::ForwardTarget;

/// Forward a port on the session target itself.
pub const PORT_FORWARDING_DOCUMENT: &str = "AWS-StartPortForwardingSession";
/// Forward through the session target to another host in its network.
pub const REMOTE_HOST_DOCUMENT: &str = "AWS-StartPortForwardingSessionToRemoteHost";

/// One `start-session` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCommand {
    pub target: String,
    pub document: &'static str,
    /// JSON object passed to `--parameters`.
    pub parameters: String,
}

impl SessionCommand {
    /// Port forwarding into an ECS container.
    pub fn container_port(target: &ForwardTarget, remote_port: u16, local_port: u16) -> Self {
        Self {
            target: ecs_target(target),
            document: PORT_FORWARDING_DOCUMENT,
            parameters: format!(
                r#"{{"portNumber":["{remote_port}"],"localPortNumber":["{local_port}"]}}"#
            ),
        }
    }

    /// Port forwarding through `instance_id` to `host:remote_port`.
    pub fn remote_host(instance_id: &str, host: &str, remote_port: u16, local_port: u16) -> Self {
        let host = serde_json::Value::String(host.to_string());
        Self {
            target: instance_id.to_string(),
            document: REMOTE_HOST_DOCUMENT,
            parameters: format!(
                r#"{{"host":[{host}],"portNumber":["{remote_port}"],"localPortNumber":["{local_port}"]}}"#
            ),
        }
    }

    /// CLI arguments (without the program name). `--region` and `--profile`
    /// are appended only when configured.
    pub fn args(&self, aws: &AwsConfig) -> Vec<String> {
        let mut args = vec![
            "ssm".to_string(),
            "start-session".to_string(),
            "--target".to_string(),
            self.target.clone(),
            "--document-name".to_string(),
            self.document.to_string(),
            "--parameters".to_string(),
            self.parameters.clone(),
        ];
        if !aws.region.is_empty() {
            args.push("--region".to_string());
            args.push(aws.region.clone());
        }
        if !aws.profile.is_empty() {
            args.push("--profile".to_string());
            args.push(aws.profile.clone());
        }
        args
    }
}

/// Session target for an ECS container: `ecs:<cluster>_<taskId>_<runtimeId>`.
pub fn ecs_target(target: &ForwardTarget) -> String {
    format!(
        "ecs:{}_{}_{}",
        target.cluster_name(),
        target.task_short_id(),
        target.runtime_id
    )
}
