//! Local HTTP endpoints for API Gateway stages.
//!
//! [`GatewayTunnelManager`] runs two kinds of tunnel, each a local HTTP
//! server on `127.0.0.1:<local_port>` in front of a [`ReverseProxy`]:
//!
//! - **Public**: the proxy talks straight to the stage's invoke URL.
//! - **Private**: an `aws ssm start-session` remote-host forwarder through a
//!   bastion exposes the gateway's port 443 on an internal loopback port, and
//!   the proxy speaks TLS to it with the gateway hostname as SNI.
//!
//! Gateway tunnels are not persisted: the stage and remote host they were
//! built for cannot be recovered from a PID alone.
//!
//! Local ports are claimed in the same [`PortClaims`] as TCP tunnels, so the
//! two managers never hand out the same port. A private tunnel also claims its
//! forwarder port.

pub mod proxy;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AwsConfig, TunnelsConfig};
use crate::error::TunnelError;
use crate::ports::PortClaims;
use crate::resources::{ApiKind, Bastion, EndpointType, GatewayApi, Stage, VpcEndpoint};
use crate::ssm::SessionCommand;
use crate::supervisor::{ProcessControl, SessionProcess};
use crate::tunnel::TunnelStatus;
use proxy::{bind_local, ProxyServer, ReverseProxy};

/// Interval between forwarder readiness probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Whether a tunnel reaches the gateway directly or through a bastion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GatewayTunnelKind {
    Public,
    Private,
}

/// Snapshot of a gateway tunnel returned by queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayTunnel {
    /// `apigw-<apiId>-<stage>-<port>` or `apigw-private-<apiId>-<stage>-<port>`.
    pub id: String,
    pub local_port: u16,
    pub api_name: String,
    pub api_id: String,
    pub api_kind: ApiKind,
    pub stage_name: String,
    /// Upstream invoke URL for public tunnels, `http://localhost:<port>` for
    /// private ones.
    pub invoke_url: String,
    pub kind: GatewayTunnelKind,
    pub bastion: Option<Bastion>,
    pub vpc_endpoint: Option<VpcEndpoint>,
    /// Gateway hostname the private proxy presents (SNI and `Host`).
    pub remote_host: Option<String>,
    /// Loopback port of the private forwarder.
    pub ssm_port: Option<u16>,
    /// Forwarder PID while live, 0 otherwise (always 0 for public tunnels).
    pub pid: u32,
    pub status: TunnelStatus,
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
}

struct GatewayEntry {
    tunnel: GatewayTunnel,
    /// Distinguishes this entry from a later one reusing the same id.
    generation: u64,
    server: Option<ProxyServer>,
    process: Option<ProcessControl>,
}

/// Runtime handles taken out of an entry, torn down after the lock is
/// released.
struct Teardown {
    server: Option<ProxyServer>,
    process: Option<ProcessControl>,
}

impl Teardown {
    /// Shut the HTTP server down (bounded by `timeout`), then kill the
    /// forwarder's process group.
    async fn run(self, timeout: Duration) {
        if let Some(server) = self.server {
            server.shutdown(timeout).await;
        }
        if let Some(process) = self.process {
            process.stop();
        }
    }
}

pub fn public_tunnel_id(api_id: &str, stage: &str, local_port: u16) -> String {
    format!("apigw-{api_id}-{stage}-{local_port}")
}

pub fn private_tunnel_id(api_id: &str, stage: &str, local_port: u16) -> String {
    format!("apigw-private-{api_id}-{stage}-{local_port}")
}

/// Claim owner recorded for a private tunnel's forwarder port.
fn forwarder_owner(id: &str) -> String {
    format!("{id}/forwarder")
}

/// Pick the hostname a private tunnel connects to. First match wins:
///
/// 1. explicit VPC endpoint ids on the API: `<apiId>-<vpce>.execute-api.<region>.amazonaws.com`
/// 2. a configured endpoint id, same form
/// 3. the first DNS entry of a discovered endpoint
/// 4. a `PRIVATE` API with none of the above fails with [`TunnelError::NoVpcEndpoint`]
/// 5. otherwise the public form `<apiId>.execute-api.<region>.amazonaws.com`
///
/// Also returns the endpoint the hostname came from, if any.
pub fn resolve_remote_host(
    api: &GatewayApi,
    region: Option<&str>,
    discovered: Option<&VpcEndpoint>,
    configured_endpoint_id: Option<&str>,
) -> Result<(String, Option<VpcEndpoint>), TunnelError> {
    let execute_api = |prefix: &str| -> Result<String, TunnelError> {
        let region = region
            .filter(|r| !r.is_empty())
            .ok_or(TunnelError::MissingRegion)?;
        Ok(format!("{prefix}.execute-api.{region}.amazonaws.com"))
    };
    let named = |endpoint_id: &str| VpcEndpoint {
        id: endpoint_id.to_string(),
        dns_entries: Vec::new(),
    };

    if let Some(endpoint_id) = api.vpc_endpoint_ids().first() {
        let host = execute_api(&format!("{}-{endpoint_id}", api.id()))?;
        return Ok((host, Some(named(endpoint_id))));
    }
    if let Some(endpoint_id) = configured_endpoint_id.filter(|id| !id.is_empty()) {
        let host = execute_api(&format!("{}-{endpoint_id}", api.id()))?;
        return Ok((host, Some(named(endpoint_id))));
    }
    if let Some(endpoint) = discovered {
        if let Some(dns) = endpoint.dns_entries.first() {
            return Ok((dns.clone(), Some(endpoint.clone())));
        }
    }
    if api.endpoint_type() == EndpointType::Private {
        return Err(TunnelError::NoVpcEndpoint(api.id().to_string()));
    }
    Ok((execute_api(api.id())?, None))
}

/// Region from an invoke URL such as
/// `https://abc123.execute-api.eu-west-1.amazonaws.com/prod`.
pub fn region_from_invoke_url(invoke_url: &str) -> Option<&str> {
    let rest = invoke_url.split_once("://").map_or(invoke_url, |(_, r)| r);
    let host = rest.split(['/', ':']).next()?;
    let mut labels = host.split('.');
    labels.find(|l| *l == "execute-api")?;
    labels.next().filter(|r| !r.is_empty())
}

/// Manages the registry of gateway tunnels.
///
/// Cloneable — all clones share the same registry and port claims.
#[derive(Clone)]
pub struct GatewayTunnelManager {
    tunnels: Arc<RwLock<HashMap<String, GatewayEntry>>>,
    generations: Arc<AtomicU64>,
    aws: Arc<AwsConfig>,
    settings: Arc<TunnelsConfig>,
    ports: PortClaims,
}

impl GatewayTunnelManager {
    pub fn new(aws: AwsConfig, settings: TunnelsConfig, ports: PortClaims) -> Self {
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
            aws: Arc::new(aws),
            settings: Arc::new(settings),
            ports,
        }
    }

    /// Serve `stage` of a public API on `127.0.0.1:<local_port>`.
    /// `local_port == 0` allocates a free port.
    pub async fn start_public_tunnel(
        &self,
        api: &GatewayApi,
        stage: &Stage,
        local_port: u16,
    ) -> Result<GatewayTunnel, TunnelError> {
        let (local_port, id) = self
            .ports
            .claim(local_port, |port| public_tunnel_id(api.id(), &stage.name, port))?;
        let generation = self
            .insert_starting(GatewayTunnel {
                id: id.clone(),
                local_port,
                api_name: api.name().to_string(),
                api_id: api.id().to_string(),
                api_kind: api.kind(),
                stage_name: stage.name.clone(),
                invoke_url: stage.invoke_url.clone(),
                kind: GatewayTunnelKind::Public,
                bastion: None,
                vpc_endpoint: None,
                remote_host: None,
                ssm_port: None,
                pid: 0,
                status: TunnelStatus::Starting,
                started_at: Utc::now(),
                error: None,
            })
            .await
            .inspect_err(|_| self.ports.release(local_port, &id))?;

        match self.launch_public(&id, generation, stage, local_port).await {
            Ok(tunnel) => {
                info!(tunnel_id = %id, local_port, upstream = %stage.invoke_url, "public gateway tunnel started");
                Ok(tunnel)
            }
            Err(e) => {
                self.record_failure(&id, generation, e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn launch_public(
        &self,
        id: &str,
        generation: u64,
        stage: &Stage,
        local_port: u16,
    ) -> Result<GatewayTunnel, TunnelError> {
        let proxy = Arc::new(ReverseProxy::public(&stage.invoke_url)?);
        let listener = bind_local(local_port).await?;
        let server = ProxyServer::spawn(listener, proxy, self.on_server_error(id, generation));
        tokio::time::sleep(self.settings.public_ready()).await;
        self.activate(id, generation, server, None).await
    }

    /// Serve `stage` of an API reachable only from inside a VPC, through a
    /// remote-host forwarder on `bastion`. See [`resolve_remote_host`] for
    /// how the upstream hostname is chosen.
    pub async fn start_private_tunnel(
        &self,
        api: &GatewayApi,
        stage: &Stage,
        bastion: &Bastion,
        discovered_endpoint: Option<&VpcEndpoint>,
        configured_endpoint_id: Option<&str>,
        local_port: u16,
    ) -> Result<GatewayTunnel, TunnelError> {
        let region = if self.aws.region.is_empty() {
            region_from_invoke_url(&stage.invoke_url)
        } else {
            Some(self.aws.region.as_str())
        };
        let (remote_host, vpc_endpoint) =
            resolve_remote_host(api, region, discovered_endpoint, configured_endpoint_id)?;

        let (local_port, id) = self
            .ports
            .claim(local_port, |port| private_tunnel_id(api.id(), &stage.name, port))?;
        let ssm_port = match self.ports.claim(0, |_| forwarder_owner(&id)) {
            Ok((port, _)) => port,
            Err(e) => {
                self.ports.release(local_port, &id);
                return Err(e);
            }
        };

        let generation = self
            .insert_starting(GatewayTunnel {
                id: id.clone(),
                local_port,
                api_name: api.name().to_string(),
                api_id: api.id().to_string(),
                api_kind: api.kind(),
                stage_name: stage.name.clone(),
                invoke_url: format!("http://localhost:{local_port}"),
                kind: GatewayTunnelKind::Private,
                bastion: Some(bastion.clone()),
                vpc_endpoint,
                remote_host: Some(remote_host.clone()),
                ssm_port: Some(ssm_port),
                pid: 0,
                status: TunnelStatus::Starting,
                started_at: Utc::now(),
                error: None,
            })
            .await
            .inspect_err(|_| {
                self.ports.release(local_port, &id);
                self.ports.release(ssm_port, &forwarder_owner(&id));
            })?;

        let launched = self
            .launch_private(&id, generation, &remote_host, ssm_port, stage, bastion, local_port)
            .await;
        match launched {
            Ok(tunnel) => {
                info!(
                    tunnel_id = %id,
                    local_port,
                    ssm_port,
                    %remote_host,
                    bastion = %bastion.instance_id,
                    "private gateway tunnel started"
                );
                Ok(tunnel)
            }
            Err(e) => {
                self.record_failure(&id, generation, e.to_string()).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn launch_private(
        &self,
        id: &str,
        generation: u64,
        remote_host: &str,
        ssm_port: u16,
        stage: &Stage,
        bastion: &Bastion,
        local_port: u16,
    ) -> Result<GatewayTunnel, TunnelError> {
        let command = SessionCommand::remote_host(&bastion.instance_id, remote_host, 443, ssm_port);
        let process = SessionProcess::spawn(
            &self.aws.cli,
            &command.args(&self.aws),
            self.settings.output_limit,
            CancellationToken::new(),
        )?;
        let control = process.control();
        let pid = process.pid();
        debug!(tunnel_id = %id, pid, ssm_port, "waiting for forwarder");

        let process = wait_for_forwarder(process, ssm_port, self.settings.private_ready_timeout()).await?;

        let prepared = async {
            let proxy = Arc::new(ReverseProxy::private(remote_host, ssm_port, &stage.name)?);
            let listener = bind_local(local_port).await?;
            Ok::<_, TunnelError>((proxy, listener))
        }
        .await;
        let (proxy, listener) = match prepared {
            Ok(ready) => ready,
            Err(e) => {
                control.stop();
                reap(process);
                return Err(e);
            }
        };

        let server = ProxyServer::spawn(listener, proxy, self.on_server_error(id, generation));
        match self.activate(id, generation, server, Some(control)).await {
            Ok(tunnel) => {
                self.spawn_monitor(id.to_string(), generation, process);
                Ok(tunnel)
            }
            Err(e) => {
                reap(process);
                Err(e)
            }
        }
    }

    /// Register a `STARTING` entry. An existing entry with the same id is
    /// never replaced.
    async fn insert_starting(&self, tunnel: GatewayTunnel) -> Result<u64, TunnelError> {
        let mut tunnels = self.tunnels.write().await;
        if tunnels.contains_key(&tunnel.id) {
            return Err(TunnelError::AlreadyExists(tunnel.id));
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        tunnels.insert(
            tunnel.id.clone(),
            GatewayEntry {
                tunnel,
                generation,
                server: None,
                process: None,
            },
        );
        Ok(generation)
    }

    /// Move a `STARTING` entry to `ACTIVE` with its handles. If it was
    /// stopped or failed meanwhile, the handles are torn down instead.
    async fn activate(
        &self,
        id: &str,
        generation: u64,
        server: ProxyServer,
        process: Option<ProcessControl>,
    ) -> Result<GatewayTunnel, TunnelError> {
        let mut tunnels = self.tunnels.write().await;
        let reason = match tunnels.get_mut(id) {
            Some(entry)
                if entry.generation == generation
                    && entry.tunnel.status == TunnelStatus::Starting =>
            {
                entry.tunnel.status = TunnelStatus::Active;
                entry.tunnel.pid = process.as_ref().map_or(0, ProcessControl::pid);
                entry.server = Some(server);
                entry.process = process;
                return Ok(entry.tunnel.clone());
            }
            Some(entry) if entry.generation == generation => entry
                .tunnel
                .error
                .clone()
                .unwrap_or_else(|| "tunnel stopped during startup".to_string()),
            _ => "tunnel removed during startup".to_string(),
        };
        drop(tunnels);

        Teardown {
            server: Some(server),
            process,
        }
        .run(self.settings.shutdown_timeout())
        .await;
        Err(TunnelError::StartupExited(reason))
    }

    /// Callback for a proxy server whose serve loop failed.
    fn on_server_error(&self, id: &str, generation: u64) -> impl FnOnce(String) + Send + 'static {
        let manager = self.clone();
        let id = id.to_string();
        move |message| {
            tokio::spawn(async move {
                manager
                    .record_failure(&id, generation, format!("proxy server failed: {message}"))
                    .await;
            });
        }
    }

    fn spawn_monitor(&self, id: String, generation: u64, process: SessionProcess) {
        let manager = self.clone();
        tokio::spawn(async move {
            let pid = process.pid();
            let report = process.wait().await;
            manager
                .on_forwarder_exit(&id, generation, pid, report.output_or_os_error())
                .await;
        });
    }

    /// Forwarder exited: tear down the proxy and record `ERROR` (with the
    /// session output) or `TERMINATED`. Stopped or replaced entries are left
    /// alone.
    async fn on_forwarder_exit(&self, id: &str, generation: u64, pid: u32, failure: Option<String>) {
        let mut tunnels = self.tunnels.write().await;
        let Some(entry) = tunnels.get_mut(id) else {
            return;
        };
        let owned = entry.generation == generation
            && entry.process.as_ref().is_some_and(|p| p.pid() == pid);
        if !owned || !entry.tunnel.status.is_live() {
            return;
        }
        // The process is already gone; only the server needs shutting down.
        entry.process = None;
        let teardown = match failure {
            Some(message) => {
                warn!(tunnel_id = %id, pid, "forwarder exited: {message}");
                self.finish(entry, TunnelStatus::Error, Some(message))
            }
            None => {
                info!(tunnel_id = %id, pid, "forwarder exited cleanly");
                self.finish(entry, TunnelStatus::Terminated, None)
            }
        };
        drop(tunnels);
        teardown.run(self.settings.shutdown_timeout()).await;
    }

    /// Mark a live entry `ERROR` and tear it down.
    async fn record_failure(&self, id: &str, generation: u64, message: String) {
        let mut tunnels = self.tunnels.write().await;
        let Some(entry) = tunnels.get_mut(id) else {
            return;
        };
        if entry.generation != generation || !entry.tunnel.status.is_live() {
            return;
        }
        warn!(tunnel_id = %id, "gateway tunnel failed: {message}");
        let teardown = self.finish(entry, TunnelStatus::Error, Some(message));
        drop(tunnels);
        teardown.run(self.settings.shutdown_timeout()).await;
    }

    /// Move an entry to a terminal status, release its ports and hand back
    /// its runtime handles.
    fn finish(&self, entry: &mut GatewayEntry, status: TunnelStatus, error: Option<String>) -> Teardown {
        let teardown = Teardown {
            server: entry.server.take(),
            process: entry.process.take(),
        };
        let tunnel = &mut entry.tunnel;
        tunnel.status = status;
        if error.is_some() {
            tunnel.error = error;
        }
        tunnel.pid = 0;
        self.ports.release(tunnel.local_port, &tunnel.id);
        if let Some(ssm_port) = tunnel.ssm_port {
            self.ports.release(ssm_port, &forwarder_owner(&tunnel.id));
        }
        teardown
    }

    /// Stop a tunnel: shut its HTTP server down, then kill the forwarder.
    /// Stopping a tunnel that is already down succeeds.
    pub async fn stop_tunnel(&self, id: &str) -> Result<(), TunnelError> {
        let mut tunnels = self.tunnels.write().await;
        let entry = tunnels
            .get_mut(id)
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))?;
        if !entry.tunnel.status.is_live() {
            return Ok(());
        }
        info!(tunnel_id = %id, "gateway tunnel stopped");
        let teardown = self.finish(entry, TunnelStatus::Terminated, None);
        drop(tunnels);
        teardown.run(self.settings.shutdown_timeout()).await;
        Ok(())
    }

    /// Stop every live tunnel. Returns how many were stopped.
    pub async fn stop_all_tunnels(&self) -> usize {
        let mut tunnels = self.tunnels.write().await;
        let teardowns: Vec<Teardown> = tunnels
            .values_mut()
            .filter(|entry| entry.tunnel.status.is_live())
            .map(|entry| self.finish(entry, TunnelStatus::Terminated, None))
            .collect();
        drop(tunnels);

        let stopped = teardowns.len();
        let timeout = self.settings.shutdown_timeout();
        for teardown in teardowns {
            teardown.run(timeout).await;
        }
        if stopped > 0 {
            info!("Stopped {stopped} gateway tunnel(s)");
        }
        stopped
    }

    /// Drop a stopped tunnel from the registry.
    pub async fn remove_tunnel(&self, id: &str) -> Result<(), TunnelError> {
        let mut tunnels = self.tunnels.write().await;
        match tunnels.get(id) {
            None => Err(TunnelError::NotFound(id.to_string())),
            Some(entry) if entry.tunnel.status.is_live() => {
                Err(TunnelError::StillActive(id.to_string()))
            }
            Some(_) => {
                tunnels.remove(id);
                Ok(())
            }
        }
    }

    /// Drop every `TERMINATED`/`ERROR` entry. Returns how many were removed.
    pub async fn clear_terminated(&self) -> usize {
        let mut tunnels = self.tunnels.write().await;
        let before = tunnels.len();
        tunnels.retain(|_, entry| entry.tunnel.status.is_live());
        before - tunnels.len()
    }

    /// All tunnels, oldest first.
    pub async fn get_tunnels(&self) -> Vec<GatewayTunnel> {
        let tunnels = self.tunnels.read().await;
        sorted(tunnels.values().map(|e| e.tunnel.clone()).collect())
    }

    /// `STARTING`/`ACTIVE` tunnels, oldest first.
    pub async fn get_active_tunnels(&self) -> Vec<GatewayTunnel> {
        let tunnels = self.tunnels.read().await;
        sorted(
            tunnels
                .values()
                .filter(|e| e.tunnel.status.is_live())
                .map(|e| e.tunnel.clone())
                .collect(),
        )
    }

    pub async fn get_tunnel(&self, id: &str) -> Option<GatewayTunnel> {
        self.tunnels.read().await.get(id).map(|e| e.tunnel.clone())
    }

    pub async fn active_count(&self) -> usize {
        self.tunnels
            .read()
            .await
            .values()
            .filter(|e| e.tunnel.status.is_live())
            .count()
    }
}

/// Probe the forwarder port until it accepts a connection or `timeout`
/// passes. Fails if the session exits first; a timeout is not an error since
/// the forwarder may only open the port once the session is up.
async fn wait_for_forwarder(
    mut process: SessionProcess,
    port: u16,
    timeout: Duration,
) -> Result<SessionProcess, TunnelError> {
    let deadline = Instant::now() + timeout;
    loop {
        if process.has_exited() {
            let report = process.wait().await;
            return Err(TunnelError::StartupExited(
                report
                    .output_or_os_error()
                    .unwrap_or_else(|| "session ended before the forwarder was ready".to_string()),
            ));
        }
        if TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_ok() {
            debug!(port, "forwarder accepting connections");
            return Ok(process);
        }
        if Instant::now() >= deadline {
            debug!(port, "forwarder readiness probe timed out, continuing");
            return Ok(process);
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

/// Collect a killed child in the background.
fn reap(process: SessionProcess) {
    tokio::spawn(process.wait());
}

fn sorted(mut tunnels: Vec<GatewayTunnel>) -> Vec<GatewayTunnel> {
    tunnels.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
    tunnels
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::{header, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    use crate::supervisor::process_alive;

    const REGION: &str = "eu-west-1";

    fn fake_cli(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-aws");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn manager(cli: &str, region: &str) -> (GatewayTunnelManager, PortClaims) {
        let aws = AwsConfig {
            cli: cli.to_string(),
            profile: String::new(),
            region: region.to_string(),
        };
        let settings = TunnelsConfig {
            public_ready_ms: 20,
            private_ready_timeout_ms: 500,
            shutdown_timeout_secs: 1,
            ..TunnelsConfig::default()
        };
        let ports = PortClaims::new();
        (GatewayTunnelManager::new(aws, settings, ports.clone()), ports)
    }

    fn rest_api(endpoint_type: EndpointType, vpc_endpoint_ids: &[&str]) -> GatewayApi {
        GatewayApi::Rest {
            id: "abc".to_string(),
            name: "orders".to_string(),
            endpoint_type,
            vpc_endpoint_ids: vpc_endpoint_ids.iter().map(ToString::to_string).collect(),
        }
    }

    fn stage(invoke_url: &str) -> Stage {
        Stage {
            name: "prod".to_string(),
            invoke_url: invoke_url.to_string(),
        }
    }

    fn bastion() -> Bastion {
        Bastion {
            instance_id: "i-0123456789abcdef0".to_string(),
            name: Some("bastion".to_string()),
        }
    }

    /// Upstream that answers with the `Host` header and URI it received.
    async fn echo_upstream() -> u16 {
        async fn echo(req: Request) -> String {
            let host = req
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            format!("{host} {}", req.uri())
        }
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().fallback(echo)).await.unwrap();
        });
        port
    }

    /// Self-signed TLS server standing in for the gateway behind a
    /// forwarder. Reports the SNI and request head of its first connection.
    async fn tls_upstream() -> (u16, oneshot::Receiver<(Option<String>, String)>) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["gateway.test".to_string()]).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(stream).await.unwrap();
            let sni = tls.get_ref().1.server_name().map(str::to_string);
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = tls.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            tls.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                .await
                .unwrap();
            let _ = tls.shutdown().await;
            let _ = tx.send((sni, String::from_utf8_lossy(&head).into_owned()));
        });
        (port, rx)
    }

    async fn get(url: &str) -> (StatusCode, String) {
        let client = Client::builder(TokioExecutor::new()).build_http::<Body>();
        let response = client.get(url.parse().unwrap()).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    async fn wait_for_status(
        manager: &GatewayTunnelManager,
        id: &str,
        status: TunnelStatus,
    ) -> GatewayTunnel {
        for _ in 0..100 {
            if let Some(t) = manager.get_tunnel(id).await {
                if t.status == status {
                    return t;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("tunnel {id} never reached {status}");
    }

    #[test]
    fn test_resolve_explicit_endpoint_ids_win() {
        let api = rest_api(EndpointType::Private, &["vpce-1", "vpce-2"]);
        let discovered = VpcEndpoint {
            id: "vpce-9".to_string(),
            dns_entries: vec!["vpce-9.example".to_string()],
        };
        let (host, endpoint) =
            resolve_remote_host(&api, Some(REGION), Some(&discovered), Some("vpce-123")).unwrap();
        assert_eq!(host, "abc-vpce-1.execute-api.eu-west-1.amazonaws.com");
        assert_eq!(endpoint.unwrap().id, "vpce-1");
    }

    #[test]
    fn test_resolve_configured_endpoint() {
        let api = rest_api(EndpointType::Private, &[]);
        let (host, endpoint) =
            resolve_remote_host(&api, Some(REGION), None, Some("vpce-123")).unwrap();
        assert_eq!(host, "abc-vpce-123.execute-api.eu-west-1.amazonaws.com");
        assert_eq!(endpoint.unwrap().id, "vpce-123");
    }

    #[test]
    fn test_resolve_discovered_dns() {
        let api = rest_api(EndpointType::Private, &[]);
        let discovered = VpcEndpoint {
            id: "vpce-9".to_string(),
            dns_entries: vec![
                "vpce-9-abcd.execute-api.eu-west-1.vpce.amazonaws.com".to_string(),
                "vpce-9-abcd-eu-west-1a.execute-api.eu-west-1.vpce.amazonaws.com".to_string(),
            ],
        };
        let (host, endpoint) = resolve_remote_host(&api, None, Some(&discovered), None).unwrap();
        assert_eq!(host, "vpce-9-abcd.execute-api.eu-west-1.vpce.amazonaws.com");
        assert_eq!(endpoint, Some(discovered));
    }

    #[test]
    fn test_resolve_private_without_endpoint_fails() {
        let api = rest_api(EndpointType::Private, &[]);
        let empty = VpcEndpoint {
            id: "vpce-9".to_string(),
            dns_entries: Vec::new(),
        };
        let err = resolve_remote_host(&api, Some(REGION), Some(&empty), Some("")).unwrap_err();
        assert_eq!(err.code(), "NO_VPC_ENDPOINT");
    }

    #[test]
    fn test_resolve_regional_falls_back_to_public_host() {
        let api = rest_api(EndpointType::Regional, &[]);
        let (host, endpoint) = resolve_remote_host(&api, Some(REGION), None, None).unwrap();
        assert_eq!(host, "abc.execute-api.eu-west-1.amazonaws.com");
        assert!(endpoint.is_none());

        let http = GatewayApi::Http {
            id: "h1".to_string(),
            name: "events".to_string(),
        };
        let (host, _) = resolve_remote_host(&http, Some(REGION), None, None).unwrap();
        assert_eq!(host, "h1.execute-api.eu-west-1.amazonaws.com");

        let err = resolve_remote_host(&http, None, None, None).unwrap_err();
        assert_eq!(err.code(), "MISSING_REGION");
    }

    #[test]
    fn test_region_from_invoke_url() {
        assert_eq!(
            region_from_invoke_url("https://abc.execute-api.us-east-2.amazonaws.com/prod"),
            Some("us-east-2")
        );
        assert_eq!(region_from_invoke_url("http://127.0.0.1:9000/prod"), None);
    }

    #[test]
    fn test_tunnel_ids() {
        assert_eq!(public_tunnel_id("abc", "prod", 8080), "apigw-abc-prod-8080");
        assert_eq!(
            private_tunnel_id("abc", "prod", 8080),
            "apigw-private-abc-prod-8080"
        );
    }

    #[tokio::test]
    async fn test_public_tunnel_proxies_with_stage_prefix() {
        let upstream = echo_upstream().await;
        let (manager, ports) = manager("aws", "");
        let api = GatewayApi::Http {
            id: "h1".to_string(),
            name: "events".to_string(),
        };
        let stage = stage(&format!("http://127.0.0.1:{upstream}/prod"));

        let tunnel = manager.start_public_tunnel(&api, &stage, 0).await.unwrap();
        assert_eq!(tunnel.status, TunnelStatus::Active);
        assert_eq!(tunnel.kind, GatewayTunnelKind::Public);
        assert_eq!(tunnel.id, public_tunnel_id("h1", "prod", tunnel.local_port));
        assert_eq!(ports.holder(tunnel.local_port), Some(tunnel.id.clone()));
        assert_eq!(manager.active_count().await, 1);

        let base = format!("http://127.0.0.1:{}", tunnel.local_port);
        let (status, body) = get(&format!("{base}/orders?limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, format!("127.0.0.1:{upstream} /prod/orders?limit=5"));

        let (_, body) = get(&format!("{base}/prod/orders")).await;
        assert_eq!(body, format!("127.0.0.1:{upstream} /prod/orders"));

        manager.stop_tunnel(&tunnel.id).await.unwrap();
        let stopped = manager.get_tunnel(&tunnel.id).await.unwrap();
        assert_eq!(stopped.status, TunnelStatus::Terminated);
        assert_eq!(manager.active_count().await, 0);
        assert!(ports.holder(tunnel.local_port).is_none());
        assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, tunnel.local_port))
            .await
            .is_err());

        // Already stopped.
        manager.stop_tunnel(&tunnel.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_public_port_claimed_by_tcp_tunnel() {
        let (manager, ports) = manager("aws", "");
        let (port, _) = ports.claim(0, |p| format!("api-abcdef01-{p}")).unwrap();
        let api = rest_api(EndpointType::Regional, &[]);
        let err = manager
            .start_public_tunnel(&api, &stage("http://127.0.0.1:1/prod"), port)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PORT_IN_USE");
        assert!(manager.get_tunnels().await.is_empty());
    }

    #[tokio::test]
    async fn test_public_bind_failure_records_error() {
        let (manager, ports) = manager("aws", "");
        let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = squatter.local_addr().unwrap().port();
        let api = rest_api(EndpointType::Regional, &[]);

        let err = manager
            .start_public_tunnel(&api, &stage("http://127.0.0.1:1/prod"), port)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PORT_UNAVAILABLE");

        let tunnels = manager.get_tunnels().await;
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].status, TunnelStatus::Error);
        assert!(tunnels[0].error.is_some());
        assert!(ports.holder(port).is_none());

        // The failed entry is kept until removed, even once the port frees up.
        drop(squatter);
        let err = manager
            .start_public_tunnel(&api, &stage("http://127.0.0.1:1/prod"), port)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_EXISTS");
        let kept = manager.get_tunnel(&tunnels[0].id).await.unwrap();
        assert_eq!(kept.status, TunnelStatus::Error);
        assert_eq!(kept.error, tunnels[0].error);
        assert!(ports.holder(port).is_none());

        manager.remove_tunnel(&tunnels[0].id).await.unwrap();
        let tunnel = manager
            .start_public_tunnel(&api, &stage("http://127.0.0.1:1/prod"), port)
            .await
            .unwrap();
        assert_eq!(tunnel.status, TunnelStatus::Active);
        manager.stop_all_tunnels().await;
    }

    #[tokio::test]
    async fn test_private_tunnel_with_configured_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args");
        let cli = fake_cli(
            dir.path(),
            &format!("printf '%s\\n' \"$@\" > {}\nexec sleep 30", args_file.display()),
        );
        let (manager, ports) = manager(&cli.display().to_string(), REGION);
        let api = rest_api(EndpointType::Private, &[]);
        let stage = stage("https://abc.execute-api.eu-west-1.amazonaws.com/prod");

        let tunnel = manager
            .start_private_tunnel(&api, &stage, &bastion(), None, Some("vpce-123"), 0)
            .await
            .unwrap();
        let remote_host = "abc-vpce-123.execute-api.eu-west-1.amazonaws.com";
        assert_eq!(tunnel.status, TunnelStatus::Active);
        assert_eq!(tunnel.kind, GatewayTunnelKind::Private);
        assert_eq!(tunnel.remote_host.as_deref(), Some(remote_host));
        assert_eq!(tunnel.invoke_url, format!("http://localhost:{}", tunnel.local_port));
        assert_eq!(tunnel.vpc_endpoint.as_ref().unwrap().id, "vpce-123");
        assert!(tunnel.pid > 0);
        let ssm_port = tunnel.ssm_port.unwrap();
        assert!(ports.holder(ssm_port).is_some());

        let args = std::fs::read_to_string(&args_file).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(args[..6], ["ssm", "start-session", "--target", "i-0123456789abcdef0", "--document-name", "AWS-StartPortForwardingSessionToRemoteHost"]);
        let params: serde_json::Value = serde_json::from_str(args[7]).unwrap();
        assert_eq!(params["host"][0], remote_host);
        assert_eq!(params["portNumber"][0], "443");
        assert_eq!(params["localPortNumber"][0], ssm_port.to_string());
        assert_eq!(args[8..], ["--region", REGION]);

        // Nothing listens behind the fake forwarder.
        let (status, _) = get(&format!("http://127.0.0.1:{}/users", tunnel.local_port)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        manager.stop_tunnel(&tunnel.id).await.unwrap();
        assert_eq!(
            manager.get_tunnel(&tunnel.id).await.unwrap().status,
            TunnelStatus::Terminated
        );
        assert!(ports.holder(ssm_port).is_none());
        assert!(ports.holder(tunnel.local_port).is_none());
        for _ in 0..50 {
            if !process_alive(tunnel.pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!process_alive(tunnel.pid));
    }

    #[tokio::test]
    async fn test_private_proxy_presents_remote_host_over_tls() {
        let api = rest_api(EndpointType::Private, &[]);
        let (remote_host, _) = resolve_remote_host(&api, Some(REGION), None, Some("vpce-123")).unwrap();
        assert_eq!(remote_host, "abc-vpce-123.execute-api.eu-west-1.amazonaws.com");

        let (forwarder_port, seen) = tls_upstream().await;
        let proxy = Arc::new(ReverseProxy::private(&remote_host, forwarder_port, "prod").unwrap());
        let listener = bind_local(0).await.unwrap();
        let local_port = listener.local_addr().unwrap().port();
        let server = ProxyServer::spawn(listener, proxy, |_| {});

        let (status, body) = get(&format!("http://127.0.0.1:{local_port}/users")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");

        let (sni, head) = seen.await.unwrap();
        assert_eq!(sni.as_deref(), Some(remote_host.as_str()));
        assert!(head.starts_with("GET /prod/users HTTP/1.1\r\n"), "{head}");
        assert!(
            head.to_ascii_lowercase()
                .contains(&format!("\r\nhost: {remote_host}\r\n")),
            "{head}"
        );

        server.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_private_session_failing_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            dir.path(),
            "echo 'An error occurred (TargetNotConnected)' >&2\nexit 255",
        );
        let (manager, ports) = manager(&cli.display().to_string(), REGION);
        let api = rest_api(EndpointType::Regional, &[]);

        let err = manager
            .start_private_tunnel(&api, &stage("https://abc.execute-api.eu-west-1.amazonaws.com/prod"), &bastion(), None, None, 0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STARTUP_EXITED");
        assert!(err.to_string().contains("TargetNotConnected"));

        let tunnels = manager.get_tunnels().await;
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].status, TunnelStatus::Error);
        assert!(tunnels[0].error.as_deref().unwrap().contains("TargetNotConnected"));
        assert!(ports.claimed().is_empty());
    }

    #[tokio::test]
    async fn test_private_forwarder_exit_marks_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), "sleep 1.5\necho 'session lost' >&2\nexit 1");
        let (manager, ports) = manager(&cli.display().to_string(), "");
        let api = rest_api(EndpointType::Regional, &[]);

        let tunnel = manager
            .start_private_tunnel(&api, &stage("https://abc.execute-api.eu-west-1.amazonaws.com/prod"), &bastion(), None, None, 0)
            .await
            .unwrap();
        assert_eq!(
            tunnel.remote_host.as_deref(),
            Some("abc.execute-api.eu-west-1.amazonaws.com")
        );

        let failed = wait_for_status(&manager, &tunnel.id, TunnelStatus::Error).await;
        assert_eq!(failed.error.as_deref(), Some("session lost"));
        assert_eq!(failed.pid, 0);
        assert!(ports.claimed().is_empty());
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_private_api_without_endpoint_is_rejected() {
        let (manager, ports) = manager("aws", REGION);
        let api = rest_api(EndpointType::Private, &[]);
        let err = manager
            .start_private_tunnel(&api, &stage("https://abc.execute-api.eu-west-1.amazonaws.com/prod"), &bastion(), None, None, 0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_VPC_ENDPOINT");
        assert!(manager.get_tunnels().await.is_empty());
        assert!(ports.claimed().is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let upstream = echo_upstream().await;
        let (manager, _) = manager("aws", "");
        let api = rest_api(EndpointType::Regional, &[]);
        let stage = stage(&format!("http://127.0.0.1:{upstream}/prod"));
        let first = manager.start_public_tunnel(&api, &stage, 0).await.unwrap();
        let second = manager.start_public_tunnel(&api, &stage, 0).await.unwrap();

        let err = manager.remove_tunnel(&first.id).await.unwrap_err();
        assert_eq!(err.code(), "STILL_ACTIVE");
        let err = manager.remove_tunnel("apigw-missing").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        manager.stop_tunnel(&first.id).await.unwrap();
        manager.remove_tunnel(&first.id).await.unwrap();
        assert!(manager.get_tunnel(&first.id).await.is_none());

        assert_eq!(manager.stop_all_tunnels().await, 1);
        assert_eq!(manager.clear_terminated().await, 1);
        assert!(manager.get_tunnel(&second.id).await.is_none());
        assert!(manager.get_active_tunnels().await.is_empty());
    }
}
