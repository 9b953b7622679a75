//! TCP tunnels to ECS containers.
//!
//! [`TcpTunnelManager`] is the single authority for container port
//! forwarders. Each tunnel is an `aws ssm start-session` child exposing a
//! container port on `127.0.0.1:<local_port>`. It supports:
//!
//! - **Persistence** — every state transition snapshots the registry to
//!   `tunnels.json` (see [`store`]), terminated tunnels included.
//! - **Adoption** — on [`TcpTunnelManager::recover`], forwarders from a
//!   previous run whose PID still answers `signal 0` come back as `ACTIVE`
//!   with only their PID (no `wait` possible, status changes only on stop).
//! - **Restart** — terminated entries stay listed until removed;
//!   [`TcpTunnelManager::prepare_restart`] hands back their parameters.
//!
//! ## Concurrency
//!
//! The registry is behind an `RwLock`. Queries take a read lock, mutations a
//! write lock. A child's `wait()` runs in a monitor task outside the lock;
//! the monitor holds only the tunnel id and PID and re-looks-up the entry
//! when the child exits. Persistence snapshots are taken and queued under the
//! lock, so the writer sees them in lock order; the file write itself happens
//! on the store's writer task.

pub mod store;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AwsConfig;
use crate::error::TunnelError;
use crate::ports::PortClaims;
use crate::resources::ForwardTarget;
use crate::ssm::SessionCommand;
use crate::supervisor::{kill_group, process_alive, ProcessControl, SessionProcess};
use store::{TunnelRecord, TunnelStore};

/// Tunnel lifecycle status, shared by TCP and gateway tunnels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelStatus {
    Starting,
    Active,
    Error,
    Terminated,
}

impl TunnelStatus {
    /// `STARTING` or `ACTIVE`: the tunnel holds its port and a process.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Active => "ACTIVE",
            Self::Error => "ERROR",
            Self::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Snapshot of a TCP tunnel returned by queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpTunnel {
    /// `<service>-<taskId prefix>-<localPort>`.
    pub id: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub target: ForwardTarget,
    pub status: TunnelStatus,
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
    /// Forwarder PID while live, 0 otherwise.
    pub pid: u32,
    /// Whether the forwarder was adopted from a previous run.
    pub adopted: bool,
}

/// Parameters of a stopped tunnel, enough to start it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartSpec {
    pub target: ForwardTarget,
    pub remote_port: u16,
    pub local_port: u16,
}

/// Process handle held by a live entry.
enum LiveHandle {
    /// Spawned by this process; a monitor task owns the child.
    Child(ProcessControl),
    /// Survivor from a previous run, known only by PID.
    Adopted(u32),
}

impl LiveHandle {
    fn kill(&self) {
        match self {
            Self::Child(control) => control.stop(),
            Self::Adopted(pid) => {
                kill_group(*pid);
            }
        }
    }
}

struct TunnelEntry {
    tunnel: TcpTunnel,
    handle: Option<LiveHandle>,
}

/// Manages the registry of container port forwarders.
///
/// Cloneable — all clones share the same registry, store and port claims.
#[derive(Clone)]
pub struct TcpTunnelManager {
    tunnels: Arc<RwLock<HashMap<String, TunnelEntry>>>,
    aws: Arc<AwsConfig>,
    output_limit: usize,
    store: TunnelStore,
    ports: PortClaims,
}

/// Tunnel id: `<service>-<first 8 chars of task id>-<localPort>`.
pub fn tunnel_id(service_name: &str, task_id: &str, local_port: u16) -> String {
    let prefix: String = task_id.chars().take(8).collect();
    format!("{service_name}-{prefix}-{local_port}")
}

impl TcpTunnelManager {
    pub fn new(aws: AwsConfig, output_limit: usize, store: TunnelStore, ports: PortClaims) -> Self {
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            aws: Arc::new(aws),
            output_limit,
            store,
            ports,
        }
    }

    /// Load `tunnels.json` and re-adopt forwarders that survived a restart.
    ///
    /// Live entries whose PID no longer answers `signal 0` are downgraded to
    /// `TERMINATED`. Called once at startup.
    pub async fn recover(&self) {
        let records = self.store.load().await;
        if records.is_empty() {
            return;
        }

        let mut tunnels = self.tunnels.write().await;
        let mut adopted = 0;
        let mut downgraded = 0;
        for record in records {
            let mut entry = entry_from_record(record);
            let id = entry.tunnel.id.clone();
            if entry.tunnel.status.is_live() {
                let pid = entry.tunnel.pid;
                if pid > 0 && process_alive(pid) {
                    entry.tunnel.status = TunnelStatus::Active;
                    entry.tunnel.adopted = true;
                    entry.handle = Some(LiveHandle::Adopted(pid));
                    self.ports.adopt(entry.tunnel.local_port, &id);
                    adopted += 1;
                    info!(tunnel_id = %id, pid, "adopted running forwarder");
                } else {
                    entry.tunnel.status = TunnelStatus::Terminated;
                    entry.tunnel.pid = 0;
                    downgraded += 1;
                    info!(tunnel_id = %id, pid, "forwarder gone, marked terminated");
                }
            } else {
                entry.tunnel.pid = 0;
            }
            tunnels.insert(id, entry);
        }
        info!(
            path = %self.store.path().display(),
            "Recovered {} tunnel(s): {adopted} adopted, {downgraded} terminated",
            tunnels.len()
        );

        if downgraded > 0 {
            self.store.save(snapshot(&tunnels));
            drop(tunnels);
        }
    }

    /// Open a forwarder from `127.0.0.1:<local_port>` to `remote_port` in the
    /// target container. `local_port == 0` allocates a free port.
    pub async fn start(
        &self,
        target: &ForwardTarget,
        remote_port: u16,
        local_port: u16,
    ) -> Result<TcpTunnel, TunnelError> {
        let (local_port, id) = self.ports.claim(local_port, |port| {
            tunnel_id(&target.service_name, target.task_short_id(), port)
        })?;
        // Holding the port claim keeps any other start from composing this id.
        if self.tunnels.read().await.contains_key(&id) {
            self.ports.release(local_port, &id);
            return Err(TunnelError::AlreadyExists(id));
        }

        let command = SessionCommand::container_port(target, remote_port, local_port);
        let args = command.args(&self.aws);
        let spawned = SessionProcess::spawn(
            &self.aws.cli,
            &args,
            self.output_limit,
            CancellationToken::new(),
        );

        let mut tunnel = TcpTunnel {
            id: id.clone(),
            local_port,
            remote_port,
            target: target.clone(),
            status: TunnelStatus::Starting,
            started_at: Utc::now(),
            error: None,
            pid: 0,
            adopted: false,
        };

        let process = match spawned {
            Ok(p) => p,
            Err(e) => {
                warn!(tunnel_id = %id, "failed to start forwarder: {e}");
                tunnel.status = TunnelStatus::Error;
                tunnel.error = Some(e.to_string());
                self.insert(TunnelEntry {
                    tunnel,
                    handle: None,
                })
                .await;
                self.ports.release(local_port, &id);
                return Err(e);
            }
        };

        tunnel.status = TunnelStatus::Active;
        tunnel.pid = process.pid();
        let handle = LiveHandle::Child(process.control());
        info!(
            tunnel_id = %id,
            pid = tunnel.pid,
            local_port,
            remote_port,
            target = %command.target,
            "tunnel started"
        );
        self.insert(TunnelEntry {
            tunnel: tunnel.clone(),
            handle: Some(handle),
        })
        .await;
        self.spawn_monitor(id, process);
        Ok(tunnel)
    }

    /// Insert a new entry and persist.
    async fn insert(&self, entry: TunnelEntry) {
        let mut tunnels = self.tunnels.write().await;
        tunnels.insert(entry.tunnel.id.clone(), entry);
        self.store.save(snapshot(&tunnels));
        drop(tunnels);
    }

    fn spawn_monitor(&self, id: String, process: SessionProcess) {
        let manager = self.clone();
        tokio::spawn(async move {
            let pid = process.pid();
            let report = process.wait().await;
            manager.on_exit(&id, pid, report.stderr_or_os_error()).await;
        });
    }

    /// Record a forwarder exit. Only a live entry still owned by `pid`
    /// transitions; stopped or replaced entries are left alone.
    async fn on_exit(&self, id: &str, pid: u32, failure: Option<String>) {
        let mut tunnels = self.tunnels.write().await;
        let Some(entry) = tunnels.get_mut(id) else {
            return;
        };
        let owned = matches!(&entry.handle, Some(LiveHandle::Child(c)) if c.pid() == pid);
        if !owned || !entry.tunnel.status.is_live() {
            return;
        }

        entry.handle = None;
        entry.tunnel.pid = 0;
        match failure {
            Some(message) => {
                warn!(tunnel_id = %id, pid, "forwarder exited: {message}");
                entry.tunnel.status = TunnelStatus::Error;
                entry.tunnel.error = Some(message);
            }
            None => {
                info!(tunnel_id = %id, pid, "forwarder exited cleanly");
                entry.tunnel.status = TunnelStatus::Terminated;
            }
        }
        self.ports.release(entry.tunnel.local_port, id);

        self.store.save(snapshot(&tunnels));
        drop(tunnels);
    }

    /// Stop a tunnel: cancel its scope and `SIGKILL` the process group.
    /// Stopping a tunnel that is already down succeeds.
    pub async fn stop(&self, id: &str) -> Result<(), TunnelError> {
        let mut tunnels = self.tunnels.write().await;
        let entry = tunnels
            .get_mut(id)
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))?;
        if !entry.tunnel.status.is_live() {
            return Ok(());
        }
        self.terminate(entry);
        self.store.save(snapshot(&tunnels));
        drop(tunnels);
        Ok(())
    }

    /// Stop every live tunnel. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let mut tunnels = self.tunnels.write().await;
        let mut stopped = 0;
        for entry in tunnels.values_mut() {
            if entry.tunnel.status.is_live() {
                self.terminate(entry);
                stopped += 1;
            }
        }
        self.store.save(snapshot(&tunnels));
        drop(tunnels);
        if stopped > 0 {
            info!("Stopped {stopped} tunnel(s)");
        }
        stopped
    }

    fn terminate(&self, entry: &mut TunnelEntry) {
        if let Some(handle) = entry.handle.take() {
            handle.kill();
        }
        let id = &entry.tunnel.id;
        info!(tunnel_id = %id, pid = entry.tunnel.pid, "tunnel stopped");
        entry.tunnel.status = TunnelStatus::Terminated;
        entry.tunnel.pid = 0;
        self.ports.release(entry.tunnel.local_port, id);
    }

    /// Remove a stopped tunnel and return its parameters so the caller can
    /// [`start`](Self::start) it again.
    pub async fn prepare_restart(&self, id: &str) -> Result<RestartSpec, TunnelError> {
        let entry = self.remove_inactive(id).await?;
        Ok(RestartSpec {
            target: entry.tunnel.target,
            remote_port: entry.tunnel.remote_port,
            local_port: entry.tunnel.local_port,
        })
    }

    /// Drop a stopped tunnel from the registry.
    pub async fn remove_tunnel(&self, id: &str) -> Result<(), TunnelError> {
        self.remove_inactive(id).await.map(|_| ())
    }

    async fn remove_inactive(&self, id: &str) -> Result<TunnelEntry, TunnelError> {
        let mut tunnels = self.tunnels.write().await;
        match tunnels.get(id) {
            None => return Err(TunnelError::NotFound(id.to_string())),
            Some(entry) if entry.tunnel.status.is_live() => {
                return Err(TunnelError::StillActive(id.to_string()));
            }
            Some(_) => {}
        }
        let removed = tunnels.remove(id).ok_or_else(|| TunnelError::NotFound(id.to_string()))?;
        self.store.save(snapshot(&tunnels));
        drop(tunnels);
        Ok(removed)
    }

    /// Drop every `TERMINATED`/`ERROR` entry. Returns how many were removed.
    pub async fn clear_terminated(&self) -> usize {
        let mut tunnels = self.tunnels.write().await;
        let before = tunnels.len();
        tunnels.retain(|_, entry| entry.tunnel.status.is_live());
        let removed = before - tunnels.len();
        self.store.save(snapshot(&tunnels));
        drop(tunnels);
        removed
    }

    /// All tunnels, oldest first.
    pub async fn get_tunnels(&self) -> Vec<TcpTunnel> {
        let tunnels = self.tunnels.read().await;
        sorted(tunnels.values().map(|e| e.tunnel.clone()).collect())
    }

    /// `STARTING`/`ACTIVE` tunnels, oldest first.
    pub async fn get_active_tunnels(&self) -> Vec<TcpTunnel> {
        let tunnels = self.tunnels.read().await;
        sorted(
            tunnels
                .values()
                .filter(|e| e.tunnel.status.is_live())
                .map(|e| e.tunnel.clone())
                .collect(),
        )
    }

    pub async fn get_tunnel(&self, id: &str) -> Option<TcpTunnel> {
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

    /// Wait for queued persistence writes to reach disk.
    pub async fn flush(&self) {
        self.store.flush().await;
    }
}

fn sorted(mut tunnels: Vec<TcpTunnel>) -> Vec<TcpTunnel> {
    tunnels.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
    tunnels
}

fn snapshot(tunnels: &HashMap<String, TunnelEntry>) -> Vec<TunnelRecord> {
    let mut records: Vec<TunnelRecord> = tunnels.values().map(|e| record(&e.tunnel)).collect();
    records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
    records
}

fn record(tunnel: &TcpTunnel) -> TunnelRecord {
    let live = tunnel.status.is_live();
    TunnelRecord {
        id: tunnel.id.clone(),
        pid: if live { tunnel.pid } else { 0 },
        local_port: tunnel.local_port,
        remote_port: tunnel.remote_port,
        service_name: tunnel.target.service_name.clone(),
        cluster_arn: tunnel.target.cluster_arn.clone(),
        cluster_name: tunnel.target.cluster_name().to_string(),
        task_id: tunnel.target.task_id.clone(),
        container_name: tunnel.target.container_name.clone(),
        runtime_id: tunnel.target.runtime_id.clone(),
        started_at: tunnel.started_at,
        status: tunnel.status,
        error: tunnel.error.clone(),
    }
}

fn entry_from_record(record: TunnelRecord) -> TunnelEntry {
    TunnelEntry {
        tunnel: TcpTunnel {
            id: record.id,
            local_port: record.local_port,
            remote_port: record.remote_port,
            target: ForwardTarget {
                service_name: record.service_name,
                cluster_arn: record.cluster_arn,
                task_id: record.task_id,
                container_name: record.container_name,
                runtime_id: record.runtime_id,
            },
            status: record.status,
            started_at: record.started_at,
            error: record.error,
            pid: record.pid,
            adopted: false,
        },
        handle: None,
    }
}
