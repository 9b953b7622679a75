//! On-disk registry of TCP tunnels (`~/.vaws/tunnels.json`).
//!
//! The file is a pretty-printed JSON array with one element per tunnel,
//! terminated ones included so they can be restarted after a relaunch. Writes
//! are queued on an unbounded channel and applied by a single background
//! task, so callers never block on file I/O and writes land in order. When
//! several snapshots are queued only the newest one is written.
//!
//! Persistence is best-effort: failures are logged and dropped.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::TunnelStatus;

/// File name inside the state directory.
pub const TUNNELS_FILE: &str = "tunnels.json";

/// Persisted form of one TCP tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub id: String,
    /// Forwarder PID while `ACTIVE`/`STARTING`, 0 otherwise.
    #[serde(default)]
    pub pid: u32,
    pub local_port: u16,
    pub remote_port: u16,
    pub service_name: String,
    pub cluster_arn: String,
    pub cluster_name: String,
    pub task_id: String,
    pub container_name: String,
    /// Container runtime id; absent in files written by older versions.
    #[serde(default)]
    pub runtime_id: String,
    pub started_at: DateTime<Utc>,
    pub status: TunnelStatus,
    #[serde(default)]
    pub error: Option<String>,
}

enum StoreCommand {
    Save(Vec<TunnelRecord>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the tunnel file and its background writer.
///
/// Cloneable — all clones feed the same writer task.
#[derive(Clone)]
pub struct TunnelStore {
    path: PathBuf,
    tx: mpsc::UnboundedSender<StoreCommand>,
}

impl TunnelStore {
    /// Open the store rooted at `state_dir` and spawn its writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(state_dir: &Path) -> Self {
        let path = state_dir.join(TUNNELS_FILE);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(path.clone(), rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all records. A missing file is an empty registry; an unreadable
    /// or corrupt one is logged and treated as empty.
    pub async fn load(&self) -> Vec<TunnelRecord> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), "failed to read tunnel file: {e}");
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<TunnelRecord>>(&content) {
            Ok(mut records) => {
                for record in &mut records {
                    if record.error.as_deref() == Some("") {
                        record.error = None;
                    }
                }
                records
            }
            Err(e) => {
                warn!(path = %self.path.display(), "ignoring corrupt tunnel file: {e}");
                Vec::new()
            }
        }
    }

    /// Queue a full snapshot for writing. An empty snapshot deletes the file.
    pub fn save(&self, records: Vec<TunnelRecord>) {
        if self.tx.send(StoreCommand::Save(records)).is_err() {
            error!("tunnel store writer is gone, snapshot dropped");
        }
    }

    /// Wait until every snapshot queued before this call has been written.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(StoreCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Background task that drains snapshots and writes the newest one.
async fn writer_task(path: PathBuf, mut rx: mpsc::UnboundedReceiver<StoreCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut latest = None;
        let mut acks = Vec::new();
        match cmd {
            StoreCommand::Save(records) => latest = Some(records),
            StoreCommand::Flush(ack) => acks.push(ack),
        }
        // Batch: collapse everything already queued into one write
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                StoreCommand::Save(records) => latest = Some(records),
                StoreCommand::Flush(ack) => acks.push(ack),
            }
        }
        if let Some(records) = latest {
            if let Err(e) = write_records(&path, &records).await {
                error!(path = %path.display(), "failed to persist tunnels: {e}");
            }
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }
}

/// Write `records` atomically (temp file + rename), or delete the file when
/// there is nothing to keep.
async fn write_records(path: &Path, records: &[TunnelRecord]) -> std::io::Result<()> {
    if records.is_empty() {
        return match fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "tunnel registry empty, file removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
    }

    if let Some(dir) = path.parent() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)
            .await?;
    }

    let json = serde_json::to_vec_pretty(records).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(&tmp)
        .await?;
    file.write_all(&json).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), count = records.len(), "tunnels persisted");
    Ok(())
}
