use std::path::Path;

use tokio::{io::AsyncWriteExt, sync::mpsc};

use crate::{
    error::{Result, SupervisorError},
    instance_config,
    process_manager::ProcessManager,
};

/// Exit code for a plain supervisor restart.
pub const EXIT_RESTART: i32 = 0;
/// Exit code asking the outer runner to update the binary before restarting.
pub const EXIT_UPDATE: i32 = 42;

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct RecoveryFile {
    servers: Vec<String>,
}

/// Requests a process exit from the binary's main loop.
#[derive(Debug, Clone)]
pub struct ExitHandle {
    tx: mpsc::UnboundedSender<i32>,
}

impl ExitHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<i32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn request(&self, code: i32) {
        if self.tx.send(code).is_err() {
            tracing::warn!(code, "exit requested but nobody is listening");
        }
    }
}

/// Persist the names of online instances. Written to a temp file, synced, and renamed into place.
pub async fn checkpoint(path: &Path, names: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(SupervisorError::Checkpoint)?;
    }
    let data = serde_json::to_vec_pretty(&RecoveryFile {
        servers: names.to_vec(),
    })
    .map_err(|e| SupervisorError::Checkpoint(e.into()))?;

    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(SupervisorError::Checkpoint)?;
    file.write_all(&data)
        .await
        .map_err(SupervisorError::Checkpoint)?;
    // The process exits right after this; the contents must hit disk before the rename.
    file.sync_all().await.map_err(SupervisorError::Checkpoint)?;
    drop(file);
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(SupervisorError::Checkpoint)?;
    Ok(())
}

/// Read and delete the checkpoint. Absent or unreadable files yield an empty list.
pub async fn take(path: &Path) -> Vec<String> {
    let raw = match tokio::fs::read(path).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read recovery file");
            return Vec::new();
        }
    };
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "failed to delete recovery file");
    }

    match serde_json::from_slice::<RecoveryFile>(&raw) {
        Ok(f) => f
            .servers
            .into_iter()
            .filter(|n| {
                let ok = instance_config::validate_name(n).is_ok();
                if !ok {
                    tracing::warn!(
                        name = %instance_config::sanitize_name(n),
                        "skipping invalid name in recovery file"
                    );
                }
                ok
            })
            .collect(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid recovery file");
            Vec::new()
        }
    }
}

/// Consume the checkpoint left by a deliberate restart and relaunch its instances after the
/// configured startup delay.
pub async fn consume_on_startup(manager: &ProcessManager) -> Vec<String> {
    let names = take(&manager.config().recovery_file()).await;
    if names.is_empty() {
        return names;
    }

    tracing::info!(servers = ?names, "recovering servers from previous run");
    let delay = manager.config().recovery_delay;
    let manager = manager.clone();
    let to_start = names.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        for name in to_start {
            if let Err(e) = manager.start(&name).await {
                tracing::warn!(instance = %name, error = %e, "failed to recover server");
            }
        }
    });
    names
}

/// Checkpoint online instances, ask every running instance to stop, then exit with `code`
/// after the grace period. Nothing is stopped if the checkpoint cannot be written.
pub async fn restart_supervisor(
    manager: &ProcessManager,
    exit: &ExitHandle,
    code: i32,
) -> Result<Vec<String>> {
    let names = manager.online_names().await;
    checkpoint(&manager.config().recovery_file(), &names).await?;

    let stopped = manager.stop_all().await;
    let grace = manager.config().exit_grace;
    tracing::info!(
        servers = ?names,
        stopped,
        exit_code = code,
        grace_ms = grace.as_millis() as u64,
        "supervisor restart requested"
    );

    let exit = exit.clone();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        exit.request(code);
    });
    Ok(names)
}
