// Process-backed execution context — writes the binary to disk, spawns it
// with piped stdio, and pumps line channels in both directions.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{EngineHandle, EngineRuntime};

/// Spawns engine binaries as child processes under a working directory.
pub struct ProcessRuntime {
    work_dir: PathBuf,
}

impl ProcessRuntime {
    pub fn new(work_dir: &Path) -> Result<Self> {
        fs::create_dir_all(work_dir)?;
        let runtime = Self {
            work_dir: work_dir.to_path_buf(),
        };
        runtime.sweep_stale_binaries();
        Ok(runtime)
    }

    /// Remove binaries left behind by earlier sessions (crashes, or
    /// platforms where an executing file cannot be unlinked).
    fn sweep_stale_binaries(&self) {
        let entries = match fs::read_dir(&self.work_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot sweep {}: {}", self.work_dir.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("engine-") {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("failed to remove stale binary {:?}: {}", name, e);
                }
            }
        }
    }

    fn write_binary(&self, binary: &[u8]) -> Result<PathBuf> {
        let path = self.work_dir.join(format!("engine-{}", Uuid::new_v4()));
        fs::write(&path, binary)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }

        Ok(path)
    }
}

#[async_trait]
impl EngineRuntime for ProcessRuntime {
    async fn instantiate(&self, binary: Bytes) -> Result<EngineHandle> {
        let path = self.write_binary(&binary)?;

        let mut child = Command::new(&path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("failed to spawn {}: {}", path.display(), e))?;

        // On unix the running process keeps the unlinked file alive; on
        // other platforms the sweep in `new` picks it up next session.
        #[cfg(unix)]
        if let Err(e) = fs::remove_file(&path) {
            warn!("failed to remove spawned binary {}: {}", path.display(), e);
        }

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture engine stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture engine stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to capture engine stderr"))?;

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<String>();
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();

        // Stdin pump: owns the child so the process stays alive until the
        // command channel closes.
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                if stdin.write_all(command.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    warn!("engine stdin closed, dropping command: {}", command);
                    break;
                }
            }
            debug!("command channel closed, releasing engine process");
            drop(child);
        });

        // Stdout pump: forward output lines in emission order.
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if line_tx.send(line).is_err() {
                    break;
                }
            }
            debug!("engine stdout closed");
        });

        // Stderr is log-only.
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                warn!("engine stderr: {}", line);
            }
        });

        Ok(EngineHandle {
            commands: command_tx,
            lines: line_rx,
        })
    }
}
