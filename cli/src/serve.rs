//! Runs one llama-server per `models.yaml` entry until interrupted

use anyhow::Context;
use config::{ModelEntry, ModelRegistry};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::timeout;

pub const DEFAULT_SERVER_BIN: &str = "llama-server";
const HOST: &str = "127.0.0.1";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct ServerLaunch {
    pub name: String,
    pub model_path: PathBuf,
    pub port: u16,
}

impl ServerLaunch {
    pub fn new(name: &str, entry: &ModelEntry, models_dir: &Path) -> Self {
        Self {
            name: name.to_string(),
            model_path: models_dir.join(&entry.path),
            port: entry.port,
        }
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "--model".to_string(),
            self.model_path.display().to_string(),
            "--host".to_string(),
            HOST.to_string(),
            "--port".to_string(),
            self.port.to_string(),
        ]
    }
}

/// Servers to start; entries whose model file is missing are skipped
pub fn plan(registry: &ModelRegistry, models_dir: &Path) -> Vec<ServerLaunch> {
    registry
        .iter()
        .map(|(name, entry)| ServerLaunch::new(name, entry, models_dir))
        .filter(|launch| {
            let found = launch.model_path.exists();
            if !found {
                tracing::error!(
                    "model path not found for {}: {}",
                    launch.name,
                    launch.model_path.display()
                );
            }
            found
        })
        .collect()
}

pub async fn run(registry: &ModelRegistry, models_dir: &Path, server_bin: &str) -> anyhow::Result<()> {
    let launches = plan(registry, models_dir);
    if launches.is_empty() {
        anyhow::bail!("No model in {} could be started", models_dir.display());
    }

    let mut children = Vec::new();
    for launch in launches {
        tracing::info!("starting {} on port {}", launch.name, launch.port);
        let spawned = Command::new(server_bin)
            .args(launch.args())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {} for {}", server_bin, launch.name));
        match spawned {
            Ok(child) => children.push((launch.name, child)),
            Err(e) => {
                stop_all(&mut children).await;
                return Err(e);
            }
        }
    }

    println!("Serving {} models. Press Ctrl+C to stop.", children.len());
    shutdown_signal().await?;
    println!();
    tracing::info!("caught signal, shutting down");
    stop_all(&mut children).await;
    Ok(())
}

async fn stop_all(children: &mut Vec<(String, Child)>) {
    for (name, child) in children.iter_mut() {
        tracing::info!("stopping {} (pid={:?})", name, child.id());
        terminate(child);
        match timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("{} exited with {}", name, status),
            Ok(Err(e)) => tracing::warn!("waiting for {} failed: {}", name, e),
            Err(_) => {
                tracing::warn!("{} still running after {:?}, killing it", name, SHUTDOWN_GRACE);
                if let Err(e) = child.kill().await {
                    tracing::warn!("failed to kill {}: {}", name, e);
                }
            }
        }
    }
    children.clear();
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!("failed to signal pid {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!("failed to stop child: {}", e);
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
