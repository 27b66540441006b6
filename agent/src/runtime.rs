//! Container runtime seam: pull/run/stop images with GPU and host networking.
//! Production uses the Docker CLI; tests plug in a mock.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::AgentError;

#[derive(Clone, Debug)]
pub struct RunSpec {
    pub image: String,
    /// `linux/amd64` or `linux/arm64`; pulls must match the host.
    pub platform: String,
    pub name: String,
    pub env: Vec<(String, String)>,
    /// host path → container path
    pub mounts: Vec<(PathBuf, String)>,
    pub gpu: bool,
    pub host_network: bool,
    pub args: Vec<String>,
}

/// A running container's log lines, streamed as they appear.
pub type LogStream = mpsc::Receiver<String>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &str, platform: &str) -> Result<(), AgentError>;
    /// Starts the container and returns its id.
    async fn run(&self, spec: &RunSpec) -> Result<String, AgentError>;
    /// Follows logs until the container exits.
    async fn logs(&self, container_id: &str) -> Result<LogStream, AgentError>;
    /// Blocks until exit; returns the exit code.
    async fn wait(&self, container_id: &str) -> Result<i64, AgentError>;
    async fn stop(&self, container_id: &str) -> Result<(), AgentError>;
}

/// Docker CLI wrapper. Keeps to the stable command surface.
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: std::env::var("KITT_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string()),
        }
    }

    async fn docker(&self, args: &[String]) -> Result<String, AgentError> {
        let out = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| AgentError::Runtime(format!("{} {:?}: {e}", self.binary, args)))?;
        if !out.status.success() {
            return Err(AgentError::Runtime(format!(
                "{} {:?}: {}",
                self.binary,
                args,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull(&self, image: &str, platform: &str) -> Result<(), AgentError> {
        self.docker(&[
            "pull".into(),
            "--platform".into(),
            platform.into(),
            image.into(),
        ])
        .await?;
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> Result<String, AgentError> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            spec.name.clone(),
            "--platform".into(),
            spec.platform.clone(),
        ];
        if spec.gpu {
            args.push("--gpus".into());
            args.push("all".into());
        }
        if spec.host_network {
            args.push("--network".into());
            args.push("host".into());
        }
        for (key, value) in &spec.env {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }
        for (host, container) in &spec.mounts {
            args.push("--volume".into());
            args.push(format!("{}:{container}", host.display()));
        }
        args.push(spec.image.clone());
        args.extend(spec.args.iter().cloned());
        self.docker(&args).await
    }

    async fn logs(&self, container_id: &str) -> Result<LogStream, AgentError> {
        let mut child = Command::new(&self.binary)
            .args(["logs", "--follow", container_id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AgentError::Runtime(format!("docker logs: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Runtime("docker logs: no stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Runtime("docker logs: no stderr".into()))?;

        let (tx, rx) = mpsc::channel(256);
        let tx_err = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx_err.send(line).await.is_err() {
                    break;
                }
            }
            let _ = child.wait().await;
        });
        Ok(rx)
    }

    async fn wait(&self, container_id: &str) -> Result<i64, AgentError> {
        let out = self.docker(&["wait".into(), container_id.into()]).await?;
        out.trim()
            .parse()
            .map_err(|e| AgentError::Runtime(format!("docker wait output {out:?}: {e}")))
    }

    async fn stop(&self, container_id: &str) -> Result<(), AgentError> {
        self.docker(&["stop".into(), container_id.into()]).await?;
        Ok(())
    }
}

/// Scripted runtime for tests: plays back log lines and an exit code.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    pub struct MockRuntime {
        pub log_lines: Vec<String>,
        pub exit_code: i64,
        pub stopped: AtomicBool,
        pub pulled: Mutex<Vec<String>>,
    }

    impl MockRuntime {
        pub fn new(log_lines: Vec<String>, exit_code: i64) -> Self {
            Self {
                log_lines,
                exit_code,
                stopped: AtomicBool::new(false),
                pulled: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn pull(&self, image: &str, platform: &str) -> Result<(), AgentError> {
            self.pulled
                .lock()
                .unwrap()
                .push(format!("{image}@{platform}"));
            Ok(())
        }

        async fn run(&self, spec: &RunSpec) -> Result<String, AgentError> {
            Ok(format!("mock-{}", spec.name))
        }

        async fn logs(&self, _container_id: &str) -> Result<LogStream, AgentError> {
            let (tx, rx) = mpsc::channel(256);
            let lines = self.log_lines.clone();
            tokio::spawn(async move {
                for line in lines {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }

        async fn wait(&self, _container_id: &str) -> Result<i64, AgentError> {
            Ok(self.exit_code)
        }

        async fn stop(&self, _container_id: &str) -> Result<(), AgentError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}
