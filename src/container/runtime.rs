//! Runtime detection and execution (`RunContainer`, pull).

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::registry::Credentials;

use super::config::ContainerConfig;

/// How long a container is given to stop gracefully after SIGTERM before
/// SIGKILL is sent (§5: "SIGTERM then SIGKILL after a small grace window").
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    pub fn binary(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

/// Probes `docker version`; if unavailable, probes `podman version` then
/// `podman info`. Absence of any runtime is only fatal at container-step
/// execution time, not at construction.
pub async fn detect_runtime() -> Result<ContainerRuntime, EngineError> {
    if probe("docker", &["version"]).await {
        return Ok(ContainerRuntime::Docker);
    }
    if probe("podman", &["version"]).await && probe("podman", &["info"]).await {
        return Ok(ContainerRuntime::Podman);
    }
    Err(EngineError::runtime(
        "no container runtime available: neither `docker` nor `podman` responded",
    ))
}

async fn probe(binary: &str, args: &[&str]) -> bool {
    Command::new(binary)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

pub struct ContainerRunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

fn mint_container_name(prefix: &str, run_id: &str) -> String {
    let unix_ts = chrono::Utc::now().timestamp();
    let suffix = &run_id[run_id.len().saturating_sub(8)..];
    format!("{prefix}-{suffix}-{unix_ts}")
}

fn build_args(name: &str, config: &ContainerConfig) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--user".to_string(),
        config.run_as_user.to_string(),
    ];
    if config.read_only_root_fs {
        args.push("--read-only".to_string());
    }
    if config.no_new_privileges {
        args.push("--security-opt".to_string());
        args.push("no-new-privileges".to_string());
    }
    args.push("--cap-drop".to_string());
    args.push("ALL".to_string());
    for cap in &config.capabilities {
        args.push("--cap-add".to_string());
        args.push(cap.clone());
    }
    args.push("--network".to_string());
    args.push(config.network.clone());
    for v in &config.volumes {
        let mode = if v.read_only { "ro" } else { "rw" };
        args.push("-v".to_string());
        args.push(format!("{}:{}:{}", v.host_path, v.container_path, mode));
    }
    for (k, val) in &config.env {
        args.push("-e".to_string());
        args.push(format!("{k}={val}"));
    }
    if let Some(cpu) = &config.cpu {
        args.push("--cpus".to_string());
        args.push(cpu.clone());
    }
    if let Some(mem) = &config.memory {
        args.push("--memory".to_string());
        args.push(mem.clone());
    }
    args.push(config.image.clone());
    if let Some(run) = &config.run {
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(run.clone());
    }
    args
}

/// Mints a unique secure container name, runs it under `cancellation`
/// (killing the process on cancellation), captures stdout/stderr, and on
/// any path attempts a best-effort removal. A non-zero exit code is
/// returned in the result, not raised as an I/O error.
pub async fn run_container(
    runtime: ContainerRuntime,
    config: &ContainerConfig,
    run_id: &str,
    cancellation: &CancellationToken,
) -> Result<ContainerRunResult, EngineError> {
    let name = mint_container_name("tako", run_id);
    let args = build_args(&name, config);

    let mut cmd = Command::new(runtime.binary());
    cmd.args(&args).kill_on_drop(true).stdout(Stdio::piped()).stderr(Stdio::piped());

    let child = cmd
        .spawn()
        .map_err(|e| EngineError::runtime(format!("failed to spawn {}: {e}", runtime.binary())))?;

    let wait_future = child.wait_with_output();
    tokio::pin!(wait_future);

    let outcome = tokio::select! {
        output = &mut wait_future => Some(output),
        _ = cancellation.cancelled() => None,
    };

    let output = match outcome {
        Some(result) => result.map_err(|e| EngineError::runtime(format!("container wait failed: {e}")))?,
        None => {
            // `wait_future` owns `child`; it is dropped here (killing the
            // process via `kill_on_drop`) before we ask the runtime itself
            // to stop the named container.
            drop(wait_future);
            terminate_gracefully(runtime, &name).await;
            best_effort_remove(runtime, &name).await;
            return Err(EngineError::Cancelled(format!("container '{name}' cancelled")));
        }
    };

    best_effort_remove(runtime, &name).await;

    Ok(ContainerRunResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

async fn terminate_gracefully(runtime: ContainerRuntime, name: &str) {
    let _ = Command::new(runtime.binary())
        .args(["stop", "--time", &KILL_GRACE_PERIOD.as_secs().to_string(), name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    let _ = Command::new(runtime.binary())
        .args(["kill", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

async fn best_effort_remove(runtime: ContainerRuntime, name: &str) {
    let result = Command::new(runtime.binary())
        .args(["rm", "-f", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        warn!(container = name, error = %e, "failed to remove container");
    }
}

/// Consults registry credentials before pulling: Docker pre-logs in via
/// `--password-stdin`; Podman passes `--creds user:pass` directly. A pull
/// failure is non-fatal: execution continues if the image is already local.
pub async fn pull_image(
    runtime: ContainerRuntime,
    image: &str,
    credentials: Option<&Credentials>,
) -> Result<(), EngineError> {
    if let (ContainerRuntime::Docker, Some(creds)) = (runtime, credentials) {
        login_docker(image, creds).await?;
    }

    let mut args = vec!["pull".to_string()];
    if let (ContainerRuntime::Podman, Some(Credentials::Password { username, password })) =
        (runtime, credentials)
    {
        use secrecy::ExposeSecret;
        args.push("--creds".to_string());
        args.push(format!("{username}:{}", password.expose_secret()));
    }
    args.push(image.to_string());

    let status = Command::new(runtime.binary())
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| EngineError::runtime(format!("failed to spawn pull: {e}")))?;

    if !status.success() {
        debug!(image, "image pull failed; continuing if already cached locally");
    }
    Ok(())
}

/// Best-effort image size lookup via `<runtime> image inspect --format
/// '{{.Size}}' <image>`, used only to size an [`crate::registry::ImageCache`]
/// entry after a pull; any failure yields `None` rather than failing the step.
pub async fn inspect_image_size(runtime: ContainerRuntime, image: &str) -> Option<u64> {
    let output = Command::new(runtime.binary())
        .args(["image", "inspect", "--format", "{{.Size}}", image])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

async fn login_docker(image: &str, creds: &Credentials) -> Result<(), EngineError> {
    use secrecy::ExposeSecret;

    let registry = image.split('/').next().unwrap_or("docker.io");
    let (username, password) = match creds {
        Credentials::Password { username, password } => (username.clone(), password.expose_secret().to_string()),
        Credentials::Token { token } => ("oauth2accesstoken".to_string(), token.expose_secret().to_string()),
    };

    use std::process::Stdio as StdStdio;
    use tokio::io::AsyncWriteExt;

    let mut child = Command::new("docker")
        .args(["login", "--username", &username, "--password-stdin", registry])
        .stdin(StdStdio::piped())
        .stdout(StdStdio::null())
        .stderr(StdStdio::null())
        .spawn()
        .map_err(|e| EngineError::runtime(format!("failed to spawn docker login: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(password.as_bytes()).await;
    }
    let _ = child.wait().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::config::VolumeMount;
    use std::collections::HashMap;

    fn sample_config() -> ContainerConfig {
        ContainerConfig {
            image: "alpine".to_string(),
            run: Some("echo hi".to_string()),
            env: HashMap::new(),
            network: "none".to_string(),
            capabilities: vec![],
            volumes: vec![VolumeMount {
                host_path: "/workspace/run".to_string(),
                container_path: "/workspace".to_string(),
                read_only: false,
            }],
            run_as_user: 1001,
            read_only_root_fs: true,
            no_new_privileges: true,
            cpu: None,
            memory: None,
        }
    }

    #[test]
    fn container_name_is_unique_looking() {
        let a = mint_container_name("tako", "exec-20260101-000000-aaaaaaaa");
        let b = mint_container_name("tako", "exec-20260101-000000-bbbbbbbb");
        assert_ne!(a, b);
        assert!(a.starts_with("tako-"));
    }

    #[test]
    fn build_args_includes_secure_defaults() {
        let args = build_args("tako-test", &sample_config());
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"--cap-drop".to_string()));
        assert!(args.iter().any(|a| a == "-v"));
        assert!(args.contains(&"alpine".to_string()));
    }
}
