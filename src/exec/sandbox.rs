// CLASSIFICATION: COMMUNITY
// Filename: sandbox.rs v0.7
// Author: Lukas Bower
// Date Modified: 2026-04-22

//! Sandboxed execution of produced binaries.
//!
//! Two modes: `none` invokes the runner directly, `docker` runs the binary
//! inside a detached container with CPU, memory, file-descriptor and
//! network constraints. The container is removed on every exit path.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};

use super::runner::{self, RunOptions, RunResult};

const GUEST_ROOT: &str = "/home/user";
/// Generous ceiling for the docker CLI calls themselves.
const ENGINE_TIMEOUT_MS: u64 = 10_000;

static CONTAINER_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxMode {
    None,
    Docker,
}

impl SandboxMode {
    pub fn from_config(name: &str) -> Result<SandboxMode> {
        match name {
            "none" => Ok(SandboxMode::None),
            "docker" => Ok(SandboxMode::Docker),
            other => bail!("unknown sandbox type {other:?}"),
        }
    }
}

/// Run `binary argv...` under the selected sandbox.
pub fn execute(
    mode: SandboxMode,
    binary: &Path,
    argv: &[String],
    timeout_ms: u64,
    max_output: usize,
    image: &str,
) -> Result<RunResult> {
    match mode {
        SandboxMode::None => {
            let opts = RunOptions {
                timeout_ms,
                max_output,
                cwd: binary.parent().map(Path::to_path_buf),
                ..Default::default()
            };
            runner::run(binary, argv, &opts)
        }
        SandboxMode::Docker => execute_docker(binary, argv, timeout_ms, max_output, image),
    }
}

/// Removes the container when dropped, covering every exit path.
struct ContainerGuard {
    name: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let args: Vec<String> = vec!["rm".into(), "-f".into(), self.name.clone()];
        match docker(&args, ENGINE_TIMEOUT_MS) {
            Ok(res) if res.status == Some(0) => debug!("removed container {}", self.name),
            Ok(res) => warn!("container {} removal: {}", self.name, res.stderr.trim()),
            Err(err) => warn!("container {} removal failed: {err}", self.name),
        }
    }
}

fn execute_docker(
    binary: &Path,
    argv: &[String],
    timeout_ms: u64,
    max_output: usize,
    image: &str,
) -> Result<RunResult> {
    let dir = binary
        .parent()
        .ok_or_else(|| anyhow!("binary {} has no parent dir", binary.display()))?;
    let file = binary
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| anyhow!("binary {} has no file name", binary.display()))?;
    let name = format!(
        "sandbox-{}-{}",
        std::process::id(),
        CONTAINER_SEQ.fetch_add(1, Ordering::SeqCst)
    );

    let mut run_args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        name.clone(),
        "--network=none".into(),
        "--memory=128M".into(),
        "--memory-swap=128M".into(),
        "--cpu-shares=128".into(),
        "--cpu-quota=25000".into(),
        "--ulimit".into(),
        "nofile=20".into(),
        "--ulimit".into(),
        "cpu=3".into(),
        "--ulimit".into(),
        "rss=131072".into(),
        "-v".into(),
        format!("{}:{GUEST_ROOT}:ro", dir.display()),
        image.into(),
        format!("{GUEST_ROOT}/{file}"),
    ];
    run_args.extend(argv.iter().cloned());

    let started = docker(&run_args, ENGINE_TIMEOUT_MS)?;
    if started.status != Some(0) {
        bail!("sandbox start failed: {}", started.stderr.trim());
    }
    let guard = ContainerGuard { name: name.clone() };

    // docker wait blocks until the container exits; the caller's deadline
    // bounds it, and a timed-out wait kills the container before removal.
    let waited = docker(&["wait".into(), name.clone()], timeout_ms)?;
    let killed = waited.timed_out || waited.status != Some(0);
    if killed {
        let _ = docker(&["kill".into(), name.clone()], ENGINE_TIMEOUT_MS);
    }
    let exit_code = waited.stdout.trim().parse::<i32>().ok();

    let logs = docker_logs(&name, max_output)?;
    drop(guard);

    let mut stdout = logs.stdout;
    if killed {
        stdout.push_str(&format!("\n### Killed after {timeout_ms}ms"));
    }
    Ok(RunResult {
        status: if killed { None } else { exit_code },
        signal: None,
        stdout,
        stderr: logs.stderr,
        ok_to_cache: !killed,
        truncated: logs.truncated,
        timed_out: killed,
    })
}

fn docker(args: &[String], timeout_ms: u64) -> Result<RunResult> {
    runner::run(
        Path::new("docker"),
        args,
        &RunOptions::with_timeout(timeout_ms, 64 * 1024),
    )
    .context("invoke docker")
}

/// The container's log stream carries the guest's stdout and stderr on the
/// matching host streams.
fn docker_logs(name: &str, max_output: usize) -> Result<RunResult> {
    runner::run(
        Path::new("docker"),
        &["logs".into(), name.to_string()],
        &RunOptions::with_timeout(ENGINE_TIMEOUT_MS, max_output),
    )
    .context("fetch container logs")
}
