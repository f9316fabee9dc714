// CLASSIFICATION: COMMUNITY
// Filename: runner.rs v0.9
// Author: Lukas Bower
// Date Modified: 2026-03-14

//! Timed, output-capped child process execution.
//!
//! Every child is started in its own process group so a kill reaps the
//! whole tree; compiler drivers fork helpers and killing only the direct
//! child would leave them running against a dead pipe.

use std::io::{Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, warn};

pub const TRUNCATED_MARKER: &str = "\n[Truncated]";
pub const TIMEOUT_MARKER: &str = "\nKilled - processing time exceeded";

/// Knobs for one child invocation.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Wall-clock limit; zero means unlimited.
    pub timeout_ms: u64,
    /// Per-stream byte cap before truncation kills the tree.
    pub max_output: usize,
    pub env: Vec<(String, String)>,
    /// Prepended command; the real command becomes its first argument.
    pub wrapper: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
    pub cwd: Option<PathBuf>,
    /// Replaces the process-group kill, for children that need their own
    /// teardown protocol.
    pub kill: Option<fn(libc::pid_t)>,
}

impl RunOptions {
    pub fn with_timeout(timeout_ms: u64, max_output: usize) -> Self {
        RunOptions {
            timeout_ms,
            max_output,
            ..Default::default()
        }
    }
}

/// Outcome of a child run. Spawn failure is the only `Err` path; timeouts,
/// truncation and non-zero exits all produce a value.
#[derive(Clone, Debug)]
pub struct RunResult {
    pub status: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub ok_to_cache: bool,
    pub truncated: bool,
    pub timed_out: bool,
}

/// Run `cmd argv...` under the limits in `opts`.
pub fn run(cmd: &Path, argv: &[String], opts: &RunOptions) -> Result<RunResult> {
    let mut command = match &opts.wrapper {
        Some(wrapper) => {
            let mut c = Command::new(wrapper);
            c.arg(cmd);
            c.args(argv);
            c
        }
        None => {
            let mut c = Command::new(cmd);
            c.args(argv);
            c
        }
    };
    if let Some(cwd) = &opts.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &opts.env {
        command.env(key, value);
    }
    command
        .stdin(if opts.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // New process group: the group id equals the child pid, and killpg on it
    // takes down forked helpers as well.
    unsafe {
        command.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("spawn {}", cmd.display()))?;
    let pid = child.id() as libc::pid_t;
    debug!("spawned {} pid={}", cmd.display(), pid);

    if let (Some(bytes), Some(mut sink)) = (opts.stdin.clone(), child.stdin.take()) {
        std::thread::spawn(move || {
            let _ = sink.write_all(&bytes);
        });
    }

    let overflow = Arc::new(AtomicBool::new(false));
    let stdout_pipe = child.stdout.take().context("child stdout missing")?;
    let stderr_pipe = child.stderr.take().context("child stderr missing")?;
    let out_handle = collect_stream(stdout_pipe, opts.max_output, Arc::clone(&overflow));
    let err_handle = collect_stream(stderr_pipe, opts.max_output, Arc::clone(&overflow));

    let deadline = if opts.timeout_ms > 0 {
        Some(Instant::now() + Duration::from_millis(opts.timeout_ms))
    } else {
        None
    };
    let kill = opts.kill.unwrap_or(kill_group);
    let mut timed_out = false;
    let mut killed = false;
    let status = loop {
        if let Some(status) = child.try_wait().context("wait on child")? {
            break status;
        }
        if overflow.load(Ordering::SeqCst) && !killed {
            warn!("output cap hit, killing group {}", pid);
            kill(pid);
            killed = true;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline && !killed {
                warn!("timeout after {}ms, killing group {}", opts.timeout_ms, pid);
                kill(pid);
                killed = true;
                timed_out = true;
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    let stdout = out_handle.join().unwrap_or_default();
    let mut stderr = err_handle.join().unwrap_or_default();
    let truncated = overflow.load(Ordering::SeqCst);
    if timed_out {
        stderr.push_str(TIMEOUT_MARKER);
    }

    Ok(RunResult {
        status: status.code(),
        signal: status.signal(),
        stdout,
        stderr,
        ok_to_cache: !timed_out && !truncated,
        truncated,
        timed_out,
    })
}

/// Drain one stream into a string, appending the truncation marker exactly
/// once when the cap is crossed. A cap of zero means unlimited.
pub(crate) fn collect_stream(
    mut pipe: impl Read + Send + 'static,
    cap: usize,
    overflow: Arc<AtomicBool>,
) -> std::thread::JoinHandle<String> {
    let cap = if cap == 0 { usize::MAX } else { cap };
    std::thread::spawn(move || {
        let mut collected: Vec<u8> = Vec::new();
        let mut buf = [0u8; 8192];
        let mut clipped = false;
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if collected.len() + n > cap {
                        let room = cap.saturating_sub(collected.len());
                        collected.extend_from_slice(&buf[..room]);
                        overflow.store(true, Ordering::SeqCst);
                        clipped = true;
                        break;
                    }
                    collected.extend_from_slice(&buf[..n]);
                }
            }
        }
        let mut text = String::from_utf8_lossy(&collected).into_owned();
        if clipped {
            text.push_str(TRUNCATED_MARKER);
        }
        text
    })
}

fn kill_group(pid: libc::pid_t) {
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    fn args(script: &str) -> Vec<String> {
        vec!["-c".into(), script.into()]
    }

    #[test]
    fn captures_both_streams_and_status() {
        let res = run(
            &sh(),
            &args("echo out; echo err >&2; exit 3"),
            &RunOptions::with_timeout(5_000, 1024),
        )
        .expect("run");
        assert_eq!(res.status, Some(3));
        assert_eq!(res.signal, None);
        assert_eq!(res.stdout, "out\n");
        assert_eq!(res.stderr, "err\n");
        assert!(res.ok_to_cache);
        assert!(!res.truncated);
    }

    #[test]
    fn output_cap_truncates_once_and_kills() {
        let res = run(
            &sh(),
            &args("yes xxxxxxxxxxxxxxxx | head -c 100000; sleep 30"),
            &RunOptions::with_timeout(10_000, 4096),
        )
        .expect("run");
        assert!(res.truncated);
        assert!(!res.ok_to_cache);
        assert_eq!(res.stdout.matches("[Truncated]").count(), 1);
        assert!(res.stdout.len() <= 4096 + TRUNCATED_MARKER.len());
    }

    #[test]
    fn timeout_kills_tree_and_marks_uncacheable() {
        let start = Instant::now();
        let res = run(
            &sh(),
            &args("sleep 30"),
            &RunOptions::with_timeout(100, 1024),
        )
        .expect("run");
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(res.timed_out);
        assert!(!res.ok_to_cache);
        assert_eq!(res.status, None);
        assert_eq!(res.signal, Some(libc::SIGKILL));
        assert!(res.stderr.ends_with(TIMEOUT_MARKER));
    }

    #[test]
    fn stdin_bytes_reach_the_child() {
        let res = run(
            &sh(),
            &args("cat"),
            &RunOptions {
                timeout_ms: 5_000,
                max_output: 1024,
                stdin: Some(b"hello".to_vec()),
                ..Default::default()
            },
        )
        .expect("run");
        assert_eq!(res.stdout, "hello");
    }

    #[test]
    fn wrapper_prepends_real_command() {
        let res = run(
            &PathBuf::from("/bin/echo"),
            &["a".into(), "b".into()],
            &RunOptions {
                timeout_ms: 5_000,
                max_output: 1024,
                wrapper: Some(PathBuf::from("/usr/bin/env")),
                ..Default::default()
            },
        )
        .expect("run");
        assert_eq!(res.stdout, "a b\n");
    }

    static CUSTOM_KILL_USED: AtomicBool = AtomicBool::new(false);

    fn recording_kill(pid: libc::pid_t) {
        CUSTOM_KILL_USED.store(true, Ordering::SeqCst);
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }
    }

    #[test]
    fn custom_kill_callback_replaces_group_kill() {
        let res = run(
            &sh(),
            &args("sleep 30"),
            &RunOptions {
                timeout_ms: 100,
                max_output: 1024,
                kill: Some(recording_kill),
                ..Default::default()
            },
        )
        .expect("run");
        assert!(res.timed_out);
        assert!(CUSTOM_KILL_USED.load(Ordering::SeqCst));
    }

    #[test]
    fn spawn_failure_is_a_hard_error() {
        let err = run(
            &PathBuf::from("/nonexistent/compiler"),
            &[],
            &RunOptions::with_timeout(1_000, 64),
        );
        assert!(err.is_err());
    }
}
