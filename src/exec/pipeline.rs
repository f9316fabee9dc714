// CLASSIFICATION: COMMUNITY
// Filename: pipeline.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-03-02

//! In-process post-processing pipeline.
//!
//! Per-compiler post-process stages used to be a single `bash -c
//! "cat out | stage1 | stage2"`. Here each stage is its own child with
//! stdout wired to the next stage's stdin; the asm file feeds the first
//! stage and the final stage's output is collected under the shared cap.

use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::debug;

use super::runner::{RunResult, TRUNCATED_MARKER};

/// Stream `input` through `stages`, each a whitespace-separated command
/// line. Stderr is collected from the final stage only.
pub fn run_stages(
    input: &Path,
    stages: &[String],
    timeout_ms: u64,
    max_output: usize,
) -> Result<RunResult> {
    let parsed: Vec<Vec<String>> = stages
        .iter()
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .filter(|argv: &Vec<String>| !argv.is_empty())
        .collect();
    if parsed.is_empty() {
        bail!("empty post-process pipeline");
    }

    let source = File::open(input).with_context(|| format!("open {}", input.display()))?;
    let mut children: Vec<Child> = Vec::with_capacity(parsed.len());
    let mut upstream = Some(Stdio::from(source));
    let last = parsed.len() - 1;
    for (idx, argv) in parsed.iter().enumerate() {
        let stdin = upstream.take().context("pipeline stdin already consumed")?;
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(if idx == last {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn pipeline stage {}", argv[0]))?;
        if idx < last {
            let out = child.stdout.take().context("pipeline stage stdout missing")?;
            upstream = Some(Stdio::from(out));
        }
        children.push(child);
        debug!("pipeline stage {} started: {}", idx, argv.join(" "));
    }

    let mut tail = children.pop().context("pipeline has no stages")?;
    let out_pipe = tail.stdout.take().context("pipeline stdout missing")?;
    let err_pipe = tail.stderr.take().context("pipeline stderr missing")?;
    let overflow = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let out_handle = super::runner::collect_stream(out_pipe, max_output, overflow.clone());
    let err_handle = super::runner::collect_stream(err_pipe, max_output, overflow.clone());

    let deadline = Instant::now() + Duration::from_millis(timeout_ms.max(1));
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = tail.try_wait().context("wait on pipeline")? {
            break status;
        }
        if Instant::now() >= deadline {
            timed_out = true;
            let _ = tail.kill();
            for child in &mut children {
                let _ = child.kill();
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    };
    for mut child in children {
        let _ = child.kill();
        let _ = child.wait();
    }

    let stdout = out_handle.join().unwrap_or_default();
    let stderr = err_handle.join().unwrap_or_default();
    let truncated = stdout.ends_with(TRUNCATED_MARKER) || stderr.ends_with(TRUNCATED_MARKER);
    use std::os::unix::process::ExitStatusExt;
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn stages_chain_stdout_to_stdin() {
        let dir = tempdir().expect("tempdir");
        let input = dir.path().join("asm.s");
        let mut f = File::create(&input).unwrap();
        writeln!(f, "beta\nalpha\nbeta").unwrap();
        let res = run_stages(
            &input,
            &["sort".into(), "uniq".into()],
            5_000,
            4096,
        )
        .expect("pipeline");
        assert_eq!(res.status, Some(0));
        assert_eq!(res.stdout, "alpha\nbeta\n");
    }

    #[test]
    fn empty_pipeline_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let input = dir.path().join("asm.s");
        File::create(&input).unwrap();
        assert!(run_stages(&input, &[], 1_000, 64).is_err());
    }

    #[test]
    fn bad_stage_command_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let input = dir.path().join("asm.s");
        File::create(&input).unwrap();
        let err = run_stages(&input, &["no-such-tool-xyz".into()], 1_000, 64);
        assert!(err.is_err());
    }
}
