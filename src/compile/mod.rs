// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v1.4
// Author: Lukas Bower
// Date Modified: 2026-07-02

//! The compile pipeline.
//!
//! One request flows through: request screens, binary-mode stub injection,
//! fingerprint and cache admission, the bounded enqueue lane, workspace
//! materialization, the main compiler invocation (with the AST probe in
//! parallel), the objdump / post-process / opt-record passes, demangling,
//! CFG extraction, optional sandboxed execution and finally cache
//! publication.

pub mod args;
pub mod ast;
pub mod demangle;
pub mod optrec;

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{anyhow, Context};
use chrono::Utc;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::asm::{cfg, cleaner};
use crate::cache::{self, Admission, ResultCache};
use crate::config::Config;
use crate::exec::sandbox::{self, SandboxMode};
use crate::exec::{pipeline, runner, RunOptions};
use crate::types::{
    text_to_lines, CompileRequest, CompileResult, CompilerDescriptor, ExecResult, OutputLine,
};
use crate::workspace::WorkspaceAllocator;

pub const INCLUDE_DIAGNOSTIC: &str = "<stdin>:1:1: no absolute or relative includes please";

/// Output cap for the AST probe; header-heavy dumps are enormous.
const AST_OUTPUT_CAP: usize = 1 << 30;

static RE_BAD_INCLUDE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*#\s*i(nclude|mport)(_next)?\s+["<](/|.*\.\.)"#).expect("include regex")
});
static RE_CLANG_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"clang[^0-9]*(\d+)\.(\d+)").expect("clang version regex"));

#[derive(Debug, Error)]
pub enum CompileError {
    /// Client-side problem, surfaced as 4xx plus the diagnostic.
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Bounded-concurrency FIFO lane for compile jobs.
pub struct Lane {
    width: usize,
    state: Mutex<LaneState>,
    cv: Condvar,
}

#[derive(Default)]
struct LaneState {
    active: usize,
    queue: VecDeque<u64>,
    next_ticket: u64,
}

pub struct LaneSlot<'a> {
    lane: &'a Lane,
}

impl Lane {
    pub fn new(width: usize) -> Self {
        Lane {
            width: width.max(1),
            state: Mutex::new(LaneState::default()),
            cv: Condvar::new(),
        }
    }

    /// Block until a slot frees up; admission order is ticket FIFO.
    pub fn acquire(&self) -> LaneSlot<'_> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ticket = st.next_ticket;
        st.next_ticket += 1;
        st.queue.push_back(ticket);
        while st.queue.front() != Some(&ticket) || st.active >= self.width {
            st = self.cv.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        st.queue.pop_front();
        st.active += 1;
        drop(st);
        // More than one slot may be free after a burst of releases.
        self.cv.notify_all();
        LaneSlot { lane: self }
    }
}

impl Drop for LaneSlot<'_> {
    fn drop(&mut self) {
        let mut st = self.lane.state.lock().unwrap_or_else(|e| e.into_inner());
        st.active -= 1;
        drop(st);
        self.lane.cv.notify_all();
    }
}

/// Everything a compile needs, threaded explicitly through the handlers.
pub struct CompileEnv {
    pub cfg: Arc<Config>,
    pub cache: Arc<ResultCache>,
    pub workspaces: Arc<WorkspaceAllocator>,
    pub lane: Arc<Lane>,
    pub sandbox: SandboxMode,
}

/// Drive one request against a local compiler descriptor.
pub fn compile(
    env: &CompileEnv,
    desc: &CompilerDescriptor,
    req: &CompileRequest,
) -> Result<CompileResult, CompileError> {
    screen_options(&env.cfg, &req.user_options)?;
    screen_includes(&req.source)?;

    let exe = desc
        .exe
        .as_ref()
        .ok_or_else(|| anyhow!("descriptor {} has no local executable", desc.id))?
        .clone();
    let filters = req.filters.normalize(desc);

    let mut source = req.source.clone();
    if filters.binary {
        let stub_re = Regex::new(&env.cfg.stub_re)
            .with_context(|| format!("bad stub_re {:?}", env.cfg.stub_re))?;
        if !stub_re.is_match(&source) {
            source.push('\n');
            source.push_str(&env.cfg.stub_text);
            source.push('\n');
        }
    }

    let key = cache::fingerprint(desc, req);
    let permit = match env.cache.admit(&key) {
        Admission::Hit(result) => {
            debug!("cache hit for {} on {}", &key[..12], desc.id);
            return Ok((*result).clone());
        }
        Admission::Build(permit) => permit,
    };

    let _busy = env.workspaces.compile_guard();
    let _slot = env.lane.acquire();

    let ws = env.workspaces.allocate("cpp").map_err(CompileError::Internal)?;
    fs::write(ws.input_path(), &source)
        .with_context(|| format!("write source to {}", ws.input_path().display()))?;
    let input_name = ws
        .input_path()
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("input.cpp")
        .to_string();

    // AST probe runs in parallel with the main compile.
    let ast_handle = if req.backend.produce_ast && supports_ast_dump(desc) {
        let exe = exe.clone();
        let mut ast_argv: Vec<String> = desc.default_options.clone();
        ast_argv.extend(req.user_options.iter().cloned());
        ast_argv.extend(
            ["-Xclang", "-ast-dump", "-fsyntax-only"]
                .iter()
                .map(|s| s.to_string()),
        );
        ast_argv.push(ws.input_path().display().to_string());
        let opts = RunOptions {
            timeout_ms: env.cfg.compile_timeout_ms,
            max_output: AST_OUTPUT_CAP,
            cwd: Some(ws.dir().to_path_buf()),
            ..Default::default()
        };
        let input_name = input_name.clone();
        Some(std::thread::spawn(move || {
            match runner::run(&exe, &ast_argv, &opts) {
                Ok(res) if res.status == Some(0) => Some(ast::filter_dump(&res.stdout, &input_name)),
                Ok(res) => {
                    debug!("ast probe exited {:?}", res.status);
                    None
                }
                Err(err) => {
                    warn!("ast probe failed: {err}");
                    None
                }
            }
        }))
    } else {
        None
    };

    let argv = args::build_argv(
        desc,
        &filters,
        &req.backend,
        &req.user_options,
        ws.input_path(),
        ws.output_path(),
    );
    let main_opts = RunOptions {
        timeout_ms: env.cfg.compile_timeout_ms,
        max_output: env.cfg.max_error_output,
        cwd: Some(ws.dir().to_path_buf()),
        ..Default::default()
    };
    let main = runner::run(&exe, &argv, &main_opts).map_err(CompileError::Internal)?;
    audit(env, desc, &key, &main);

    let ast_output = ast_handle.and_then(|h| h.join().ok()).flatten();

    if main.status != Some(0) || main.timed_out {
        let mut result = CompileResult::failed(main.status, main.signal);
        result.stdout = text_to_lines(&main.stdout);
        result.stderr = text_to_lines(&main.stderr);
        result.ok_to_cache = main.ok_to_cache;
        let result = Arc::new(result);
        permit.publish(&result, None);
        return Ok((*result).clone());
    }

    let mut ok_to_cache = main.ok_to_cache;
    let asm_text;
    if let (true, Some(objdumper)) = (filters.binary, desc.objdumper.as_ref()) {
        let mut od_argv: Vec<String> = vec![
            "-d".into(),
            ws.output_path().display().to_string(),
            "-l".into(),
            "--insn-width=16".into(),
        ];
        if filters.demangle {
            od_argv.push("-C".into());
        }
        if filters.intel {
            od_argv.push("-M".into());
            od_argv.push("intel".into());
        }
        let od_opts = RunOptions {
            timeout_ms: env.cfg.compile_timeout_ms,
            max_output: env.cfg.max_asm_size as usize,
            cwd: Some(ws.dir().to_path_buf()),
            ..Default::default()
        };
        match runner::run(objdumper, &od_argv, &od_opts) {
            Ok(od) if od.status == Some(0) => asm_text = od.stdout,
            Ok(od) => {
                // A bad disassembly must never be served from the cache.
                ok_to_cache = false;
                asm_text = format!("<objdump failed: {}>", od.stderr.trim());
            }
            Err(err) => {
                ok_to_cache = false;
                asm_text = format!("<objdump failed: {err}>");
            }
        }
    } else {
        asm_text = read_output_asm(env, desc, &ws, &mut ok_to_cache);
    }

    let mut asm_lines = cleaner::clean(&asm_text, &filters, Some(&input_name));

    let opt_output = if (req.backend.produce_opt_info || filters.opt_output)
        && desc.supports_opt_record
    {
        collect_opt_records(env, desc, &ws, &input_name)
    } else {
        None
    };

    if filters.demangle && ok_to_cache && !filters.binary {
        if let Some(demangler) = &desc.demangler {
            if let Err(err) =
                demangle::splice_lines(demangler, &mut asm_lines, env.cfg.max_asm_size as usize)
            {
                warn!("demangle pass failed: {err}");
            }
        }
    }

    let cfg_map = if desc.supports_cfg() {
        Some(cfg::build(&asm_lines))
    } else {
        None
    };

    let exec_result = if filters.execute {
        Some(run_in_sandbox(env, &ws))
    } else {
        None
    };

    let (output_file_path, retained) = if filters.binary {
        (
            Some(ws.output_path().to_path_buf()),
            Some(Arc::clone(&ws)),
        )
    } else {
        (None, None)
    };

    let result = Arc::new(CompileResult {
        asm: asm_lines,
        stdout: text_to_lines(&main.stdout),
        stderr: text_to_lines(&main.stderr),
        status: main.status,
        signal: main.signal,
        ok_to_cache,
        output_file_path,
        opt_output,
        ast_output,
        cfg: cfg_map,
        exec_result,
    });
    permit.publish(&result, retained);
    Ok((*result).clone())
}

fn screen_options(cfg: &Config, options: &[String]) -> Result<(), CompileError> {
    let offenders: Vec<&str> = options
        .iter()
        .filter(|o| cfg.bad_options.iter().any(|bad| bad == *o))
        .map(String::as_str)
        .collect();
    if offenders.is_empty() {
        Ok(())
    } else {
        Err(CompileError::BadRequest(format!(
            "Bad options: {}",
            offenders.join(", ")
        )))
    }
}

/// Best-effort screen only; the sandbox remains the real trust boundary.
fn screen_includes(source: &str) -> Result<(), CompileError> {
    for line in source.lines() {
        if RE_BAD_INCLUDE.is_match(line) {
            return Err(CompileError::BadRequest(INCLUDE_DIAGNOSTIC.into()));
        }
    }
    Ok(())
}

/// AST dumps need clang 3.3 or newer.
fn supports_ast_dump(desc: &CompilerDescriptor) -> bool {
    let Some(version) = desc.version.as_deref() else {
        return false;
    };
    let Some(caps) = RE_CLANG_VERSION.captures(version) else {
        return false;
    };
    let major: u32 = caps[1].parse().unwrap_or(0);
    let minor: u32 = caps[2].parse().unwrap_or(0);
    (major, minor) >= (3, 3)
}

fn read_output_asm(
    env: &CompileEnv,
    desc: &CompilerDescriptor,
    ws: &crate::workspace::Workspace,
    ok: &mut bool,
) -> String {
    let meta = match fs::metadata(ws.output_path()) {
        Ok(meta) => meta,
        Err(_) => {
            *ok = false;
            return "<No output file>".into();
        }
    };
    if meta.len() > env.cfg.max_asm_size {
        return format!(
            "<No output: generated assembly was too large ({} > {} bytes)>",
            meta.len(),
            env.cfg.max_asm_size
        );
    }
    if !desc.post_process.is_empty() {
        match pipeline::run_stages(
            ws.output_path(),
            &desc.post_process,
            env.cfg.compile_timeout_ms,
            env.cfg.max_asm_size as usize,
        ) {
            Ok(res) if res.status == Some(0) => return res.stdout,
            Ok(res) => {
                warn!("post-process pipeline exited {:?}", res.status);
                return "<Error during post processing>".into();
            }
            Err(err) => {
                warn!("post-process pipeline failed: {err}");
                return "<Error during post processing>".into();
            }
        }
    }
    fs::read_to_string(ws.output_path()).unwrap_or_else(|_| "<No output file>".into())
}

fn collect_opt_records(
    env: &CompileEnv,
    desc: &CompilerDescriptor,
    ws: &crate::workspace::Workspace,
    input_name: &str,
) -> Option<Vec<crate::types::OptRecord>> {
    let yaml = fs::read_to_string(ws.opt_path()).ok()?;
    let records = match optrec::parse(&yaml, input_name) {
        Ok(records) => records,
        Err(err) => {
            warn!("opt record parse failed: {err}");
            return None;
        }
    };
    let Some(demangler) = &desc.demangler else {
        return Some(records);
    };
    // Round-trip the serialized records through the demangler so mangled
    // names embedded anywhere in the remarks get rewritten.
    let json = serde_json::to_string(&records).ok()?;
    match demangle::filter_text(demangler, &json, env.cfg.max_asm_size as usize) {
        Ok(demangled) => match serde_json::from_str(&demangled) {
            Ok(parsed) => Some(parsed),
            Err(_) => Some(records),
        },
        Err(_) => Some(records),
    }
}

fn run_in_sandbox(env: &CompileEnv, ws: &crate::workspace::Workspace) -> ExecResult {
    match sandbox::execute(
        env.sandbox,
        ws.output_path(),
        &[],
        env.cfg.compile_timeout_ms,
        env.cfg.max_executable_output_size,
        &env.cfg.sandbox_image,
    ) {
        Ok(res) => ExecResult {
            status: res.status,
            signal: res.signal,
            stdout: text_to_lines(&res.stdout),
            stderr: text_to_lines(&res.stderr),
        },
        Err(err) => ExecResult {
            status: None,
            signal: None,
            stdout: Vec::new(),
            stderr: vec![OutputLine::plain(format!("### Sandbox error: {err}"))],
        },
    }
}

/// Append one build line to the audit log under the temp root, the same
/// shape the rest of the fleet's tooling expects.
fn audit(env: &CompileEnv, desc: &CompilerDescriptor, key: &str, res: &runner::RunResult) {
    let path = env.cfg.temp_root(false).join("asmbroker_builds.log");
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(
            f,
            "{} compiler={} fingerprint={} status={:?} truncated={}",
            Utc::now().to_rfc3339(),
            desc.id,
            &key[..16.min(key.len())],
            res.status,
            res.truncated
        );
    }
    info!(
        "compiled id={} status={:?} cacheable={}",
        desc.id, res.status, res.ok_to_cache
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_screen_blocks_absolute_and_parent_paths() {
        assert!(screen_includes("#include \"/etc/passwd\"\n").is_err());
        assert!(screen_includes("  #  include <../secret>\n").is_err());
        assert!(screen_includes("#include_next \"/x\"\n").is_err());
        assert!(screen_includes("#import \"/x\"\n").is_err());
        assert!(screen_includes("#include <vector>\nint f();\n").is_ok());
        assert!(screen_includes("#include \"mine.h\"\n").is_ok());
    }

    #[test]
    fn include_screen_diagnostic_text() {
        let err = screen_includes("#include \"/etc/passwd\"").unwrap_err();
        assert_eq!(err.to_string(), INCLUDE_DIAGNOSTIC);
    }

    #[test]
    fn option_screen_enumerates_offenders() {
        let cfg = Config {
            bad_options: vec!["-fplugin".into(), "-specs".into()],
            ..Default::default()
        };
        let err = screen_options(
            &cfg,
            &["-O2".into(), "-fplugin".into(), "-specs".into()],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Bad options: -fplugin, -specs");
        assert!(screen_options(&cfg, &["-O2".into()]).is_ok());
    }

    #[test]
    fn ast_needs_clang_three_three() {
        let mut desc = CompilerDescriptor {
            version: Some("clang version 3.2.0".into()),
            ..Default::default()
        };
        assert!(!supports_ast_dump(&desc));
        desc.version = Some("clang version 3.3.1".into());
        assert!(supports_ast_dump(&desc));
        desc.version = Some("clang version 15.0.7".into());
        assert!(supports_ast_dump(&desc));
        desc.version = Some("g++ (GCC) 12.1".into());
        assert!(!supports_ast_dump(&desc));
        desc.version = None;
        assert!(!supports_ast_dump(&desc));
    }

    #[test]
    fn lane_bounds_concurrency() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let lane = Arc::new(Lane::new(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lane = Arc::clone(&lane);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(std::thread::spawn(move || {
                let _slot = lane.acquire();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
