// CLASSIFICATION: COMMUNITY
// Filename: registry.rs v1.1
// Author: Lukas Bower
// Date Modified: 2026-07-18

//! Compiler discovery and publication.
//!
//! The seed list is colon separated; each entry is either `AWS` (cloud
//! instance registry), `&group` (named group with shared defaults),
//! `host@port` (peer broker) or a local compiler id. Local descriptors
//! are version-probed before publication and dropped silently when the
//! probe fails. Publication swaps the whole sorted set atomically, so
//! readers see the old set or the new set, never a mix.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use regex::Regex;
use serde::Deserialize;

use crate::config::{split_options, CompilerProps, Config, GroupProps};
use crate::exec::{runner, RunOptions};
use crate::types::CompilerDescriptor;

const PROBE_TIMEOUT_MS: u64 = 5_000;
const PROBE_OUTPUT_CAP: usize = 64 * 1024;

/// Replace-only snapshot of the live compiler set plus the client-options
/// document derived from it.
pub struct CompilerPool {
    set: RwLock<Arc<Vec<Arc<CompilerDescriptor>>>>,
    options_json: RwLock<Arc<String>>,
}

impl Default for CompilerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilerPool {
    pub fn new() -> Self {
        CompilerPool {
            set: RwLock::new(Arc::new(Vec::new())),
            options_json: RwLock::new(Arc::new("{}".into())),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<CompilerDescriptor>>> {
        self.set
            .read()
            .map(|g| Arc::clone(&g))
            .unwrap_or_else(|e| Arc::clone(&e.into_inner()))
    }

    pub fn find(&self, id: &str) -> Option<Arc<CompilerDescriptor>> {
        self.snapshot().iter().find(|d| d.id == id).cloned()
    }

    pub fn client_options(&self) -> Arc<String> {
        self.options_json
            .read()
            .map(|g| Arc::clone(&g))
            .unwrap_or_else(|e| Arc::clone(&e.into_inner()))
    }

    /// Swap in a new set. Normally driven by the [`Registry`]; also the
    /// seam tests use to install hand-built descriptors.
    pub fn publish(&self, set: Vec<CompilerDescriptor>, options_json: String) {
        let wrapped: Vec<Arc<CompilerDescriptor>> = set.into_iter().map(Arc::new).collect();
        if let Ok(mut guard) = self.set.write() {
            *guard = Arc::new(wrapped);
        }
        if let Ok(mut guard) = self.options_json.write() {
            *guard = Arc::new(options_json);
        }
    }
}

/// One backend instance as returned by the cloud instance registry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudInstance {
    private_dns: String,
    #[serde(default)]
    public_dns: Option<String>,
}

pub struct Registry {
    cfg: Arc<Config>,
    pool: Arc<CompilerPool>,
    /// Broker's own listen port; peer fetches against cloud instances use it.
    port: u16,
    last_published: Mutex<String>,
}

impl Registry {
    pub fn new(cfg: Arc<Config>, pool: Arc<CompilerPool>, port: u16) -> Self {
        Registry {
            cfg,
            pool,
            port,
            last_published: Mutex::new(String::new()),
        }
    }

    /// Run a full discovery pass and publish the result. Returns the number
    /// of live descriptors.
    pub fn bootstrap(&self) -> Result<usize> {
        let discovered = self.discover();
        let initialized = initialize(discovered);
        let count = initialized.len();
        self.publish(initialized)?;
        info!("registry published {count} compilers");
        Ok(count)
    }

    /// Re-run discovery; skip the swap when nothing changed so clients do
    /// not churn. Returns whether a new set was published.
    pub fn rescan(&self) -> bool {
        let discovered = self.discover();
        let mut initialized = initialize(discovered);
        initialized.sort_by(|a, b| a.name.cmp(&b.name));
        let serialized = serde_json::to_string(&initialized).unwrap_or_default();
        {
            let mut last = self
                .last_published
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if *last == serialized {
                debug!("rescan found no changes");
                return false;
            }
            *last = serialized;
        }
        let options = client_options_json(&self.cfg, &initialized);
        let count = initialized.len();
        self.pool.publish(initialized, options);
        info!("rescan published {count} compilers");
        true
    }

    /// Periodic rescan; never overlaps itself since it runs on one thread.
    pub fn start_rescan_timer(self: &Arc<Self>) {
        let secs = self.cfg.rescan_compiler_secs;
        if secs == 0 {
            return;
        }
        let registry = Arc::clone(self);
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_secs(secs));
            registry.rescan();
        });
    }

    fn publish(&self, mut set: Vec<CompilerDescriptor>) -> Result<usize> {
        set.sort_by(|a, b| a.name.cmp(&b.name));
        let serialized = serde_json::to_string(&set).context("serialize compiler set")?;
        *self
            .last_published
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = serialized;
        let options = client_options_json(&self.cfg, &set);
        let count = set.len();
        self.pool.publish(set, options);
        Ok(count)
    }

    fn discover(&self) -> Vec<CompilerDescriptor> {
        let mut out = resolve_list(&self.cfg, &self.cfg.compilers, &[], self.port);
        if let Some(ndk) = &self.cfg.ndk_path {
            out.extend(scan_ndk(ndk));
        }
        out
    }
}

/// Resolve one colon-separated seed list; `groups` is the stack of group
/// property tables from outermost to innermost.
fn resolve_list(
    cfg: &Config,
    list: &str,
    groups: &[&GroupProps],
    port: u16,
) -> Vec<CompilerDescriptor> {
    let mut out = Vec::new();
    for entry in list.split(':').filter(|e| !e.is_empty()) {
        if entry == "AWS" {
            for (host, peer_port) in cloud_instances(cfg, port) {
                out.extend(fetch_peer(cfg, &host, peer_port));
            }
        } else if let Some(name) = entry.strip_prefix('&') {
            match cfg.group.get(name) {
                Some(group) => {
                    let mut stack: Vec<&GroupProps> = groups.to_vec();
                    stack.push(group);
                    out.extend(resolve_list(cfg, &group.compilers, &stack, port));
                }
                None => warn!("unknown compiler group &{name}"),
            }
        } else if let Some((host, port_text)) = entry.split_once('@') {
            match port_text.parse::<u16>() {
                Ok(peer_port) => out.extend(fetch_peer(cfg, host, peer_port)),
                Err(_) => warn!("bad peer entry {entry:?}"),
            }
        } else {
            out.push(build_local(cfg, entry, groups));
        }
    }
    out
}

/// Construct a local descriptor from the property chain: group defaults
/// outermost first, then `compiler.<id>` overrides.
fn build_local(cfg: &Config, id: &str, groups: &[&GroupProps]) -> CompilerDescriptor {
    let mut props = CompilerProps::default();
    for group in groups {
        props = CompilerProps::overlay(&props, &group.props);
    }
    if let Some(specific) = cfg.compiler.get(id) {
        props = CompilerProps::overlay(&props, specific);
    }
    CompilerDescriptor {
        id: id.to_string(),
        name: props.name.unwrap_or_else(|| id.to_string()),
        exe: Some(props.exe.unwrap_or_else(|| PathBuf::from(id))),
        remote: None,
        arg_kind: props.compiler_type.unwrap_or_default(),
        default_options: props.options.as_deref().map(split_options).unwrap_or_default(),
        version_flag: props.version_flag.unwrap_or_else(|| "--version".into()),
        version_re: props.version_re.unwrap_or_else(|| r"^(.*)".into()),
        version: None,
        demangler: props.demangler,
        objdumper: props.objdumper,
        intel_asm_flag: props.intel_asm,
        opt_flag: props.opt_flag,
        post_process: props.post_process.unwrap_or_default(),
        supports_binary: props.supports_binary.unwrap_or(false),
        supports_execute: props.supports_execute.unwrap_or(false),
        supports_intel_asm: props.supports_intel_asm.unwrap_or(false),
        needs_multiarch: props.needs_multiarch.unwrap_or(false),
        supports_opt_record: props.supports_opt_record.unwrap_or(false),
    }
}

/// Fetch a peer broker's compiler list with fixed-delay retry. A dead peer
/// contributes an empty list; the registry carries on.
fn fetch_peer(cfg: &Config, host: &str, port: u16) -> Vec<CompilerDescriptor> {
    let url = format!("http://{host}:{port}/api/compilers");
    let base = format!("http://{host}:{port}");
    for attempt in 1..=cfg.proxy_retries.max(1) {
        let outcome = ureq::get(&url)
            .timeout(Duration::from_millis(cfg.proxy_timeout_ms))
            .call();
        match outcome {
            Ok(resp) => match resp.into_json::<Vec<CompilerDescriptor>>() {
                Ok(mut list) => {
                    for desc in &mut list {
                        desc.exe = None;
                        desc.remote = Some(base.clone());
                    }
                    debug!("peer {base} contributed {} compilers", list.len());
                    return list;
                }
                Err(err) => warn!("peer {base} sent bad JSON: {err}"),
            },
            Err(err) => warn!("peer {base} attempt {attempt} failed: {err}"),
        }
        std::thread::sleep(Duration::from_millis(cfg.proxy_retry_ms));
    }
    warn!("giving up on peer {base} after {} attempts", cfg.proxy_retries);
    Vec::new()
}

/// List backend instances from the cloud registry endpoint. Under external
/// test mode the public DNS names are used instead of the private ones.
fn cloud_instances(cfg: &Config, port: u16) -> Vec<(String, u16)> {
    let Some(url) = &cfg.instance_registry_url else {
        warn!("AWS seed entry without instance_registry_url");
        return Vec::new();
    };
    let resp = ureq::get(url)
        .timeout(Duration::from_millis(cfg.proxy_timeout_ms))
        .call();
    let instances: Vec<CloudInstance> = match resp {
        Ok(resp) => match resp.into_json() {
            Ok(list) => list,
            Err(err) => {
                warn!("instance registry {url} sent bad JSON: {err}");
                return Vec::new();
            }
        },
        Err(err) => {
            warn!("instance registry {url} unavailable: {err}");
            return Vec::new();
        }
    };
    instances
        .into_iter()
        .map(|inst| {
            let host = if cfg.external_test_mode {
                inst.public_dns.unwrap_or(inst.private_dns)
            } else {
                inst.private_dns
            };
            (host, port)
        })
        .collect()
}

/// Android NDK toolchain scan: each toolchain directory contributes the
/// `g++`-named executable found under its `bin` directories.
fn scan_ndk(root: &Path) -> Vec<CompilerDescriptor> {
    let toolchains = root.join("toolchains");
    let base = if toolchains.is_dir() {
        toolchains
    } else {
        root.to_path_buf()
    };
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(&base) else {
        warn!("NDK path {} not readable", base.display());
        return out;
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        if let Some(gxx) = find_gxx(&dir, 0) {
            let name = entry.file_name().to_string_lossy().into_owned();
            out.push(CompilerDescriptor {
                id: format!("android-{name}"),
                name: format!("Android NDK {name}"),
                exe: Some(gxx),
                version_flag: "--version".into(),
                version_re: r"^(.*)".into(),
                ..Default::default()
            });
        }
    }
    out
}

fn find_gxx(dir: &Path, depth: u8) -> Option<PathBuf> {
    if depth > 4 {
        return None;
    }
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_gxx(&path, depth + 1) {
                return Some(found);
            }
        } else if path
            .file_name()
            .and_then(|f| f.to_str())
            .map(|f| f.ends_with("g++"))
            .unwrap_or(false)
        {
            return Some(path);
        }
    }
    None
}

/// Probe each local descriptor: run the version flag, match the version
/// regex, and scrape `--help` for supported presentation options.
/// Descriptors failing the probe are dropped.
pub fn initialize(descriptors: Vec<CompilerDescriptor>) -> Vec<CompilerDescriptor> {
    descriptors
        .into_iter()
        .filter_map(|mut desc| {
            if desc.is_remote() {
                return Some(desc);
            }
            let exe = desc.exe.clone()?;
            let version = probe_version(&exe, &desc.version_flag, &desc.version_re)?;
            desc.version = Some(version);
            if desc.intel_asm_flag.is_some() && !desc.supports_intel_asm {
                desc.supports_intel_asm = help_mentions(&exe, desc.intel_asm_flag.as_deref());
            }
            Some(desc)
        })
        .collect()
}

fn probe_version(exe: &Path, flag: &str, version_re: &str) -> Option<String> {
    let re = match Regex::new(version_re) {
        Ok(re) => re,
        Err(err) => {
            warn!("bad version_re {version_re:?}: {err}");
            return None;
        }
    };
    let opts = RunOptions::with_timeout(PROBE_TIMEOUT_MS, PROBE_OUTPUT_CAP);
    let res = match runner::run(exe, &[flag.to_string()], &opts) {
        Ok(res) => res,
        Err(err) => {
            debug!("version probe of {} failed: {err}", exe.display());
            return None;
        }
    };
    if res.status != Some(0) {
        debug!("version probe of {} exited {:?}", exe.display(), res.status);
        return None;
    }
    res.stdout
        .lines()
        .chain(res.stderr.lines())
        .find(|line| re.is_match(line))
        .map(str::to_string)
}

/// Scrape the compiler's help output for a flag it claims to support.
fn help_mentions(exe: &Path, flag: Option<&str>) -> bool {
    let Some(flag) = flag else {
        return false;
    };
    // Only the flag stem matters; `-masm=intel` appears as `-masm=` in help.
    let stem = flag.split('=').next().unwrap_or(flag);
    let opts = RunOptions::with_timeout(PROBE_TIMEOUT_MS, PROBE_OUTPUT_CAP);
    match runner::run(exe, &["--help".to_string()], &opts) {
        Ok(res) => res.stdout.contains(stem) || res.stderr.contains(stem),
        Err(_) => false,
    }
}

/// The document served as `/client-options.json`.
fn client_options_json(cfg: &Config, set: &[CompilerDescriptor]) -> String {
    let compilers: Vec<serde_json::Value> = set
        .iter()
        .map(|d| serde_json::json!({"id": d.id, "name": d.name}))
        .collect();
    serde_json::json!({
        "compilers": compilers,
        "defaultCompiler": set.first().map(|d| d.id.clone()),
        "compileOptions": {
            "maxSourceBytes": cfg.body_parser_limit,
            "timeoutMs": cfg.compile_timeout_ms,
        },
        "filters": [
            "binary", "link", "execute", "intel", "demangle",
            "commentOnly", "directives", "labels", "optOutput",
        ],
    })
    .to_string()
}
