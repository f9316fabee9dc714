// CLASSIFICATION: COMMUNITY
// Filename: config.rs v0.6
// Author: Lukas Bower
// Date Modified: 2026-02-07

//! Layered broker configuration.
//!
//! Configuration lives in a directory of TOML files merged in a fixed
//! order: `defaults`, each `--env`, the chosen language, each
//! `<env>.<platform>` pair, the platform, the hostname, then `local`.
//! Later files override earlier ones key by key. The merged table is
//! deserialized once at startup into the typed [`Config`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;

use crate::types::ArgKind;

/// Per-compiler properties as written in `[compiler.<id>]` tables. Every
/// field is optional so group defaults overlay cleanly.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CompilerProps {
    pub exe: Option<PathBuf>,
    pub name: Option<String>,
    /// Whitespace-separated default options.
    pub options: Option<String>,
    pub compiler_type: Option<ArgKind>,
    pub version_flag: Option<String>,
    pub version_re: Option<String>,
    pub demangler: Option<PathBuf>,
    pub objdumper: Option<PathBuf>,
    pub intel_asm: Option<String>,
    pub opt_flag: Option<String>,
    pub post_process: Option<Vec<String>>,
    pub supports_binary: Option<bool>,
    pub supports_execute: Option<bool>,
    pub supports_intel_asm: Option<bool>,
    pub needs_multiarch: Option<bool>,
    pub supports_opt_record: Option<bool>,
}

impl CompilerProps {
    /// Overlay `over` on `base`; populated fields in `over` win.
    pub fn overlay(base: &CompilerProps, over: &CompilerProps) -> CompilerProps {
        macro_rules! pick {
            ($field:ident) => {
                over.$field.clone().or_else(|| base.$field.clone())
            };
        }
        CompilerProps {
            exe: pick!(exe),
            name: pick!(name),
            options: pick!(options),
            compiler_type: over.compiler_type.or(base.compiler_type),
            version_flag: pick!(version_flag),
            version_re: pick!(version_re),
            demangler: pick!(demangler),
            objdumper: pick!(objdumper),
            intel_asm: pick!(intel_asm),
            opt_flag: pick!(opt_flag),
            post_process: pick!(post_process),
            supports_binary: over.supports_binary.or(base.supports_binary),
            supports_execute: over.supports_execute.or(base.supports_execute),
            supports_intel_asm: over.supports_intel_asm.or(base.supports_intel_asm),
            needs_multiarch: over.needs_multiarch.or(base.needs_multiarch),
            supports_opt_record: over.supports_opt_record.or(base.supports_opt_record),
        }
    }
}

/// A named compiler group: shared defaults plus its own seed list.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct GroupProps {
    /// Colon-separated seed entries, same grammar as the top-level list.
    pub compilers: String,
    #[serde(flatten)]
    pub props: CompilerProps,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Colon-separated seed list for the registry.
    pub compilers: String,
    pub compiler: BTreeMap<String, CompilerProps>,
    pub group: BTreeMap<String, GroupProps>,
    pub compile_timeout_ms: u64,
    pub max_error_output: usize,
    pub max_asm_size: u64,
    pub max_executable_output_size: usize,
    /// Binary mode appends `stub_text` when the source does not match this.
    pub stub_re: String,
    pub stub_text: String,
    pub proxy_retries: u32,
    pub proxy_retry_ms: u64,
    pub proxy_timeout_ms: u64,
    /// 0 disables the periodic rescan.
    pub rescan_compiler_secs: u64,
    pub temp_dir_cleanup_secs: u64,
    /// `docker` or `none`.
    pub sandbox_type: String,
    pub sandbox_image: String,
    /// Use public DNS names for cloud instances.
    pub external_test_mode: bool,
    pub body_parser_limit: usize,
    /// Option tokens rejected before any compile is attempted.
    pub bad_options: Vec<String>,
    pub ndk_path: Option<PathBuf>,
    /// Endpoint returning the JSON list of cloud backend instances.
    pub instance_registry_url: Option<String>,
    pub max_concurrent_compiles: usize,
    pub temp_dir: Option<PathBuf>,
    /// Total byte budget for the in-memory result cache.
    pub cache_size_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            compilers: String::new(),
            compiler: BTreeMap::new(),
            group: BTreeMap::new(),
            compile_timeout_ms: 7_500,
            max_error_output: 5_000,
            max_asm_size: 8 * 1024 * 1024,
            max_executable_output_size: 32 * 1024,
            stub_re: r"\bint\s+main\s*\(".into(),
            stub_text: "int main(void) { return 0; }".into(),
            proxy_retries: 5,
            proxy_retry_ms: 500,
            proxy_timeout_ms: 10_000,
            rescan_compiler_secs: 0,
            temp_dir_cleanup_secs: 600,
            sandbox_type: "docker".into(),
            sandbox_image: "asmbroker/sandbox".into(),
            external_test_mode: false,
            body_parser_limit: 5 * 1024 * 1024,
            bad_options: Vec::new(),
            ndk_path: None,
            instance_registry_url: None,
            max_concurrent_compiles: 4,
            temp_dir: None,
            cache_size_bytes: 256 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load and merge the configuration layers under `prefix`.
    pub fn load(prefix: &Path, envs: &[String], language: Option<&str>) -> Result<Config> {
        let platform = std::env::consts::OS;
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();

        let mut layers: Vec<String> = vec!["defaults".into()];
        layers.extend(envs.iter().cloned());
        if let Some(lang) = language {
            layers.push(lang.to_string());
        }
        for env in envs {
            layers.push(format!("{env}.{platform}"));
        }
        layers.push(platform.to_string());
        if !host.is_empty() {
            layers.push(host);
        }
        layers.push("local".into());

        let mut merged = toml::value::Table::new();
        for layer in &layers {
            let path = prefix.join(format!("{layer}.toml"));
            if !path.exists() {
                continue;
            }
            let text = fs::read_to_string(&path)
                .with_context(|| format!("read config layer {}", path.display()))?;
            let value: toml::Value = toml::from_str(&text)
                .with_context(|| format!("parse config layer {}", path.display()))?;
            if let toml::Value::Table(table) = value {
                merge_tables(&mut merged, table);
                debug!("applied config layer {}", path.display());
            }
        }

        let cfg: Config = toml::Value::Table(merged)
            .try_into()
            .context("deserialize merged configuration")?;
        Ok(cfg)
    }

    /// Root under which compile workspaces are created.
    pub fn temp_root(&self, wsl: bool) -> PathBuf {
        if let Some(dir) = &self.temp_dir {
            return dir.clone();
        }
        if wsl {
            // Windows-mounted temp path when running under WSL.
            return PathBuf::from("/mnt/c/tmp");
        }
        std::env::temp_dir()
    }
}

/// Recursive key-wise merge; nested tables merge, scalars replace.
fn merge_tables(dst: &mut toml::value::Table, src: toml::value::Table) {
    for (key, value) in src {
        match (dst.get_mut(&key), value) {
            (Some(toml::Value::Table(d)), toml::Value::Table(s)) => merge_tables(d, s),
            (_, value) => {
                dst.insert(key, value);
            }
        }
    }
}

/// Split a whitespace-separated option string, dropping empties.
pub fn split_options(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(|s| s.to_string()).collect()
}
