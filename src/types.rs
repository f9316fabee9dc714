// CLASSIFICATION: COMMUNITY
// Filename: types.rs v0.4
// Author: Lukas Bower
// Date Modified: 2026-01-19

//! Common cross-module types: compiler descriptors, requests and results.
//!
//! Wire forms use camelCase field names so peer brokers and the web client
//! agree on the JSON shape regardless of which broker produced it.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a compiler's command line is shaped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ArgKind {
    #[default]
    GccLike,
    ClangLike,
}

/// One compiler backend, local or remote. Exactly one of `exe` / `remote`
/// is populated. Never mutated in place after publication; the registry
/// replaces the whole set atomically.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CompilerDescriptor {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exe: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    pub arg_kind: ArgKind,
    pub default_options: Vec<String>,
    pub version_flag: String,
    pub version_re: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demangler: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objdumper: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intel_asm_flag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opt_flag: Option<String>,
    pub post_process: Vec<String>,
    pub supports_binary: bool,
    pub supports_execute: bool,
    pub supports_intel_asm: bool,
    pub needs_multiarch: bool,
    pub supports_opt_record: bool,
}

impl CompilerDescriptor {
    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Compiler families whose output the CFG builder understands.
    pub fn supports_cfg(&self) -> bool {
        let v = self.version.as_deref().unwrap_or("");
        v.starts_with("clang") || v.starts_with("g++")
    }
}

/// Output filters requested by the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterSet {
    pub binary: bool,
    pub link: bool,
    pub execute: bool,
    pub intel: bool,
    pub demangle: bool,
    pub comment_only: bool,
    pub directives: bool,
    pub labels: bool,
    pub opt_output: bool,
}

impl FilterSet {
    /// Resolve the filter invariants against the chosen compiler.
    ///
    /// `execute` promotes `binary` and `link`; a compiler without binary
    /// support clears `binary` and `execute` falls with it. `intel` is left
    /// set but has no effect on the objdump path.
    pub fn normalize(mut self, desc: &CompilerDescriptor) -> Self {
        if self.execute {
            self.binary = true;
            self.link = true;
        }
        if self.binary && !desc.supports_binary {
            self.binary = false;
            self.execute = false;
        }
        self
    }

    pub fn enabled_names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        let mut push = |on: bool, name: &'static str| {
            if on {
                out.push(name);
            }
        };
        push(self.binary, "binary");
        push(self.link, "link");
        push(self.execute, "execute");
        push(self.intel, "intel");
        push(self.demangle, "demangle");
        push(self.comment_only, "commentOnly");
        push(self.directives, "directives");
        push(self.labels, "labels");
        push(self.opt_output, "optOutput");
        out
    }

    /// Set one filter by its wire name. Unknown names are ignored.
    pub fn set(&mut self, name: &str, on: bool) {
        match name {
            "binary" => self.binary = on,
            "link" => self.link = on,
            "execute" => self.execute = on,
            "intel" => self.intel = on,
            "demangle" => self.demangle = on,
            "commentOnly" => self.comment_only = on,
            "directives" => self.directives = on,
            "labels" => self.labels = on,
            "optOutput" => self.opt_output = on,
            _ => {}
        }
    }
}

/// Backend switches that are not filters: extra artifacts to produce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendOptions {
    pub produce_ast: bool,
    pub produce_opt_info: bool,
}

/// One compile job as received from a client. Immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    pub source: String,
    #[serde(default)]
    pub user_options: Vec<String>,
    #[serde(default)]
    pub backend: BackendOptions,
    #[serde(default)]
    pub filters: FilterSet,
}

/// Source position an output line maps back to. `file == None` means the
/// user's own input file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub line: u32,
}

/// One line of cleaned assembly or captured output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLine {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,
}

impl OutputLine {
    pub fn plain(text: impl Into<String>) -> Self {
        OutputLine {
            text: text.into(),
            source: None,
        }
    }
}

/// Parsed LLVM optimization remark.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptRecord {
    /// `Passed`, `Missed` or `Analysis`.
    pub kind: String,
    pub pass: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_loc: Option<DebugLoc>,
    pub display_string: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugLoc {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// Basic-block graph node for one function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfgNode {
    pub id: String,
    pub label: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfgEdge {
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arrows: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCfg {
    pub nodes: Vec<CfgNode>,
    pub edges: Vec<CfgEdge>,
}

/// Result of running the produced binary inside the sandbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub stdout: Vec<OutputLine>,
    pub stderr: Vec<OutputLine>,
}

/// Structured result of one compile, as returned to HTTP clients and as
/// stored in the result cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResult {
    pub asm: Vec<OutputLine>,
    pub stdout: Vec<OutputLine>,
    pub stderr: Vec<OutputLine>,
    pub status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub ok_to_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opt_output: Option<Vec<OptRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ast_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cfg: Option<BTreeMap<String, FunctionCfg>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec_result: Option<ExecResult>,
}

impl CompileResult {
    /// Placeholder result used when the main compile fails outright.
    pub fn failed(status: Option<i32>, signal: Option<i32>) -> Self {
        CompileResult {
            asm: vec![OutputLine::plain("<Compilation failed>")],
            stdout: Vec::new(),
            stderr: Vec::new(),
            status,
            signal,
            ok_to_cache: false,
            output_file_path: None,
            opt_output: None,
            ast_output: None,
            cfg: None,
            exec_result: None,
        }
    }
}

/// Split captured process output into structured lines, dropping a single
/// trailing empty line left by the final newline.
pub fn text_to_lines(text: &str) -> Vec<OutputLine> {
    let mut lines: Vec<OutputLine> = text.split('\n').map(OutputLine::plain).collect();
    if lines.last().map(|l| l.text.is_empty()).unwrap_or(false) {
        lines.pop();
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_desc(supports_binary: bool) -> CompilerDescriptor {
        CompilerDescriptor {
            id: "g1".into(),
            name: "gcc 12".into(),
            exe: Some(PathBuf::from("/usr/bin/gcc")),
            supports_binary,
            ..Default::default()
        }
    }

    #[test]
    fn execute_promotes_binary_and_link() {
        let f = FilterSet {
            execute: true,
            ..Default::default()
        };
        let n = f.normalize(&local_desc(true));
        assert!(n.binary && n.link && n.execute);
    }

    #[test]
    fn binary_cleared_without_support() {
        let f = FilterSet {
            binary: true,
            execute: true,
            ..Default::default()
        };
        let n = f.normalize(&local_desc(false));
        assert!(!n.binary);
        assert!(!n.execute);
    }

    #[test]
    fn filter_names_round_trip() {
        let mut f = FilterSet::default();
        f.set("commentOnly", true);
        f.set("optOutput", true);
        f.set("bogus", true);
        assert_eq!(f.enabled_names(), vec!["commentOnly", "optOutput"]);
    }

    #[test]
    fn result_serializes_camel_case() {
        let r = CompileResult::failed(Some(1), None);
        let js = serde_json::to_value(&r).unwrap();
        assert_eq!(js["okToCache"], serde_json::Value::Bool(false));
        assert_eq!(js["asm"][0]["text"], "<Compilation failed>");
    }
}
