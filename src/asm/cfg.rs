// CLASSIFICATION: COMMUNITY
// Filename: cfg.rs v0.4
// Author: Lukas Bower
// Date Modified: 2026-05-19

//! Basic-block control-flow graphs from cleaned assembly.
//!
//! Functions are scoped by their symbol label, partitioned into blocks at
//! branch and target boundaries, and connected by fall-through,
//! unconditional and conditional edges. Conditional edges carry a
//! "true"/"false" annotation for the renderer.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{CfgEdge, CfgNode, FunctionCfg, OutputLine};

/// Symbol labels at column zero open a function scope; local labels
/// (leading dot) do not.
static RE_FUNCTION_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_$.]*):").expect("function label regex"));
static RE_LOCAL_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\.[A-Za-z_$][A-Za-z0-9$_.]*):").expect("local label regex"));
static RE_BRANCH_TARGET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([.A-Za-z_$][A-Za-z0-9$_.]*)\s*$").expect("target regex"));

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Execution continues into the next line.
    Fallthrough,
    /// `jmp`-style transfer, never falls through.
    Unconditional,
    /// `jcc`-style transfer, may fall through.
    Conditional,
    /// `ret`-style end of flow.
    Terminal,
}

fn flow_of(opcode: &str) -> Flow {
    match opcode {
        "jmp" | "jmpq" | "br" | "b" => Flow::Unconditional,
        "ret" | "retq" | "leave" | "hlt" | "ud2" => Flow::Terminal,
        op if op.starts_with('j') => Flow::Conditional,
        op if op.starts_with("b.") => Flow::Conditional,
        _ => Flow::Fallthrough,
    }
}

struct Block {
    id: String,
    lines: Vec<String>,
    flow: Flow,
    target: Option<String>,
}

/// Build one CFG per function found in `lines`.
pub fn build(lines: &[OutputLine]) -> BTreeMap<String, FunctionCfg> {
    let mut graphs = BTreeMap::new();
    let mut idx = 0;
    while idx < lines.len() {
        let Some(caps) = RE_FUNCTION_LABEL.captures(&lines[idx].text) else {
            idx += 1;
            continue;
        };
        let name = caps[1].to_string();
        let mut end = idx + 1;
        while end < lines.len() && !RE_FUNCTION_LABEL.is_match(&lines[end].text) {
            end += 1;
        }
        let cfg = build_function(&name, &lines[idx + 1..end]);
        if !cfg.nodes.is_empty() {
            graphs.insert(name, cfg);
        }
        idx = end;
    }
    graphs
}

fn build_function(name: &str, body: &[OutputLine]) -> FunctionCfg {
    let mut blocks: Vec<Block> = Vec::new();
    let mut current = Block {
        id: name.to_string(),
        lines: Vec::new(),
        flow: Flow::Fallthrough,
        target: None,
    };
    let mut synth = 0u32;

    for line in body {
        let text = line.text.trim();
        if text.is_empty() {
            continue;
        }
        if let Some(caps) = RE_LOCAL_LABEL.captures(text) {
            // Target boundary: close the running block.
            if !current.lines.is_empty() || current.id == name {
                blocks.push(current);
            }
            current = Block {
                id: caps[1].to_string(),
                lines: Vec::new(),
                flow: Flow::Fallthrough,
                target: None,
            };
            continue;
        }
        if text.starts_with('.') {
            continue;
        }
        let opcode = text.split_whitespace().next().unwrap_or("");
        let flow = flow_of(opcode);
        current.lines.push(text.to_string());
        if flow != Flow::Fallthrough {
            current.flow = flow;
            current.target = RE_BRANCH_TARGET
                .captures(text)
                .map(|c| c[1].to_string())
                .filter(|t| t != opcode);
            blocks.push(current);
            synth += 1;
            current = Block {
                id: format!("{name}@{synth}"),
                lines: Vec::new(),
                flow: Flow::Fallthrough,
                target: None,
            };
        }
    }
    if !current.lines.is_empty() {
        blocks.push(current);
    }

    // Empty synthesized blocks between a branch and the next label would
    // produce dangling nodes; merge them away by skipping.
    let blocks: Vec<Block> = blocks
        .into_iter()
        .filter(|b| !b.lines.is_empty() || b.id.starts_with('.'))
        .collect();

    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    for (i, block) in blocks.iter().enumerate() {
        nodes.push(CfgNode {
            id: block.id.clone(),
            label: block.lines.join("\n"),
        });
        let next_id = blocks.get(i + 1).map(|b| b.id.clone());
        match block.flow {
            Flow::Terminal => {}
            Flow::Unconditional => {
                if let Some(target) = &block.target {
                    edges.push(CfgEdge {
                        from: block.id.clone(),
                        to: target.clone(),
                        arrows: None,
                    });
                }
            }
            Flow::Conditional => {
                if let Some(target) = &block.target {
                    edges.push(CfgEdge {
                        from: block.id.clone(),
                        to: target.clone(),
                        arrows: Some("true".into()),
                    });
                }
                if let Some(next) = next_id {
                    edges.push(CfgEdge {
                        from: block.id.clone(),
                        to: next,
                        arrows: Some("false".into()),
                    });
                }
            }
            Flow::Fallthrough => {
                if let Some(next) = next_id {
                    edges.push(CfgEdge {
                        from: block.id.clone(),
                        to: next,
                        arrows: None,
                    });
                }
            }
        }
    }

    // Drop edges to labels outside this function (tail calls and the like).
    let ids: std::collections::HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    edges.retain(|e| ids.contains(e.to.as_str()));

    FunctionCfg { nodes, edges }
}
