// CLASSIFICATION: COMMUNITY
// Filename: cleaner.rs v1.2
// Author: Lukas Bower
// Date Modified: 2026-05-11

//! Assembly tidy-up.
//!
//! Takes raw compiler assembly plus the client's filter flags and produces
//! structured `{text, source?}` lines. `.file` / `.loc` directives are
//! consumed for source mapping before directive stripping applies, label
//! reachability is computed textually, and the whole pass is a pure
//! function of its inputs.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{FilterSet, OutputLine, SourceRef};

static RE_LABEL_DEF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([.A-Za-z_$][A-Za-z0-9$_.]*):").expect("label regex"));
static RE_FILE_DIRECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*\.file\s+(\d+)\s+"([^"]+)""#).expect("file regex"));
static RE_LOC_DIRECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\.loc\s+(\d+)\s+(\d+)").expect("loc regex"));
static RE_DIRECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\.[A-Za-z_]").expect("directive regex"));
static RE_COMMENT_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[#;]|//)").expect("comment regex"));
static RE_TRAILING_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+(?:#|//|;)\s.*$").expect("trailing comment regex"));
static RE_LABEL_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.A-Za-z_$][A-Za-z0-9$_.]*").expect("token regex"));
static RE_SYNTAX_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\.(intel_syntax|att_syntax)\b").expect("syntax regex"));

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LineKind {
    Blank,
    Comment,
    LabelDef,
    Directive,
    Instruction,
}

fn classify(line: &str) -> LineKind {
    if line.trim().is_empty() {
        LineKind::Blank
    } else if RE_COMMENT_ONLY.is_match(line) {
        LineKind::Comment
    } else if RE_LABEL_DEF.is_match(line) {
        LineKind::LabelDef
    } else if RE_DIRECTIVE.is_match(line) {
        LineKind::Directive
    } else {
        LineKind::Instruction
    }
}

/// Clean `raw` according to `filters`. `user_file` is the basename of the
/// compile input; `.loc` references to it map lines back to the user's
/// source (`source.file == None`), other files keep their path.
pub fn clean(raw: &str, filters: &FilterSet, user_file: Option<&str>) -> Vec<OutputLine> {
    let lines: Vec<&str> = raw.lines().collect();
    let defined = collect_labels(&lines);
    let used = collect_used_labels(&lines, &defined);

    let mut file_table: HashMap<u32, String> = HashMap::new();
    let mut current_source: Option<SourceRef> = None;
    let mut out: Vec<OutputLine> = Vec::new();
    let mut dropping_dead_label = false;

    for raw_line in &lines {
        let line = raw_line.trim_end_matches('\r');
        let kind = classify(line);

        if let Some(caps) = RE_FILE_DIRECTIVE.captures(line) {
            let idx: u32 = caps[1].parse().unwrap_or(0);
            file_table.insert(idx, caps[2].to_string());
            if filters.directives {
                continue;
            }
        }
        if let Some(caps) = RE_LOC_DIRECTIVE.captures(line) {
            let idx: u32 = caps[1].parse().unwrap_or(0);
            let lineno: u32 = caps[2].parse().unwrap_or(0);
            current_source = file_table.get(&idx).map(|path| SourceRef {
                file: if is_user_file(path, user_file) {
                    None
                } else {
                    Some(path.clone())
                },
                line: lineno,
            });
            if filters.directives {
                continue;
            }
        }

        match kind {
            LineKind::Blank => {
                if out.last().map(|l| !l.text.is_empty()).unwrap_or(false) {
                    out.push(OutputLine::plain(""));
                }
            }
            LineKind::Comment => {
                if !filters.comment_only {
                    out.push(OutputLine::plain(line));
                }
            }
            LineKind::LabelDef => {
                let name = RE_LABEL_DEF
                    .captures(line)
                    .map(|c| c[1].to_string())
                    .unwrap_or_default();
                if filters.labels && !used.contains(&name) {
                    dropping_dead_label = true;
                    continue;
                }
                dropping_dead_label = false;
                out.push(OutputLine::plain(line));
            }
            LineKind::Directive => {
                if dropping_dead_label {
                    continue;
                }
                if filters.intel && RE_SYNTAX_HINT.is_match(line) {
                    // Presentation hint only; the compiler flag chose the
                    // actual syntax.
                    continue;
                }
                if filters.directives {
                    continue;
                }
                out.push(OutputLine::plain(line));
            }
            LineKind::Instruction => {
                dropping_dead_label = false;
                let text = if filters.comment_only {
                    RE_TRAILING_COMMENT.replace(line, "").into_owned()
                } else {
                    line.to_string()
                };
                out.push(OutputLine {
                    text,
                    source: current_source.clone(),
                });
            }
        }
    }

    while out.last().map(|l| l.text.is_empty()).unwrap_or(false) {
        out.pop();
    }
    out
}

fn is_user_file(path: &str, user_file: Option<&str>) -> bool {
    match user_file {
        Some(name) => path == name || path.ends_with(&format!("/{name}")),
        None => false,
    }
}

fn collect_labels(lines: &[&str]) -> HashSet<String> {
    lines
        .iter()
        .filter_map(|l| RE_LABEL_DEF.captures(l))
        .map(|c| c[1].to_string())
        .collect()
}

/// A label is used when an instruction or a directive operand references it
/// textually. Directives are scanned before any stripping so `.globl f` /
/// `.type f, @function` keep function entry labels reachable.
fn collect_used_labels(lines: &[&str], defined: &HashSet<String>) -> HashSet<String> {
    let mut used = HashSet::new();
    for line in lines {
        let kind = classify(line);
        let operands: &str = match kind {
            LineKind::Instruction => line,
            LineKind::LabelDef => {
                // Code may follow the label on the same line.
                match line.split_once(':') {
                    Some((_, rest)) => rest,
                    None => continue,
                }
            }
            LineKind::Directive => match line.trim_start().split_once(char::is_whitespace) {
                // Skip the directive mnemonic itself.
                Some((_, rest)) => rest,
                None => continue,
            },
            _ => continue,
        };
        for token in RE_LABEL_TOKEN.find_iter(operands) {
            if defined.contains(token.as_str()) {
                used.insert(token.as_str().to_string());
            }
        }
    }
    used
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\t.file\t1 \"/tmp/broker-1-0/input.cpp\"\n\
\t.text\n\
\t.globl\tf\n\
\t.type\tf, @function\n\
f:\n\
\t.loc\t1 1\n\
\tmov eax, 42 # answer\n\
\tret\n\
.Ldead:\n\
\t.quad 0\n\
.Lused:\n\
\tjmp .Lused\n";

    fn all_filters() -> FilterSet {
        FilterSet {
            labels: true,
            directives: true,
            comment_only: true,
            intel: true,
            ..Default::default()
        }
    }

    #[test]
    fn maps_instructions_to_user_source() {
        let out = clean(SAMPLE, &FilterSet::default(), Some("input.cpp"));
        let mov = out.iter().find(|l| l.text.contains("mov")).expect("mov");
        assert_eq!(
            mov.source,
            Some(SourceRef {
                file: None,
                line: 1
            })
        );
    }

    #[test]
    fn other_files_keep_their_path() {
        let asm = "\t.file\t2 \"/usr/include/stdio.h\"\n\t.loc\t2 33\n\tcall puts\n";
        let out = clean(asm, &FilterSet::default(), Some("input.cpp"));
        let call = out.iter().find(|l| l.text.contains("call")).expect("call");
        assert_eq!(
            call.source.as_ref().and_then(|s| s.file.as_deref()),
            Some("/usr/include/stdio.h")
        );
    }

    #[test]
    fn strips_unused_labels_and_their_bodies() {
        let out = clean(SAMPLE, &all_filters(), Some("input.cpp"));
        let text: Vec<&str> = out.iter().map(|l| l.text.as_str()).collect();
        assert!(!text.iter().any(|t| t.contains(".Ldead")));
        assert!(!text.iter().any(|t| t.contains(".quad")));
        assert!(text.iter().any(|t| t.contains(".Lused")));
        assert!(text.iter().any(|t| *t == "f:"));
    }

    #[test]
    fn strips_directives_and_comments() {
        let out = clean(SAMPLE, &all_filters(), Some("input.cpp"));
        let text: Vec<&str> = out.iter().map(|l| l.text.as_str()).collect();
        assert!(!text.iter().any(|t| t.contains(".file")));
        assert!(!text.iter().any(|t| t.contains(".text")));
        assert!(text.iter().any(|t| t.trim() == "mov eax, 42"));
    }

    #[test]
    fn keeps_directives_when_filter_off() {
        let out = clean(SAMPLE, &FilterSet::default(), Some("input.cpp"));
        assert!(out.iter().any(|l| l.text.contains(".text")));
    }

    #[test]
    fn drops_syntax_hints_under_intel() {
        let asm = "\t.intel_syntax noprefix\n\tmov eax, 1\n";
        let with_intel = clean(
            asm,
            &FilterSet {
                intel: true,
                ..Default::default()
            },
            None,
        );
        assert!(!with_intel.iter().any(|l| l.text.contains("intel_syntax")));
        let without = clean(asm, &FilterSet::default(), None);
        assert!(without.iter().any(|l| l.text.contains("intel_syntax")));
    }

    #[test]
    fn cleaning_is_deterministic() {
        let filters = all_filters();
        let a = clean(SAMPLE, &filters, Some("input.cpp"));
        let b = clean(SAMPLE, &filters, Some("input.cpp"));
        assert_eq!(a, b);
    }

    #[test]
    fn collapses_blank_runs() {
        let asm = "mov eax, 1\n\n\n\nret\n";
        let out = clean(asm, &FilterSet::default(), None);
        let blanks = out.iter().filter(|l| l.text.is_empty()).count();
        assert_eq!(blanks, 1);
    }
}
