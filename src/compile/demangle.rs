// CLASSIFICATION: COMMUNITY
// Filename: demangle.rs v0.2
// Author: Lukas Bower
// Date Modified: 2026-03-20

//! Symbol demangling via the per-compiler demangler binary.

use std::path::Path;

use anyhow::Result;
use log::warn;

use crate::exec::runner::{self, RunOptions};
use crate::types::OutputLine;

const DEMANGLE_TIMEOUT_MS: u64 = 10_000;

/// Pipe arbitrary text through the demangler (used for the opt-record JSON
/// round trip). Returns the input unchanged when the demangler fails.
pub fn filter_text(demangler: &Path, text: &str, max_output: usize) -> Result<String> {
    let opts = RunOptions {
        timeout_ms: DEMANGLE_TIMEOUT_MS,
        max_output,
        stdin: Some(text.as_bytes().to_vec()),
        ..Default::default()
    };
    let res = runner::run(demangler, &[], &opts)?;
    if res.status == Some(0) && !res.truncated {
        Ok(res.stdout)
    } else {
        warn!("demangler {} exited {:?}", demangler.display(), res.status);
        Ok(text.to_string())
    }
}

/// Demangle the text of every asm line in place, preserving each line's
/// source annotation. A line-count mismatch leaves the lines untouched.
pub fn splice_lines(demangler: &Path, lines: &mut [OutputLine], max_output: usize) -> Result<()> {
    let joined = lines
        .iter()
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let demangled = filter_text(demangler, &joined, max_output)?;
    let new_lines: Vec<&str> = demangled.lines().collect();
    if new_lines.len() != lines.len() {
        warn!(
            "demangler changed line count ({} -> {}), keeping mangled output",
            lines.len(),
            new_lines.len()
        );
        return Ok(());
    }
    for (line, text) in lines.iter_mut().zip(new_lines) {
        line.text = text.to_string();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceRef;
    use std::path::PathBuf;

    fn cat() -> PathBuf {
        PathBuf::from("/bin/cat")
    }

    #[test]
    fn splice_preserves_source_annotations() {
        let mut lines = vec![
            OutputLine {
                text: "_Z1fv:".into(),
                source: None,
            },
            OutputLine {
                text: "\tret".into(),
                source: Some(SourceRef {
                    file: None,
                    line: 1,
                }),
            },
        ];
        splice_lines(&cat(), &mut lines, 64 * 1024).expect("splice");
        assert_eq!(lines[0].text, "_Z1fv:");
        assert_eq!(
            lines[1].source,
            Some(SourceRef {
                file: None,
                line: 1
            })
        );
    }

    #[test]
    fn failing_demangler_keeps_text() {
        let text = filter_text(Path::new("/bin/false"), "_Z1fv", 1024).expect("filter");
        assert_eq!(text, "_Z1fv");
    }
}
