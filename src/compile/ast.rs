// CLASSIFICATION: COMMUNITY
// Filename: ast.rs v0.5
// Author: Lukas Bower
// Date Modified: 2026-06-01

//! Clang AST dump filtering.
//!
//! `-ast-dump` prints the whole translation unit including everything the
//! headers dragged in. Only top-level declarations originating from the
//! user's source survive; the file tracker follows clang's convention that
//! a location without a file component refers to the most recently named
//! file, and `<invalid sloc>` must not flip that tracker.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s0x[0-9a-fA-F]+").expect("address regex"));
static RE_LOCATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^>]*)>").expect("location regex"));

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tracker {
    UserFile,
    OtherFile,
    Unknown,
}

/// Keep only user-source top-level declarations, scrubbing node addresses
/// and invalid-sloc markers.
pub fn filter_dump(raw: &str, input_file: &str) -> String {
    let mut tracker = Tracker::Unknown;
    let mut keeping = false;
    let mut out: Vec<String> = Vec::new();

    for line in raw.lines() {
        let top_level = line.starts_with("|-") || line.starts_with("`-");
        if top_level {
            keeping = keep_node(line, input_file, &mut tracker);
        } else if !line.starts_with(' ') && !line.starts_with('|') && !line.starts_with('`') {
            // TranslationUnitDecl root and similar headers.
            keeping = false;
            continue;
        }
        if keeping {
            let cleaned = RE_ADDRESS.replace_all(line, "");
            let cleaned = cleaned.replace("<invalid sloc>", "").replace(" <> ", " ");
            out.push(cleaned);
        }
    }
    let mut text = out.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}

/// Decide whether one top-level node belongs to the user's source, updating
/// the most-recent-file tracker as locations name files.
fn keep_node(line: &str, input_file: &str, tracker: &mut Tracker) -> bool {
    let Some(caps) = RE_LOCATION.captures(line) else {
        return false;
    };
    let loc = &caps[1];
    if loc.contains("invalid sloc") {
        // No location information; never a user decl, tracker unchanged.
        return false;
    }
    if loc.contains(input_file) {
        *tracker = Tracker::UserFile;
        return true;
    }
    if loc.contains('/') || loc.contains("built-in") || loc.contains('<') {
        *tracker = Tracker::OtherFile;
        return false;
    }
    // `line:...` / `col:...` locations inherit the tracked file.
    *tracker == Tracker::UserFile
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "TranslationUnitDecl 0x1000 <<invalid sloc>> <invalid sloc>\n\
|-TypedefDecl 0x1010 <<invalid sloc>> <invalid sloc> implicit __int128_t '__int128'\n\
|-FunctionDecl 0x1020 </usr/include/stdio.h:100:1, col:40> col:12 puts 'int (const char *)'\n\
|-FunctionDecl 0x1030 <input.cpp:1:1, line:3:1> line:1:5 f 'int ()'\n\
| `-CompoundStmt 0x1040 <col:9, line:3:1>\n\
`-FunctionDecl 0x1050 <line:5:1, line:7:1> line:5:5 g 'int ()'\n";

    #[test]
    fn keeps_user_functions_drops_headers() {
        let out = filter_dump(DUMP, "input.cpp");
        assert!(out.contains("f 'int ()'"));
        assert!(out.contains("CompoundStmt"));
        assert!(!out.contains("puts"));
        assert!(!out.contains("stdio.h"));
    }

    #[test]
    fn line_only_locations_follow_the_tracker() {
        let out = filter_dump(DUMP, "input.cpp");
        // g has no file in its location; the most recent file is input.cpp.
        assert!(out.contains("g 'int ()'"));
    }

    #[test]
    fn invalid_sloc_does_not_flip_the_tracker() {
        let dump = "|-FunctionDecl 0x1 <input.cpp:1:1> col:5 f 'int ()'\n\
|-TypedefDecl 0x2 <<invalid sloc>> <invalid sloc> implicit x\n\
|-FunctionDecl 0x3 <line:9:1> col:5 h 'int ()'\n";
        let out = filter_dump(dump, "input.cpp");
        assert!(out.contains("h 'int ()'"));
        assert!(!out.contains("implicit x"));
    }

    #[test]
    fn addresses_are_scrubbed() {
        let out = filter_dump(DUMP, "input.cpp");
        assert!(!out.contains("0x10"));
    }
}
