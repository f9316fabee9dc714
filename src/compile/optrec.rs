// CLASSIFICATION: COMMUNITY
// Filename: optrec.rs v0.4
// Author: Lukas Bower
// Date Modified: 2026-06-08

//! LLVM optimization record parsing.
//!
//! `-fsave-optimization-record` writes a multi-document YAML stream next
//! to the output file, one tagged document per remark (`!Passed`,
//! `!Missed`, `!Analysis`). Only remarks whose debug location names the
//! compile input are kept.

use anyhow::Result;
use serde::Deserialize;
use serde_yaml::Value;

use crate::types::{DebugLoc, OptRecord};

/// Parse the YAML stream, keeping records located in `input_file`.
pub fn parse(yaml: &str, input_file: &str) -> Result<Vec<OptRecord>> {
    let mut records = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(yaml) {
        let value = match Value::deserialize(doc) {
            Ok(v) => v,
            // One malformed document degrades to skipping it, not failure.
            Err(_) => continue,
        };
        let Value::Tagged(tagged) = value else {
            continue;
        };
        let kind = tagged.tag.to_string().trim_start_matches('!').to_string();
        let Value::Mapping(body) = tagged.value else {
            continue;
        };
        let get_str = |key: &str| -> Option<String> {
            body.get(&Value::from(key))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let debug_loc = body
            .get(&Value::from("DebugLoc"))
            .and_then(|v| v.as_mapping())
            .and_then(|m| {
                Some(DebugLoc {
                    file: m.get(&Value::from("File"))?.as_str()?.to_string(),
                    line: m.get(&Value::from("Line"))?.as_u64()? as u32,
                    column: m.get(&Value::from("Column"))?.as_u64()? as u32,
                })
            });
        let matches_input = debug_loc
            .as_ref()
            .map(|loc| loc.file.contains(input_file))
            .unwrap_or(false);
        if !matches_input {
            continue;
        }
        records.push(OptRecord {
            kind,
            pass: get_str("Pass").unwrap_or_default(),
            name: get_str("Name").unwrap_or_default(),
            function: get_str("Function"),
            debug_loc,
            display_string: display_string(&body),
        });
    }
    Ok(records)
}

/// Flatten the `Args` list into the human-readable remark text, the way
/// the remark printer would.
fn display_string(body: &serde_yaml::Mapping) -> String {
    let Some(Value::Sequence(args)) = body.get(&Value::from("Args")) else {
        return String::new();
    };
    let mut text = String::new();
    for arg in args {
        let Value::Mapping(m) = arg else { continue };
        for (_key, val) in m {
            match val {
                Value::String(s) => text.push_str(s),
                Value::Number(n) => text.push_str(&n.to_string()),
                _ => {}
            }
            // Only the first scalar per arg mapping contributes.
            break;
        }
    }
    text
}
