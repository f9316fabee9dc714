// CLASSIFICATION: COMMUNITY
// Filename: args.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-01-28

//! Compiler argument assembly.

use std::path::Path;

use crate::types::{BackendOptions, CompilerDescriptor, FilterSet};

/// Translate one request into the compiler's argument vector.
///
/// Order matters: debug info and output path first, then the presentation
/// flags, then the descriptor defaults, the user's options and the input
/// file, with the opt-record switch last.
pub fn build_argv(
    desc: &CompilerDescriptor,
    filters: &FilterSet,
    backend: &BackendOptions,
    user_options: &[String],
    input: &Path,
    output: &Path,
) -> Vec<String> {
    let mut argv: Vec<String> = vec!["-g".into(), "-o".into(), output.display().to_string()];
    if filters.intel && !filters.binary {
        if let Some(flag) = &desc.intel_asm_flag {
            argv.push(flag.clone());
        }
    }
    if filters.binary {
        if !filters.link {
            argv.push("-c".into());
        }
    } else {
        argv.push("-S".into());
    }
    argv.extend(desc.default_options.iter().cloned());
    argv.extend(user_options.iter().cloned());
    argv.push(input.display().to_string());
    if backend.produce_opt_info && desc.supports_opt_record {
        if let Some(flag) = &desc.opt_flag {
            argv.push(flag.clone());
        }
    }
    argv
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn desc() -> CompilerDescriptor {
        CompilerDescriptor {
            id: "clang".into(),
            exe: Some(PathBuf::from("/usr/bin/clang")),
            intel_asm_flag: Some("-masm=intel".into()),
            opt_flag: Some("-fsave-optimization-record".into()),
            default_options: vec!["-Wall".into()],
            supports_opt_record: true,
            ..Default::default()
        }
    }

    fn argv_for(filters: FilterSet, backend: BackendOptions) -> Vec<String> {
        build_argv(
            &desc(),
            &filters,
            &backend,
            &["-O2".into()],
            Path::new("input.cpp"),
            Path::new("output.s"),
        )
    }

    #[test]
    fn default_assembly_mode() {
        let argv = argv_for(FilterSet::default(), BackendOptions::default());
        assert_eq!(
            argv,
            vec!["-g", "-o", "output.s", "-S", "-Wall", "-O2", "input.cpp"]
        );
    }

    #[test]
    fn intel_flag_only_without_binary() {
        let argv = argv_for(
            FilterSet {
                intel: true,
                ..Default::default()
            },
            BackendOptions::default(),
        );
        assert!(argv.contains(&"-masm=intel".to_string()));

        let argv = argv_for(
            FilterSet {
                intel: true,
                binary: true,
                ..Default::default()
            },
            BackendOptions::default(),
        );
        assert!(!argv.contains(&"-masm=intel".to_string()));
    }

    #[test]
    fn binary_without_link_compiles_to_object() {
        let argv = argv_for(
            FilterSet {
                binary: true,
                ..Default::default()
            },
            BackendOptions::default(),
        );
        assert!(argv.contains(&"-c".to_string()));
        assert!(!argv.contains(&"-S".to_string()));
    }

    #[test]
    fn binary_with_link_omits_both() {
        let argv = argv_for(
            FilterSet {
                binary: true,
                link: true,
                ..Default::default()
            },
            BackendOptions::default(),
        );
        assert!(!argv.contains(&"-c".to_string()));
        assert!(!argv.contains(&"-S".to_string()));
    }

    #[test]
    fn opt_record_flag_comes_last() {
        let argv = argv_for(
            FilterSet::default(),
            BackendOptions {
                produce_opt_info: true,
                ..Default::default()
            },
        );
        assert_eq!(argv.last().unwrap(), "-fsave-optimization-record");
    }
}
