// CLASSIFICATION: COMMUNITY
// Filename: workspace.rs v0.5
// Author: Lukas Bower
// Date Modified: 2026-02-25

//! Scratch directory management for in-flight compiles.
//!
//! Every compile owns one unique directory under the temp root. Retention
//! is keyed on the `Arc<Workspace>` handle: cache entries that back a
//! binary download keep theirs alive, everything else is removed on drop.
//! A periodic sweeper clears leftovers (crashed runs, leaked dirs) but
//! only while no compile is in flight.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};

const DIR_PREFIX: &str = "broker-";

pub struct Workspace {
    dir: PathBuf,
    input: PathBuf,
    output: PathBuf,
}

impl Workspace {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    /// Path of the opt-record sibling emitted next to the output file.
    pub fn opt_path(&self) -> PathBuf {
        self.output.with_extension("opt.yaml")
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.dir) {
            // The sweeper picks it up later.
            debug!("workspace {} left for sweeper: {err}", self.dir.display());
        }
    }
}

/// Decrements the in-flight count when the compile finishes.
pub struct CompileGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for CompileGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkspaceAllocator {
    root: PathBuf,
    seq: AtomicU64,
    live: Mutex<Vec<Weak<Workspace>>>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkspaceAllocator {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("create temp root {}", root.display()))?;
        Ok(WorkspaceAllocator {
            root,
            seq: AtomicU64::new(0),
            live: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Create a fresh scratch directory with reserved input/output names.
    pub fn allocate(&self, input_ext: &str) -> Result<Arc<Workspace>> {
        let name = format!(
            "{DIR_PREFIX}{}-{}",
            std::process::id(),
            self.seq.fetch_add(1, Ordering::SeqCst)
        );
        let dir = self.root.join(name);
        fs::create_dir(&dir).with_context(|| format!("create workspace {}", dir.display()))?;
        let ws = Arc::new(Workspace {
            input: dir.join(format!("input.{input_ext}")),
            output: dir.join("output.s"),
            dir,
        });
        if let Ok(mut live) = self.live.lock() {
            live.retain(|w| w.strong_count() > 0);
            live.push(Arc::downgrade(&ws));
        }
        Ok(ws)
    }

    /// Mark a compile as in flight for the duration of the returned guard.
    pub fn compile_guard(&self) -> CompileGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        CompileGuard {
            counter: Arc::clone(&self.in_flight),
        }
    }

    pub fn compiles_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Remove unreferenced scratch directories. Skipped entirely while any
    /// compile is in flight.
    pub fn sweep(&self) {
        if self.compiles_in_flight() > 0 {
            debug!("sweep skipped, compiles in flight");
            return;
        }
        let keep: HashSet<PathBuf> = match self.live.lock() {
            Ok(mut live) => {
                live.retain(|w| w.strong_count() > 0);
                live.iter()
                    .filter_map(|w| w.upgrade())
                    .map(|ws| ws.dir.clone())
                    .collect()
            }
            Err(_) => return,
        };
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("sweep cannot read {}: {err}", self.root.display());
                return;
            }
        };
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let is_scratch = name
                .to_str()
                .map(|n| n.starts_with(DIR_PREFIX))
                .unwrap_or(false);
            if !is_scratch || keep.contains(&path) {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(err) => warn!("sweep failed for {}: {err}", path.display()),
            }
        }
        if removed > 0 {
            info!("swept {removed} stale workspace dirs");
        }
    }

    /// Launch the periodic sweeper; an interval of zero disables it.
    pub fn start_sweeper(self: &Arc<Self>, interval_secs: u64) {
        if interval_secs == 0 {
            return;
        }
        let alloc = Arc::clone(self);
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_secs(interval_secs));
            alloc.sweep();
        });
    }
}
