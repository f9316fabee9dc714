// CLASSIFICATION: COMMUNITY
// Filename: cache.rs v0.8
// Author: Lukas Bower
// Date Modified: 2026-04-03

//! Content-addressed result cache with single-flight admission.
//!
//! Keys are SHA-256 fingerprints over the full request (descriptor minus
//! transient fields, source, options, filters). For any key at most one
//! compile is in flight; concurrent requests for the same key block on the
//! pending slot and read the published result. Failed compiles never
//! publish, so the next caller retries.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};

use log::{debug, trace};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::types::{CompileRequest, CompileResult, CompilerDescriptor};
use crate::workspace::Workspace;

/// Deterministic cache key for one request against one descriptor.
///
/// The discovered version string is excluded: it changes across rescans of
/// an unchanged toolchain and must not split the cache.
pub fn fingerprint(desc: &CompilerDescriptor, req: &CompileRequest) -> String {
    let mut desc_value = serde_json::to_value(desc).unwrap_or_default();
    if let Some(obj) = desc_value.as_object_mut() {
        obj.remove("version");
    }
    let payload = serde_json::json!({
        "compiler": desc_value,
        "source": req.source,
        "options": req.user_options,
        "backend": req.backend,
        "filters": req.filters,
    });
    let bytes = serde_json::to_vec(&payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

struct Entry {
    result: Arc<CompileResult>,
    /// Keeps the scratch dir alive while `output_file_path` may be served.
    _workspace: Option<Arc<Workspace>>,
    size: usize,
}

#[derive(Default)]
struct CacheState {
    map: HashMap<String, Entry>,
    order: VecDeque<String>,
    pending: HashSet<String>,
    bytes: usize,
}

pub struct ResultCache {
    state: Mutex<CacheState>,
    cv: Condvar,
    budget: usize,
}

/// Outcome of cache admission for one fingerprint.
pub enum Admission<'a> {
    Hit(Arc<CompileResult>),
    /// Caller owns the compile; the permit must be fulfilled or dropped.
    Build(FlightPermit<'a>),
}

impl ResultCache {
    pub fn new(budget_bytes: usize) -> Self {
        ResultCache {
            state: Mutex::new(CacheState::default()),
            cv: Condvar::new(),
            budget: budget_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up `key`; on miss the caller becomes the single flight for it.
    /// Waiters blocked on a pending slot re-check after publication, and
    /// retry as the new owner when the previous flight failed.
    pub fn admit(&self, key: &str) -> Admission<'_> {
        let mut st = self.lock();
        loop {
            if st.map.contains_key(key) {
                touch(&mut st, key);
                let result = Arc::clone(&st.map[key].result);
                trace!("cache hit {key}");
                return Admission::Hit(result);
            }
            if st.pending.contains(key) {
                st = self.cv.wait(st).unwrap_or_else(|e| e.into_inner());
                continue;
            }
            st.pending.insert(key.to_string());
            trace!("cache miss {key}, single flight claimed");
            return Admission::Build(FlightPermit {
                cache: self,
                key: key.to_string(),
                done: false,
            });
        }
    }

    pub fn entry_count(&self) -> usize {
        self.lock().map.len()
    }

    pub fn byte_size(&self) -> usize {
        self.lock().bytes
    }

    fn publish_locked(&self, st: &mut CacheState, key: &str, entry: Entry) {
        if entry.size > self.budget {
            debug!("entry for {key} exceeds cache budget, not stored");
            return;
        }
        st.bytes += entry.size;
        st.map.insert(key.to_string(), entry);
        st.order.push_back(key.to_string());
        while st.bytes > self.budget {
            let Some(victim) = st.order.pop_front() else {
                break;
            };
            if victim == key {
                // Newest entry stays; approximate LRU tolerates this.
                st.order.push_back(victim);
                if st.order.len() == 1 {
                    break;
                }
                continue;
            }
            if let Some(old) = st.map.remove(&victim) {
                st.bytes -= old.size;
                debug!("evicted {victim} ({} bytes)", old.size);
            }
        }
    }
}

fn touch(st: &mut CacheState, key: &str) {
    if let Some(pos) = st.order.iter().position(|k| k == key) {
        st.order.remove(pos);
        st.order.push_back(key.to_string());
    }
}

/// Exclusive right to compile one fingerprint. Dropping without publishing
/// releases the slot so the next caller retries.
pub struct FlightPermit<'a> {
    cache: &'a ResultCache,
    key: String,
    done: bool,
}

impl FlightPermit<'_> {
    /// Publish the finished result. Only cacheable successes are stored;
    /// everything else just releases the pending slot.
    pub fn publish(mut self, result: &Arc<CompileResult>, workspace: Option<Arc<Workspace>>) {
        let cacheable = result.ok_to_cache && result.status == Some(0);
        let mut st = self.cache.lock();
        st.pending.remove(&self.key);
        if cacheable {
            let size = serde_json::to_vec(result.as_ref())
                .map(|v| v.len())
                .unwrap_or(result.asm.len() * 64);
            self.cache.publish_locked(
                &mut st,
                &self.key,
                Entry {
                    result: Arc::clone(result),
                    _workspace: workspace,
                    size,
                },
            );
        }
        self.done = true;
        drop(st);
        self.cache.cv.notify_all();
    }
}

impl Drop for FlightPermit<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut st = self.cache.lock();
        st.pending.remove(&self.key);
        drop(st);
        self.cache.cv.notify_all();
    }
}
