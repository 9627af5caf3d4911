//! Execution profiling and compile gating
//!
//! Per-function call counters decide when a function is hot enough to
//! compile, and a CAS flag guarantees at most one in-flight compilation
//! per function id: racing threads lose the exchange and simply skip.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::ir::FuncId;

/// Call count at which a function becomes a compile candidate.
pub const DEFAULT_HOT_THRESHOLD: u64 = 64;

pub struct FunctionProfile {
    pub func: FuncId,
    calls: AtomicU64,
    compiling: AtomicBool,
    compiled: AtomicBool,
}

impl FunctionProfile {
    fn new(func: FuncId) -> Self {
        Self {
            func,
            calls: AtomicU64::new(0),
            compiling: AtomicBool::new(false),
            compiled: AtomicBool::new(false),
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Claim the single compile slot. The winner must call
    /// `finish_compile` when done.
    pub fn try_start_compile(&self) -> bool {
        self.compiling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_compile(&self, success: bool) {
        if success {
            self.compiled.store(true, Ordering::Release);
        }
        self.compiling.store(false, Ordering::Release);
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.load(Ordering::Acquire)
    }

    /// Reopen the compile slot after the code was invalidated.
    pub fn mark_decompiled(&self) {
        self.compiled.store(false, Ordering::Release);
    }
}

/// Hotspot table; one lock of its own, never held together with the
/// lifecycle tables.
pub struct ProfileTable {
    entries: RwLock<FxHashMap<FuncId, Arc<FunctionProfile>>>,
    hot_threshold: u64,
}

impl ProfileTable {
    pub fn new(hot_threshold: u64) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            hot_threshold: hot_threshold.max(1),
        }
    }

    pub fn profile(&self, func: FuncId) -> Arc<FunctionProfile> {
        if let Some(p) = self.entries.read().get(&func) {
            return Arc::clone(p);
        }
        let mut entries = self.entries.write();
        Arc::clone(
            entries
                .entry(func)
                .or_insert_with(|| Arc::new(FunctionProfile::new(func))),
        )
    }

    /// Count one call; true exactly when this call crosses the hot
    /// threshold for a not-yet-compiled function.
    pub fn record_call(&self, func: FuncId) -> bool {
        let p = self.profile(func);
        let count = p.calls.fetch_add(1, Ordering::Relaxed) + 1;
        count == self.hot_threshold && !p.is_compiled()
    }

    pub fn is_hot(&self, func: FuncId) -> bool {
        self.profile(func).call_count() >= self.hot_threshold
    }
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self::new(DEFAULT_HOT_THRESHOLD)
    }
}
