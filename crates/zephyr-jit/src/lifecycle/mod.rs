//! Compiled-code lifecycle
//!
//! Tracks every committed region from Active through invalidation to
//! release. Retirement is never a direct free: the region is first made
//! unexecutable behind a safepoint handshake, then parked in a deferred
//! queue until a background sweep proves nothing references it. A guard
//! taken for the duration of each execution is the reference the sweep
//! checks, so code can never be unmapped under a running activation.
//!
//! State machine per region:
//! Active -> InvalidationRequested -> SafepointPending -> Invalidated ->
//! DeferredFree -> Freed.

pub mod memory;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::codegen::{encode, CompiledCode, PatchPoint, StackMap};
use crate::config::{EvictionPolicy, JitConfig};
use crate::ir::FuncId;
use memory::{ExecRegion, MemoryError};

/// Marker stored in the diagnostics header of an invalidated region.
pub const INVALIDATION_MAGIC: u32 = 0x5A4A_4954;

/// Opaque identifier for one committed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeHandle(pub u64);

impl std::fmt::Display for CodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Active = 0,
    InvalidationRequested = 1,
    SafepointPending = 2,
    Invalidated = 3,
    DeferredFree = 4,
    Freed = 5,
}

impl LifecycleState {
    fn from_u8(v: u8) -> LifecycleState {
        match v {
            0 => LifecycleState::Active,
            1 => LifecycleState::InvalidationRequested,
            2 => LifecycleState::SafepointPending,
            3 => LifecycleState::Invalidated,
            4 => LifecycleState::DeferredFree,
            _ => LifecycleState::Freed,
        }
    }
}

/// Diagnostics record written when a region is invalidated.
#[derive(Debug, Clone)]
pub struct InvalidationHeader {
    pub magic: u32,
    /// The entry word the trap instruction replaced
    pub original_word: u32,
    pub invalidated_at: SystemTime,
}

/// One committed region and its bookkeeping.
pub struct CodeEntry {
    pub handle: CodeHandle,
    pub func: FuncId,
    region: ExecRegion,
    pub entry_offset: usize,
    pub is_optimized: bool,
    pub stack_maps: Vec<StackMap>,
    pub patch_points: Vec<PatchPoint>,
    state: AtomicU8,
    /// Live activations; the safepoint wait and the sweep read this
    executing: AtomicUsize,
    /// Cross-region references (call edges patched into other code)
    pinned: AtomicUsize,
    /// Milliseconds since manager start, updated on every execution
    last_used: AtomicU64,
    created: Instant,
    header: Mutex<Option<InvalidationHeader>>,
}

impl CodeEntry {
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: LifecycleState) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::Acquire)
    }

    pub fn code_size(&self) -> usize {
        self.region.len()
    }

    pub fn code_ptr(&self) -> *const u8 {
        self.region.as_ptr()
    }

    /// The committed bytes, for emulated execution and diagnostics.
    pub fn code_bytes(&self) -> &[u8] {
        self.region.bytes()
    }

    pub fn read_word(&self, offset: usize) -> Result<u32, MemoryError> {
        self.region.read_word(offset)
    }

    pub fn invalidation_header(&self) -> Option<InvalidationHeader> {
        self.header.lock().clone()
    }

    /// Patch one word; used when relocations are applied after commit.
    pub fn write_word(&self, offset: usize, word: u32) -> Result<(), MemoryError> {
        self.region.write_word(offset, word)
    }

    /// Patch a named offset registered at compile time.
    pub fn patch(&self, name: &str, word: u32) -> Result<bool, MemoryError> {
        let Some(p) = self.patch_points.iter().find(|p| p.name == name) else {
            return Ok(false);
        };
        self.region.write_word(p.offset, word)?;
        Ok(true)
    }
}

/// Keeps the activation count of one entry raised for its lifetime.
pub struct ExecGuard {
    entry: Arc<CodeEntry>,
    safepoint: Arc<(Mutex<()>, Condvar)>,
}

impl ExecGuard {
    pub fn entry(&self) -> &CodeEntry {
        &self.entry
    }
}

impl Drop for ExecGuard {
    fn drop(&mut self) {
        if self.entry.executing.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _held = self.safepoint.0.lock();
            self.safepoint.1.notify_all();
        }
    }
}

struct Deferred {
    handle: CodeHandle,
    due: Instant,
}

enum SweepMsg {
    Retire(Deferred),
    Shutdown,
}

/// Engine-owned registry of all committed regions.
pub struct LifecycleManager {
    table: Arc<DashMap<CodeHandle, Arc<CodeEntry>>>,
    next_handle: AtomicU64,
    epoch: Instant,
    capacity: usize,
    policy: EvictionPolicy,
    grace: Duration,
    safepoint_timeout: Duration,
    /// Bytes held by Active regions; drops at invalidation, not at free
    active_bytes: AtomicUsize,
    freed_count: Arc<AtomicUsize>,
    safepoint: Arc<(Mutex<()>, Condvar)>,
    sweep_tx: Sender<SweepMsg>,
    sweep_stop: Arc<AtomicBool>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleManager {
    pub fn new(config: &JitConfig) -> Self {
        let table: Arc<DashMap<CodeHandle, Arc<CodeEntry>>> = Arc::new(DashMap::new());
        let freed_count = Arc::new(AtomicUsize::new(0));
        let sweep_stop = Arc::new(AtomicBool::new(false));
        let (sweep_tx, sweep_rx) = unbounded();

        let handle = {
            let table = Arc::clone(&table);
            let freed = Arc::clone(&freed_count);
            let stop = Arc::clone(&sweep_stop);
            let interval = Duration::from_millis(config.sweep_interval_ms.max(1));
            let grace = Duration::from_millis(config.grace_period_ms);
            thread::Builder::new()
                .name("zephyr-sweep".to_string())
                .spawn(move || sweep_loop(sweep_rx, table, freed, stop, interval, grace))
        };
        let sweep_handle = match handle {
            Ok(h) => Mutex::new(Some(h)),
            Err(err) => {
                log::error!("failed to spawn sweep thread: {err}");
                Mutex::new(None)
            }
        };

        Self {
            table,
            next_handle: AtomicU64::new(1),
            epoch: Instant::now(),
            capacity: config.code_cache_capacity,
            policy: config.eviction_policy,
            grace: Duration::from_millis(config.grace_period_ms),
            safepoint_timeout: Duration::from_millis(config.safepoint_timeout_ms),
            active_bytes: AtomicUsize::new(0),
            freed_count,
            safepoint: Arc::new((Mutex::new(()), Condvar::new())),
            sweep_tx,
            sweep_stop,
            sweep_handle,
        }
    }

    /// Commit compiled code to executable memory and start tracking it.
    pub fn register(&self, func: FuncId, code: &CompiledCode) -> Result<CodeHandle, MemoryError> {
        let region = ExecRegion::commit(&code.code)?;
        let handle = CodeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(CodeEntry {
            handle,
            func,
            region,
            entry_offset: code.entry_offset,
            is_optimized: code.is_optimized,
            stack_maps: code.stack_maps.clone(),
            patch_points: code.patch_points.clone(),
            state: AtomicU8::new(LifecycleState::Active as u8),
            executing: AtomicUsize::new(0),
            pinned: AtomicUsize::new(0),
            last_used: AtomicU64::new(self.now_ms()),
            created: Instant::now(),
            header: Mutex::new(None),
        });
        self.active_bytes
            .fetch_add(entry.code_size(), Ordering::Relaxed);
        self.table.insert(handle, entry);
        log::debug!("registered {handle} for function {func}");
        self.maybe_evict();
        Ok(handle)
    }

    pub fn entry(&self, handle: CodeHandle) -> Option<Arc<CodeEntry>> {
        self.table.get(&handle).map(|e| Arc::clone(&e))
    }

    pub fn code_size(&self, handle: CodeHandle) -> Option<usize> {
        self.entry(handle).map(|e| e.code_size())
    }

    /// The entry whose code pages cover `addr`, if any.
    pub fn entry_containing(&self, addr: usize) -> Option<Arc<CodeEntry>> {
        self.table
            .iter()
            .find(|e| e.region.contains(addr))
            .map(|e| Arc::clone(&e))
    }

    /// Bytes currently held by Active regions.
    pub fn active_bytes(&self) -> usize {
        self.active_bytes.load(Ordering::Relaxed)
    }

    pub fn freed_count(&self) -> usize {
        self.freed_count.load(Ordering::Relaxed)
    }

    /// Raise the activation count; fails when the code is not Active.
    /// The returned guard keeps the region mapped until dropped.
    pub fn begin_execution(&self, handle: CodeHandle) -> Option<ExecGuard> {
        let entry = self.entry(handle)?;
        entry.executing.fetch_add(1, Ordering::AcqRel);
        // re-check after raising the count so invalidation either sees the
        // activation or has already retired the entry
        if !entry.is_active() {
            if entry.executing.fetch_sub(1, Ordering::AcqRel) == 1 {
                let _held = self.safepoint.0.lock();
                self.safepoint.1.notify_all();
            }
            return None;
        }
        entry.last_used.store(self.now_ms(), Ordering::Relaxed);
        Some(ExecGuard {
            entry,
            safepoint: Arc::clone(&self.safepoint),
        })
    }

    /// Mark/unmark the region as referenced from other committed code.
    pub fn pin(&self, handle: CodeHandle) {
        if let Some(e) = self.entry(handle) {
            e.pinned.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn unpin(&self, handle: CodeHandle) {
        if let Some(e) = self.entry(handle) {
            e.pinned.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Retire a region: safepoint handshake, trap word, execute-disable,
    /// then deferred free. Returns false for unknown or already-retiring
    /// handles. Blocks at most the configured safepoint timeout.
    pub fn invalidate(&self, handle: CodeHandle) -> bool {
        let Some(entry) = self.entry(handle) else {
            return false;
        };
        if !entry.transition(
            LifecycleState::Active,
            LifecycleState::InvalidationRequested,
        ) {
            return false;
        }
        self.active_bytes
            .fetch_sub(entry.code_size(), Ordering::Relaxed);

        if entry.executing() > 0 {
            entry.set_state(LifecycleState::SafepointPending);
            let deadline = Instant::now() + self.safepoint_timeout;
            let mut held = self.safepoint.0.lock();
            while entry.executing() > 0 {
                if self.safepoint.1.wait_until(&mut held, deadline).timed_out() {
                    log::warn!(
                        "safepoint wait for {handle} timed out with {} activations live",
                        entry.executing()
                    );
                    break;
                }
            }
        }

        let original_word = entry.region.read_word(entry.entry_offset).unwrap_or(0);
        if let Err(err) = entry.region.write_word(entry.entry_offset, encode::EBREAK) {
            log::error!("failed to write trap word for {handle}: {err}");
        }
        if let Err(err) = entry.region.seal_readonly() {
            log::error!("failed to seal {handle}: {err}");
        }
        *entry.header.lock() = Some(InvalidationHeader {
            magic: INVALIDATION_MAGIC,
            original_word,
            invalidated_at: SystemTime::now(),
        });
        entry.set_state(LifecycleState::Invalidated);

        entry.set_state(LifecycleState::DeferredFree);
        let deferred = Deferred {
            handle,
            due: Instant::now() + self.grace,
        };
        if self.sweep_tx.send(SweepMsg::Retire(deferred)).is_err() {
            // sweep already gone (shutdown); free synchronously
            self.table.remove(&handle);
            self.freed_count.fetch_add(1, Ordering::Relaxed);
        }
        log::debug!("invalidated {handle}");
        true
    }

    /// Evict Active regions until under capacity, through the normal
    /// invalidation protocol.
    fn maybe_evict(&self) {
        while self.active_bytes() > self.capacity {
            let Some(victim) = self.pick_victim() else {
                break;
            };
            log::debug!("evicting {victim} ({:?})", self.policy);
            if !self.invalidate(victim) {
                break;
            }
        }
    }

    fn pick_victim(&self) -> Option<CodeHandle> {
        let now = self.now_ms();
        let mut best: Option<(CodeHandle, u128)> = None;
        for e in self.table.iter() {
            if !e.is_active() {
                continue;
            }
            let size = e.code_size() as u128;
            let age = now.saturating_sub(e.last_used.load(Ordering::Relaxed)) as u128;
            // higher score evicts first
            let score = match self.policy {
                EvictionPolicy::Lru => age,
                EvictionPolicy::Size => size,
                EvictionPolicy::Hybrid => size * age.max(1),
            };
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((e.handle, score));
            }
        }
        best.map(|(h, _)| h)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Stop the sweep thread and wait for it with a bounded join.
    pub fn shutdown(&self) {
        self.sweep_stop.store(true, Ordering::Release);
        let _ = self.sweep_tx.send(SweepMsg::Shutdown);
        if let Some(handle) = self.sweep_handle.lock().take() {
            let start = Instant::now();
            let timeout = Duration::from_secs(2);
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    return;
                }
                if start.elapsed() > timeout {
                    log::warn!("sweep thread did not stop in time");
                    drop(handle);
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sweep_loop(
    rx: Receiver<SweepMsg>,
    table: Arc<DashMap<CodeHandle, Arc<CodeEntry>>>,
    freed: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    interval: Duration,
    grace: Duration,
) {
    let mut pending: Vec<Deferred> = Vec::new();
    loop {
        match rx.recv_timeout(interval) {
            Ok(SweepMsg::Retire(d)) => pending.push(d),
            Ok(SweepMsg::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if stop.load(Ordering::Acquire) {
            break;
        }

        let now = Instant::now();
        let mut kept = Vec::with_capacity(pending.len());
        for mut d in pending {
            if d.due > now {
                kept.push(d);
                continue;
            }
            let referenced = table
                .get(&d.handle)
                .map(|e| e.executing() > 0 || e.pinned.load(Ordering::Acquire) > 0)
                .unwrap_or(false);
            if referenced {
                log::debug!("{} still referenced, extending grace", d.handle);
                d.due = now + grace;
                kept.push(d);
                continue;
            }
            if let Some((_, entry)) = table.remove(&d.handle) {
                entry.set_state(LifecycleState::Freed);
                freed.fetch_add(1, Ordering::Relaxed);
                log::debug!("freed {}", d.handle);
                // the mapping is released when the last Arc drops
            }
        }
        pending = kept;
    }

    // shutdown: release whatever is no longer referenced, report the rest
    for d in pending {
        let referenced = table
            .get(&d.handle)
            .map(|e| e.executing() > 0 || e.pinned.load(Ordering::Acquire) > 0)
            .unwrap_or(false);
        if referenced {
            log::warn!("{} still referenced at shutdown, leaking region", d.handle);
            continue;
        }
        if let Some((_, entry)) = table.remove(&d.handle) {
            entry.set_state(LifecycleState::Freed);
            freed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::encode as e;

    fn fast_config() -> JitConfig {
        JitConfig {
            grace_period_ms: 10,
            sweep_interval_ms: 5,
            safepoint_timeout_ms: 200,
            ..JitConfig::default()
        }
    }

    fn dummy_code(words: usize) -> CompiledCode {
        let mut code = Vec::new();
        for _ in 0..words {
            code.extend_from_slice(&e::jalr(e::ZERO, e::RA, 0).to_le_bytes());
        }
        CompiledCode {
            code,
            entry_offset: 0,
            relocations: Vec::new(),
            is_optimized: false,
            stack_maps: Vec::new(),
            patch_points: vec![PatchPoint {
                name: "call.0".to_string(),
                offset: 0,
            }],
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_register_and_query() {
        let mgr = LifecycleManager::new(&fast_config());
        let h = mgr.register(FuncId(0), &dummy_code(4)).expect("register");
        assert_eq!(mgr.code_size(h), Some(16));
        assert_eq!(mgr.entry(h).unwrap().state(), LifecycleState::Active);
        assert_eq!(mgr.active_bytes(), 16);
    }

    #[test]
    fn test_invalidate_writes_trap_and_header() {
        let mgr = LifecycleManager::new(&fast_config());
        let h = mgr.register(FuncId(0), &dummy_code(2)).expect("register");
        let entry = mgr.entry(h).unwrap();
        assert!(mgr.invalidate(h));
        assert_eq!(entry.read_word(0).unwrap(), e::EBREAK);
        let header = entry.invalidation_header().expect("header");
        assert_eq!(header.magic, INVALIDATION_MAGIC);
        assert_eq!(header.original_word, e::jalr(e::ZERO, e::RA, 0));
    }

    #[test]
    fn test_invalidate_unknown_handle() {
        let mgr = LifecycleManager::new(&fast_config());
        assert!(!mgr.invalidate(CodeHandle(999)));
    }

    #[test]
    fn test_double_invalidate_is_rejected() {
        let mgr = LifecycleManager::new(&fast_config());
        let h = mgr.register(FuncId(0), &dummy_code(2)).expect("register");
        assert!(mgr.invalidate(h));
        assert!(!mgr.invalidate(h));
    }

    #[test]
    fn test_sweep_frees_after_grace() {
        let mgr = LifecycleManager::new(&fast_config());
        let h = mgr.register(FuncId(0), &dummy_code(2)).expect("register");
        assert!(mgr.invalidate(h));
        assert!(wait_until(|| mgr.entry(h).is_none()));
        assert_eq!(mgr.freed_count(), 1);
    }

    #[test]
    fn test_execution_guard_blocks_free() {
        let mgr = LifecycleManager::new(&fast_config());
        let h = mgr.register(FuncId(0), &dummy_code(2)).expect("register");
        let guard = mgr.begin_execution(h).expect("guard");
        // timeout is short; invalidate proceeds after the warn path
        assert!(mgr.invalidate(h));
        thread::sleep(Duration::from_millis(60));
        // still referenced: the sweep must not have freed it
        assert!(mgr.entry(h).is_some());
        drop(guard);
        assert!(wait_until(|| mgr.entry(h).is_none()));
    }

    #[test]
    fn test_safepoint_wait_resumes_when_guard_drops() {
        let mgr = Arc::new(LifecycleManager::new(&JitConfig {
            safepoint_timeout_ms: 5000,
            ..fast_config()
        }));
        let h = mgr.register(FuncId(0), &dummy_code(2)).expect("register");
        let guard = mgr.begin_execution(h).expect("guard");

        let mgr2 = Arc::clone(&mgr);
        let t = thread::spawn(move || {
            let start = Instant::now();
            assert!(mgr2.invalidate(h));
            start.elapsed()
        });
        thread::sleep(Duration::from_millis(50));
        drop(guard);
        let waited = t.join().expect("join");
        // released well before the 5s timeout
        assert!(waited < Duration::from_secs(2));
    }

    #[test]
    fn test_begin_execution_refuses_retired_code() {
        let mgr = LifecycleManager::new(&fast_config());
        let h = mgr.register(FuncId(0), &dummy_code(2)).expect("register");
        assert!(mgr.invalidate(h));
        assert!(mgr.begin_execution(h).is_none());
    }

    #[test]
    fn test_pinned_entry_survives_sweep() {
        let mgr = LifecycleManager::new(&fast_config());
        let h = mgr.register(FuncId(0), &dummy_code(2)).expect("register");
        mgr.pin(h);
        assert!(mgr.invalidate(h));
        thread::sleep(Duration::from_millis(60));
        assert!(mgr.entry(h).is_some());
        mgr.unpin(h);
        assert!(wait_until(|| mgr.entry(h).is_none()));
    }

    #[test]
    fn test_eviction_routes_through_invalidation() {
        let mgr = LifecycleManager::new(&JitConfig {
            code_cache_capacity: 20,
            eviction_policy: EvictionPolicy::Lru,
            ..fast_config()
        });
        let h1 = mgr.register(FuncId(0), &dummy_code(4)).expect("register");
        thread::sleep(Duration::from_millis(5));
        let _h2 = mgr.register(FuncId(1), &dummy_code(4)).expect("register");
        // 32 bytes active > 20 capacity: the older region is retired
        let retired = mgr
            .entry(h1)
            .map(|e| !e.is_active())
            .unwrap_or(true);
        assert!(retired);
        assert!(mgr.active_bytes() <= 20);
    }

    #[test]
    fn test_patch_point() {
        let mgr = LifecycleManager::new(&fast_config());
        let h = mgr.register(FuncId(0), &dummy_code(2)).expect("register");
        let entry = mgr.entry(h).unwrap();
        assert!(entry.patch("call.0", 0x1234_5678).expect("patch"));
        assert!(!entry.patch("no-such-point", 0).expect("patch"));
        assert_eq!(entry.read_word(0).unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_shutdown_joins_sweep() {
        let mgr = LifecycleManager::new(&fast_config());
        let h = mgr.register(FuncId(0), &dummy_code(2)).expect("register");
        assert!(mgr.invalidate(h));
        mgr.shutdown();
        // idempotent
        mgr.shutdown();
    }
}
