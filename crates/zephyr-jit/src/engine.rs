//! JIT engine
//!
//! Owns the whole pipeline: verify -> optimize -> phi lowering -> register
//! allocation -> emission -> commit -> relocation, plus execution and
//! retirement of the committed code. All registries (profiles, lifecycle
//! tables, link edges) are engine-owned; there are no process-wide
//! singletons.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::analysis::FlowInfo;
use crate::codegen::{
    lower_phis, patch_pcrel_call, Codegen, CodegenError, CompiledCode, RelocTarget,
};
use crate::config::{JitConfig, OptLevel};
use crate::ir::{verify, Diagnostic, FuncId, Function, Module};
use crate::lifecycle::memory::MemoryError;
use crate::lifecycle::{CodeEntry, CodeHandle, LifecycleManager};
use crate::opt::Optimizer;
use crate::profiling::ProfileTable;
use crate::regalloc;
use crate::runtime::{EmptyResolver, RtValue, RuntimeHelper, SymbolResolver};
#[cfg(not(target_arch = "riscv64"))]
use crate::sim;

#[derive(Debug, Error)]
pub enum JitError {
    #[error("verification failed: {0:?}")]
    Verify(Vec<Diagnostic>),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("{0} is not active")]
    NotActive(CodeHandle),
    #[error("unknown code handle {0}")]
    UnknownCode(CodeHandle),
    #[error("unresolved runtime symbol {0}")]
    UnresolvedSymbol(RuntimeHelper),
    #[error("no compiled code for {0}")]
    UnknownFunction(FuncId),
    #[cfg(not(target_arch = "riscv64"))]
    #[error(transparent)]
    Execution(#[from] sim::SimError),
}

pub struct JitEngine {
    config: JitConfig,
    lifecycle: LifecycleManager,
    profiles: ProfileTable,
    resolver: Arc<dyn SymbolResolver>,
    /// Current code per function id
    installed: Mutex<FxHashMap<FuncId, CodeHandle>>,
    /// Pinned callees per region, released when the region retires
    links: Mutex<FxHashMap<CodeHandle, Vec<CodeHandle>>>,
}

impl JitEngine {
    pub fn new(config: JitConfig, resolver: Arc<dyn SymbolResolver>) -> Self {
        Self {
            lifecycle: LifecycleManager::new(&config),
            profiles: ProfileTable::default(),
            config,
            resolver,
            installed: Mutex::new(FxHashMap::default()),
            links: Mutex::new(FxHashMap::default()),
        }
    }

    /// Engine with the given config and no runtime symbols; functions that
    /// call into the runtime will fail relocation.
    pub fn with_config(config: JitConfig) -> Self {
        Self::new(config, Arc::new(EmptyResolver))
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn profiles(&self) -> &ProfileTable {
        &self.profiles
    }

    /// Compile one function through the full pipeline and commit it.
    pub fn compile(&self, func: &Function) -> Result<CodeHandle, JitError> {
        self.compile_inner(func, None)
    }

    /// Compile with sibling functions visible, enabling inlining.
    pub fn compile_with_module(
        &self,
        func: &Function,
        module: &Module,
    ) -> Result<CodeHandle, JitError> {
        self.compile_inner(func, Some(module))
    }

    fn compile_inner(
        &self,
        func: &Function,
        module: Option<&Module>,
    ) -> Result<CodeHandle, JitError> {
        let diagnostics = verify(func);
        if !diagnostics.is_empty() {
            return Err(JitError::Verify(diagnostics));
        }

        let level = self.config.opt_level;
        let mut work = func.clone();
        if level > OptLevel::None {
            Optimizer::for_level(level, self.config.inline_threshold, self.config.vector_width)
                .optimize(&mut work, module);
        }
        lower_phis(&mut work);
        let flow = FlowInfo::compute(&mut work);
        let alloc = regalloc::for_level(level).allocate(&work, &flow);
        let code = Codegen::new(&work, &alloc, self.config.vector_width, level > OptLevel::None)
            .emit()?;
        log::debug!(
            "compiled {} at {:?}: {} bytes, {} relocations",
            func.name,
            level,
            code.code.len(),
            code.relocations.len()
        );

        let handle = self.lifecycle.register(func.id, &code)?;
        if let Err(err) = self.link(handle, &code, func.id) {
            self.lifecycle.invalidate(handle);
            return Err(err);
        }

        let previous = self.installed.lock().insert(func.id, handle);
        if let Some(old) = previous {
            if old != handle {
                self.lifecycle.invalidate(old);
                self.release_links(old);
            }
        }
        Ok(handle)
    }

    /// Resolve and patch every call-pair relocation now that the region
    /// address is final. Cross-region callees are pinned for as long as
    /// this region stays installed.
    fn link(&self, handle: CodeHandle, code: &CompiledCode, self_id: FuncId) -> Result<(), JitError> {
        let entry = self
            .lifecycle
            .entry(handle)
            .ok_or(JitError::UnknownCode(handle))?;
        let base = entry.code_ptr() as u64;
        let mut pinned = Vec::new();

        for reloc in &code.relocations {
            let target = match reloc.target {
                RelocTarget::Helper(h) => self
                    .resolver
                    .resolve(h)
                    .ok_or(JitError::UnresolvedSymbol(h))? as u64,
                RelocTarget::Func(fid) if fid == self_id => base + entry.entry_offset as u64,
                RelocTarget::Func(fid) => {
                    let dep = self
                        .installed
                        .lock()
                        .get(&fid)
                        .copied()
                        .ok_or(JitError::UnknownFunction(fid))?;
                    let dep_entry = self
                        .lifecycle
                        .entry(dep)
                        .ok_or(JitError::UnknownFunction(fid))?;
                    self.lifecycle.pin(dep);
                    pinned.push(dep);
                    dep_entry.code_ptr() as u64 + dep_entry.entry_offset as u64
                }
                RelocTarget::Address(a) => a,
            };
            let pc = base + (reloc.word * 4) as u64;
            let pcrel = (target as i64)
                .wrapping_sub(pc as i64)
                .wrapping_add(reloc.addend);
            let mut pair = [0u32; 2];
            patch_pcrel_call(&mut pair, 0, pcrel)?;
            entry.write_word(reloc.word * 4, pair[0])?;
            entry.write_word(reloc.word * 4 + 4, pair[1])?;
        }

        self.links.lock().insert(handle, pinned);
        Ok(())
    }

    fn release_links(&self, handle: CodeHandle) {
        let pinned = self.links.lock().remove(&handle).unwrap_or_default();
        for dep in pinned {
            self.lifecycle.unpin(dep);
        }
    }

    /// Execute committed code with the entry ABI. Fails unless the code is
    /// Active; the activation is visible to invalidation for its duration.
    pub fn execute(&self, handle: CodeHandle, args: &[RtValue]) -> Result<RtValue, JitError> {
        let Some(guard) = self.lifecycle.begin_execution(handle) else {
            return Err(if self.lifecycle.entry(handle).is_some() {
                JitError::NotActive(handle)
            } else {
                JitError::UnknownCode(handle)
            });
        };
        self.profiles.record_call(guard.entry().func);
        self.run_entry(guard.entry(), args)
    }

    #[cfg(target_arch = "riscv64")]
    fn run_entry(&self, entry: &CodeEntry, args: &[RtValue]) -> Result<RtValue, JitError> {
        // SAFETY: the region holds relocated code emitted for this ABI and
        // the execution guard keeps it mapped
        let f: crate::runtime::EntryFn =
            unsafe { std::mem::transmute(entry.code_ptr().add(entry.entry_offset)) };
        Ok(f(args.as_ptr(), args.len()))
    }

    #[cfg(not(target_arch = "riscv64"))]
    fn run_entry(&self, entry: &CodeEntry, args: &[RtValue]) -> Result<RtValue, JitError> {
        Ok(self.run_emulated(entry, args)?)
    }

    /// Emulated execution: calls leaving the region either land in another
    /// committed region (dispatched recursively) or in a host function
    /// supplied by the symbol resolver.
    #[cfg(not(target_arch = "riscv64"))]
    fn run_emulated(&self, entry: &CodeEntry, args: &[RtValue]) -> Result<RtValue, sim::SimError> {
        let hook = |addr: u64, a: [u64; 6]| -> u64 {
            if let Some(callee) = self.lifecycle.entry_containing(addr as usize) {
                // SAFETY: generated callers pass a0 = argument array base,
                // a1 = length, per the entry ABI
                let call_args =
                    unsafe { std::slice::from_raw_parts(a[0] as *const RtValue, a[1] as usize) };
                match self.run_emulated(&callee, call_args) {
                    Ok(v) => v.0 as u64,
                    Err(err) => {
                        log::error!("nested execution of {} failed: {err}", callee.handle);
                        0
                    }
                }
            } else {
                // SAFETY: the address came out of a relocation resolved by
                // the host's symbol table
                let f: extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64 =
                    unsafe { std::mem::transmute(addr as usize) };
                f(a[0], a[1], a[2], a[3], a[4], a[5])
            }
        };
        sim::execute(entry.code_bytes(), entry.entry_offset, args, &hook)
    }

    /// Retire the code behind a safepoint handshake; see the lifecycle
    /// module for the full protocol.
    pub fn invalidate(&self, handle: CodeHandle) -> Result<(), JitError> {
        let entry = self
            .lifecycle
            .entry(handle)
            .ok_or(JitError::UnknownCode(handle))?;
        let func = entry.func;
        self.lifecycle.invalidate(handle);
        self.release_links(handle);
        let mut installed = self.installed.lock();
        if installed.get(&func) == Some(&handle) {
            installed.remove(&func);
        }
        drop(installed);
        self.profiles.profile(func).mark_decompiled();
        Ok(())
    }

    pub fn code_size(&self, handle: CodeHandle) -> Option<usize> {
        self.lifecycle.code_size(handle)
    }

    pub fn installed_code(&self, func: FuncId) -> Option<CodeHandle> {
        self.installed.lock().get(&func).copied()
    }

    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, Callee, Instr, IrType, Terminator, Value};
    use crate::runtime::TableResolver;

    fn engine(level: OptLevel) -> JitEngine {
        JitEngine::with_config(JitConfig {
            opt_level: level,
            ..JitConfig::default()
        })
    }

    fn add2() -> Function {
        let mut f = Function::new(
            FuncId(0),
            "add2",
            vec![IrType::Int64, IrType::Int64],
            IrType::Int64,
        );
        let r = f.alloc_vreg(IrType::Int64);
        let entry = f.entry;
        f.add_instr(
            entry,
            Instr::Bin {
                op: BinOp::IntAdd,
                dest: r,
                lhs: Value::Arg(0),
                rhs: Value::Arg(1),
            },
        );
        f.set_terminator(
            entry,
            Terminator::Ret {
                value: Some(Value::Reg(r)),
            },
        );
        f
    }

    #[test]
    fn test_compile_and_execute() {
        let eng = engine(OptLevel::None);
        let h = eng.compile(&add2()).expect("compile");
        let got = eng.execute(h, &[RtValue(7), RtValue(35)]).expect("run");
        assert_eq!(got.as_i64(), 42);
    }

    #[test]
    fn test_optimized_tier_agrees() {
        let eng = engine(OptLevel::Aggressive);
        let h = eng.compile(&add2()).expect("compile");
        let got = eng.execute(h, &[RtValue(-5), RtValue(6)]).expect("run");
        assert_eq!(got.as_i64(), 1);
    }

    #[test]
    fn test_verify_failure_refused() {
        let mut f = add2();
        let dangling = f.add_block();
        f.set_terminator(f.entry, Terminator::Jump { target: dangling });
        // dangling block keeps Terminator::None
        let eng = engine(OptLevel::None);
        assert!(matches!(eng.compile(&f), Err(JitError::Verify(_))));
    }

    #[test]
    fn test_execute_unknown_handle() {
        let eng = engine(OptLevel::None);
        assert!(matches!(
            eng.execute(CodeHandle(404), &[]),
            Err(JitError::UnknownCode(_))
        ));
    }

    #[test]
    fn test_invalidated_code_refuses_execution() {
        let eng = engine(OptLevel::None);
        let h = eng.compile(&add2()).expect("compile");
        eng.invalidate(h).expect("invalidate");
        assert!(matches!(
            eng.execute(h, &[RtValue(1), RtValue(2)]),
            Err(JitError::NotActive(_))
        ));
        assert_eq!(eng.installed_code(FuncId(0)), None);
    }

    #[test]
    fn test_code_size_reported() {
        let eng = engine(OptLevel::None);
        let h = eng.compile(&add2()).expect("compile");
        assert!(eng.code_size(h).unwrap_or(0) > 0);
        assert_eq!(eng.code_size(CodeHandle(404)), None);
    }

    #[test]
    fn test_recompile_replaces_installed_code() {
        let eng = engine(OptLevel::None);
        let h1 = eng.compile(&add2()).expect("compile");
        let h2 = eng.compile(&add2()).expect("recompile");
        assert_ne!(h1, h2);
        assert_eq!(eng.installed_code(FuncId(0)), Some(h2));
        // the old region is retired, not freed under us
        assert!(matches!(
            eng.execute(h1, &[RtValue(1), RtValue(2)]),
            Err(_)
        ));
        assert_eq!(
            eng.execute(h2, &[RtValue(1), RtValue(2)]).expect("run").as_i64(),
            3
        );
    }

    extern "C" fn fake_alloc(size: u64, _b: u64, _c: u64, _d: u64, _e: u64, _f: u64) -> u64 {
        size + 0x100
    }

    fn heap_alloc_func() -> Function {
        let mut f = Function::new(FuncId(0), "alloc", vec![], IrType::Object);
        let p = f.alloc_vreg(IrType::Object);
        let entry = f.entry;
        f.add_instr(entry, Instr::HeapAlloc { dest: p, size: 32 });
        f.set_terminator(
            entry,
            Terminator::Ret {
                value: Some(Value::Reg(p)),
            },
        );
        f
    }

    #[test]
    fn test_runtime_helper_resolved_and_called() {
        let mut table = TableResolver::new();
        table.register(RuntimeHelper::AllocObject, fake_alloc as usize);
        let eng = JitEngine::new(
            JitConfig {
                opt_level: OptLevel::None,
                ..JitConfig::default()
            },
            Arc::new(table),
        );
        let h = eng.compile(&heap_alloc_func()).expect("compile");
        let got = eng.execute(h, &[]).expect("run");
        assert_eq!(got.as_i64(), 32 + 0x100);
    }

    #[test]
    fn test_unresolved_symbol_fails_compile() {
        let eng = engine(OptLevel::None);
        let err = eng.compile(&heap_alloc_func()).unwrap_err();
        assert!(matches!(err, JitError::UnresolvedSymbol(_)));
    }

    #[test]
    fn test_cross_function_call() {
        // g(a) = a + 1, f(a) = g(a) * 2
        let mut g = Function::new(FuncId(1), "g", vec![IrType::Int64], IrType::Int64);
        let gr = g.alloc_vreg(IrType::Int64);
        let ge = g.entry;
        g.add_instr(
            ge,
            Instr::Bin {
                op: BinOp::IntAdd,
                dest: gr,
                lhs: Value::Arg(0),
                rhs: Value::ConstInt(1),
            },
        );
        g.set_terminator(
            ge,
            Terminator::Ret {
                value: Some(Value::Reg(gr)),
            },
        );

        let mut f = Function::new(FuncId(0), "f", vec![IrType::Int64], IrType::Int64);
        let fc = f.alloc_vreg(IrType::Int64);
        let fr = f.alloc_vreg(IrType::Int64);
        let fe = f.entry;
        f.add_instr(
            fe,
            Instr::Call {
                dest: Some(fc),
                callee: Callee::Func(FuncId(1)),
                args: vec![Value::Arg(0)],
            },
        );
        f.add_instr(
            fe,
            Instr::Bin {
                op: BinOp::IntMul,
                dest: fr,
                lhs: Value::Reg(fc),
                rhs: Value::ConstInt(2),
            },
        );
        f.set_terminator(
            fe,
            Terminator::Ret {
                value: Some(Value::Reg(fr)),
            },
        );

        let eng = engine(OptLevel::None);
        eng.compile(&g).expect("compile g");
        let hf = eng.compile(&f).expect("compile f");
        let got = eng.execute(hf, &[RtValue(20)]).expect("run");
        assert_eq!(got.as_i64(), 42);
    }

    #[test]
    fn test_calling_uncompiled_function_fails_link() {
        let mut f = Function::new(FuncId(0), "f", vec![], IrType::Int64);
        let r = f.alloc_vreg(IrType::Int64);
        let fe = f.entry;
        f.add_instr(
            fe,
            Instr::Call {
                dest: Some(r),
                callee: Callee::Func(FuncId(9)),
                args: vec![],
            },
        );
        f.set_terminator(
            fe,
            Terminator::Ret {
                value: Some(Value::Reg(r)),
            },
        );
        let eng = engine(OptLevel::None);
        assert!(matches!(
            eng.compile(&f),
            Err(JitError::UnknownFunction(FuncId(9)))
        ));
    }
}
