//! Zephyr native JIT backend
//!
//! Takes verified IR for a hot function and turns it into executable
//! RV64 machine code held in guard-paged memory, then manages that code
//! until it is safely retired. The pipeline:
//!
//! 1. [`ir`]: typed SSA-ish IR over an arena of basic blocks
//! 2. [`analysis`]: CFG orders, dominators, loops, liveness
//! 3. [`opt`]: bounded fixed-point pass pipeline, tiered by [`config::OptLevel`]
//! 4. [`regalloc`]: naive, linear-scan, and graph-coloring allocators
//! 5. [`codegen`]: instruction selection, encoding, relocation, stack maps
//! 6. [`lifecycle`]: W^X commit, safepoint invalidation, deferred free
//!
//! [`engine::JitEngine`] wires the stages together and is the intended
//! entry point; everything else is public for hosts that need to drive a
//! stage directly. On non-riscv64 hosts, execution goes through the
//! instruction emulator in [`sim`].

pub mod analysis;
pub mod codegen;
pub mod config;
pub mod engine;
pub mod ir;
pub mod lifecycle;
pub mod opt;
pub mod profiling;
pub mod regalloc;
pub mod runtime;
#[cfg(not(target_arch = "riscv64"))]
pub mod sim;

pub use config::{EvictionPolicy, JitConfig, OptLevel};
pub use engine::{JitEngine, JitError};
pub use lifecycle::{CodeHandle, LifecycleState};
pub use runtime::{RtValue, RuntimeHelper, SymbolResolver};
