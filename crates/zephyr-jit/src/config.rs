//! Engine configuration

use serde::{Deserialize, Serialize};

/// Optimization tier. Selects the optimizer pass set and the register
/// allocation algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptLevel {
    /// No IR rewriting, naive register allocation
    None,
    /// Constant folding and dead-code elimination, linear-scan allocation
    Minimal,
    /// Adds value numbering, CSE, strength reduction, LICM, specialization
    Balanced,
    /// All passes including inlining, escape analysis, vectorization;
    /// graph-coloring allocation
    Aggressive,
}

/// Eviction policy for the code cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Least recently executed first
    Lru,
    /// Largest region first
    Size,
    /// Score = size * age
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitConfig {
    pub opt_level: OptLevel,
    /// Callee instruction-count ceiling for inlining
    pub inline_threshold: usize,
    /// Lanes per vector operation
    pub vector_width: u32,
    /// Code-cache capacity in bytes; eviction starts above this
    pub code_cache_capacity: usize,
    pub eviction_policy: EvictionPolicy,
    /// Minimum time a retired region sits in the deferred-free queue
    pub grace_period_ms: u64,
    /// Background sweep wake interval
    pub sweep_interval_ms: u64,
    /// Bounded wait for safepoint acknowledgement during invalidation
    pub safepoint_timeout_ms: u64,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Balanced,
            inline_threshold: 24,
            vector_width: 4,
            code_cache_capacity: 32 * 1024 * 1024,
            eviction_policy: EvictionPolicy::Lru,
            grace_period_ms: 100,
            sweep_interval_ms: 50,
            safepoint_timeout_ms: 1000,
        }
    }
}
