//! Runtime interface for generated code
//!
//! Compiled code talks to the host VM through a fixed set of named entry
//! points resolved at relocation time, and through a tagged-value ABI for
//! arguments and results.

use std::fmt;

/// A tagged runtime value as passed across the compiled-code boundary.
///
/// The host VM defines the tagging scheme; this backend only moves values
/// around. The representation is a single machine word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct RtValue(pub i64);

impl RtValue {
    pub const NULL: RtValue = RtValue(0);

    pub fn from_i64(v: i64) -> Self {
        RtValue(v)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }
}

/// Signature of a compiled function: pointer to the argument array and its
/// length in, one tagged value out.
pub type EntryFn = extern "C" fn(*const RtValue, usize) -> RtValue;

/// Runtime helper functions that generated code may call.
///
/// These are resolved to concrete addresses during relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeHelper {
    /// Allocate a heap object (size in bytes -> pointer)
    AllocObject,
    /// GC write barrier (object, field address)
    WriteBarrier,
    /// Check a value's runtime type (value, expected tag -> bool)
    TypeCheck,
    /// Load a property from an object (object, key id -> value)
    PropertyGet,
    /// Store a property on an object (object, key id, value)
    PropertySet,
    /// Call a dynamically-resolved function (callee, args ptr, argc -> value)
    CallTrampoline,
    /// Throw a runtime exception (error value, does not return)
    ThrowException,
    /// Array bounds check (array, index)
    BoundsCheck,
}

impl RuntimeHelper {
    /// All helpers, in stable order.
    pub const ALL: [RuntimeHelper; 8] = [
        RuntimeHelper::AllocObject,
        RuntimeHelper::WriteBarrier,
        RuntimeHelper::TypeCheck,
        RuntimeHelper::PropertyGet,
        RuntimeHelper::PropertySet,
        RuntimeHelper::CallTrampoline,
        RuntimeHelper::ThrowException,
        RuntimeHelper::BoundsCheck,
    ];

    /// Stable symbol name used in relocation records and diagnostics.
    pub fn symbol(&self) -> &'static str {
        match self {
            RuntimeHelper::AllocObject => "rt_alloc_object",
            RuntimeHelper::WriteBarrier => "rt_write_barrier",
            RuntimeHelper::TypeCheck => "rt_type_check",
            RuntimeHelper::PropertyGet => "rt_property_get",
            RuntimeHelper::PropertySet => "rt_property_set",
            RuntimeHelper::CallTrampoline => "rt_call_trampoline",
            RuntimeHelper::ThrowException => "rt_throw_exception",
            RuntimeHelper::BoundsCheck => "rt_bounds_check",
        }
    }
}

impl fmt::Display for RuntimeHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Resolves runtime helpers (and host-visible globals) to addresses.
///
/// Implemented by the embedding VM; the engine consults it once per compile,
/// when relocations are applied.
pub trait SymbolResolver: Send + Sync {
    /// Address of a runtime helper entry point.
    fn resolve(&self, helper: RuntimeHelper) -> Option<usize>;

    /// Address of a named global, if the host exposes one.
    fn resolve_global(&self, name: &str) -> Option<usize> {
        let _ = name;
        None
    }
}

/// Resolver that knows no symbols. Compiles of functions that never call
/// into the runtime succeed; anything else fails relocation.
pub struct EmptyResolver;

impl SymbolResolver for EmptyResolver {
    fn resolve(&self, _helper: RuntimeHelper) -> Option<usize> {
        None
    }
}

/// Table-backed resolver for hosts that register helpers up front.
#[derive(Default)]
pub struct TableResolver {
    entries: rustc_hash::FxHashMap<RuntimeHelper, usize>,
}

impl TableResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, helper: RuntimeHelper, addr: usize) {
        self.entries.insert(helper, addr);
    }
}

impl SymbolResolver for TableResolver {
    fn resolve(&self, helper: RuntimeHelper) -> Option<usize> {
        self.entries.get(&helper).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_symbols_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for h in RuntimeHelper::ALL {
            assert!(seen.insert(h.symbol()), "duplicate symbol {}", h.symbol());
        }
    }

    #[test]
    fn test_table_resolver() {
        let mut table = TableResolver::new();
        table.register(RuntimeHelper::AllocObject, 0x1000);
        assert_eq!(table.resolve(RuntimeHelper::AllocObject), Some(0x1000));
        assert_eq!(table.resolve(RuntimeHelper::BoundsCheck), None);
    }
}
