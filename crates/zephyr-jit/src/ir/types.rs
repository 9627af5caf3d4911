//! Semantic types carried by IR values

use std::fmt;

/// Type of an IR value.
///
/// `Unknown` is the top of the lattice; the type-inference pass narrows
/// values toward concrete types so specialization can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum IrType {
    Void,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Bool,
    /// Raw pointer (code addresses, element pointers, stack slots)
    Ptr,
    /// Tagged heap object managed by the host runtime
    Object,
    Array,
    Function,
    Unknown,
}

impl IrType {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            IrType::Int8 | IrType::Int16 | IrType::Int32 | IrType::Int64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, IrType::Float32 | IrType::Float64)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    /// Size in bytes when stored in memory. Tagged and unknown values take
    /// a full machine word.
    pub fn byte_size(&self) -> u32 {
        match self {
            IrType::Void => 0,
            IrType::Int8 | IrType::Bool => 1,
            IrType::Int16 => 2,
            IrType::Int32 | IrType::Float32 => 4,
            _ => 8,
        }
    }

    /// Join of two lattice elements: equal types meet at themselves,
    /// anything else widens to `Unknown`.
    pub fn join(self, other: IrType) -> IrType {
        if self == other {
            self
        } else if self == IrType::Unknown {
            other
        } else if other == IrType::Unknown {
            self
        } else {
            IrType::Unknown
        }
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IrType::Void => "void",
            IrType::Int8 => "i8",
            IrType::Int16 => "i16",
            IrType::Int32 => "i32",
            IrType::Int64 => "i64",
            IrType::Float32 => "f32",
            IrType::Float64 => "f64",
            IrType::Bool => "bool",
            IrType::Ptr => "ptr",
            IrType::Object => "object",
            IrType::Array => "array",
            IrType::Function => "fn",
            IrType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}
