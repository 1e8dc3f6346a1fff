//! The closed IR type set.

/// A value's type. This set is closed: the backend's lowering table and the
/// register allocator both switch over it exhaustively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IrType {
    /// 8-bit integer.
    I8,
    /// 16-bit integer.
    I16,
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit IEEE-754 float.
    F32,
    /// 64-bit IEEE-754 float.
    F64,
    /// 128-bit vector (SIMD), opaque to scalar opcodes.
    V128,
}

impl IrType {
    /// Returns the type's width in bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::I8 => 8,
            Self::I16 => 16,
            Self::I32 => 32,
            Self::I64 | Self::F64 => 64,
            Self::F32 => 32,
            Self::V128 => 128,
        }
    }

    /// Returns `true` for the integer types (the only ones the baseline
    /// opcode set can fold or GVN).
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }
}
