//! Wasm value types and the untyped 64-bit stack cell representation.

use core::fmt;

use crate::error::TrapCode;

/// A closed tagged kind for Wasm values.
///
/// # Note
///
/// `V128` (the SIMD proposal) is deliberately unimplemented; see the crate's
/// design notes on scope.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueType {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit IEEE-754 float.
    F32,
    /// 64-bit IEEE-754 float.
    F64,
    /// An opaque function reference.
    FuncRef,
    /// An opaque host reference.
    ExternRef,
}

/// A typed Wasm runtime value.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Value {
    /// A 32-bit integer value.
    I32(i32),
    /// A 64-bit integer value.
    I64(i64),
    /// A 32-bit float value.
    F32(f32),
    /// A 64-bit float value.
    F64(f64),
    /// A function reference, or `None` for `ref.null func`.
    FuncRef(Option<u32>),
    /// An external reference, or `None` for `ref.null extern`.
    ExternRef(Option<u32>),
}

impl Value {
    /// Returns the [`ValueType`] of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::I32(_) => ValueType::I32,
            Self::I64(_) => ValueType::I64,
            Self::F32(_) => ValueType::F32,
            Self::F64(_) => ValueType::F64,
            Self::FuncRef(_) => ValueType::FuncRef,
            Self::ExternRef(_) => ValueType::ExternRef,
        }
    }

    /// Returns the default (zero) value for the given [`ValueType`].
    pub fn default_for(value_type: ValueType) -> Self {
        match value_type {
            ValueType::I32 => Self::I32(0),
            ValueType::I64 => Self::I64(0),
            ValueType::F32 => Self::F32(0.0),
            ValueType::F64 => Self::F64(0.0),
            ValueType::FuncRef => Self::FuncRef(None),
            ValueType::ExternRef => Self::ExternRef(None),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::FuncRef(v) => write!(f, "funcref({v:?})"),
            Self::ExternRef(v) => write!(f, "externref({v:?})"),
        }
    }
}

/// A single 64-bit cell on the operand stack.
///
/// # Note
///
/// This is a thin, tag-free wrapper around [`u64`]. Bits not required by the
/// represented value are zero. Conversions rely on the fact that the
/// interpreter only ever reinterprets a cell as the type the (assumed
/// well-typed) code declares at that point — there is no runtime tag to
/// check.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct UntypedValue(u64);

impl UntypedValue {
    /// Returns the underlying bits.
    pub fn to_bits(self) -> u64 {
        self.0
    }

    /// Wraps a raw `u64` as an [`UntypedValue`].
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Reinterprets this cell as a typed [`Value`] of `value_type`.
    pub fn with_type(self, value_type: ValueType) -> Value {
        match value_type {
            ValueType::I32 => Value::I32(self.to::<i32>()),
            ValueType::I64 => Value::I64(self.to::<i64>()),
            ValueType::F32 => Value::F32(self.to::<f32>()),
            ValueType::F64 => Value::F64(self.to::<f64>()),
            ValueType::FuncRef => Value::FuncRef(self.to_ref()),
            ValueType::ExternRef => Value::ExternRef(self.to_ref()),
        }
    }

    /// Reinterprets this cell as `T`.
    pub fn to<T: FromUntyped>(self) -> T {
        T::from_untyped(self)
    }

    fn to_ref(self) -> Option<u32> {
        const NULL: u64 = u32::MAX as u64;
        match self.0 {
            NULL => None,
            bits => Some(bits as u32),
        }
    }

    /// Encodes a function/extern reference index (or `None` for null).
    pub fn from_ref(value: Option<u32>) -> Self {
        Self(value.map(u64::from).unwrap_or(u32::MAX as u64))
    }
}

impl From<Value> for UntypedValue {
    fn from(value: Value) -> Self {
        match value {
            Value::I32(v) => v.into(),
            Value::I64(v) => v.into(),
            Value::F32(v) => v.into(),
            Value::F64(v) => v.into(),
            Value::FuncRef(v) | Value::ExternRef(v) => Self::from_ref(v),
        }
    }
}

/// Converts an untyped stack cell into a concretely typed value.
pub trait FromUntyped: Sized {
    /// Reinterprets `cell`'s bits as `Self`.
    fn from_untyped(cell: UntypedValue) -> Self;
}

macro_rules! impl_untyped_integer {
    ($($t:ty),* $(,)?) => {
        $(
            impl FromUntyped for $t {
                fn from_untyped(cell: UntypedValue) -> Self {
                    cell.to_bits() as $t
                }
            }

            impl From<$t> for UntypedValue {
                fn from(value: $t) -> Self {
                    Self(value as u64)
                }
            }
        )*
    };
}
impl_untyped_integer!(i8, u8, i16, u16, i32, u32, i64, u64);

impl FromUntyped for f32 {
    fn from_untyped(cell: UntypedValue) -> Self {
        f32::from_bits(cell.to_bits() as u32)
    }
}

impl From<f32> for UntypedValue {
    fn from(value: f32) -> Self {
        Self(u64::from(value.to_bits()))
    }
}

impl FromUntyped for f64 {
    fn from_untyped(cell: UntypedValue) -> Self {
        f64::from_bits(cell.to_bits())
    }
}

impl From<f64> for UntypedValue {
    fn from(value: f64) -> Self {
        Self(value.to_bits())
    }
}

impl FromUntyped for bool {
    fn from_untyped(cell: UntypedValue) -> Self {
        cell.to_bits() != 0
    }
}

impl From<bool> for UntypedValue {
    fn from(value: bool) -> Self {
        Self(value as u64)
    }
}

/// Converts a finite float into an integer the way a trapping `trunc`
/// instruction does: NaN operands trap, and out-of-range operands trap
/// rather than saturate.
///
/// # Note
///
/// The truncation itself goes through [`num_rational::BigRational`] so the
/// in-range test is exact arbitrary-precision arithmetic rather than a
/// float comparison against hand-picked boundary constants, which can be
/// off by an ULP at the edges of the target integer's range.
pub trait TryTruncate<T>: Sized {
    /// Attempts the trapping truncation.
    fn try_truncate(self) -> Result<T, TrapCode>;
}

macro_rules! impl_try_truncate {
    ($src:ty, $dst:ty, $to_primitive:path) => {
        impl TryTruncate<$dst> for $src {
            fn try_truncate(self) -> Result<$dst, TrapCode> {
                if self.is_nan() {
                    return Err(TrapCode::InvalidConversionToInteger);
                }
                num_rational::BigRational::from_float(self)
                    .map(|ratio| ratio.to_integer())
                    .and_then(|int| $to_primitive(&int))
                    .ok_or(TrapCode::InvalidConversionToInteger)
            }
        }
    };
}

impl_try_truncate!(f32, i32, num_traits::cast::ToPrimitive::to_i32);
impl_try_truncate!(f32, u32, num_traits::cast::ToPrimitive::to_u32);
impl_try_truncate!(f64, i32, num_traits::cast::ToPrimitive::to_i32);
impl_try_truncate!(f64, u32, num_traits::cast::ToPrimitive::to_u32);
impl_try_truncate!(f32, i64, num_traits::cast::ToPrimitive::to_i64);
impl_try_truncate!(f32, u64, num_traits::cast::ToPrimitive::to_u64);
impl_try_truncate!(f64, i64, num_traits::cast::ToPrimitive::to_i64);
impl_try_truncate!(f64, u64, num_traits::cast::ToPrimitive::to_u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_value() {
        let cell: UntypedValue = 42_i32.into();
        assert_eq!(cell.to::<i32>(), 42);
        let cell: UntypedValue = (-1_i64).into();
        assert_eq!(cell.to::<i64>(), -1);
        let cell: UntypedValue = 1.5_f32.into();
        assert_eq!(cell.to::<f32>(), 1.5);
        let cell: UntypedValue = 1.5_f64.into();
        assert_eq!(cell.to::<f64>(), 1.5);
    }

    #[test]
    fn trunc_rejects_nan_and_out_of_range() {
        assert!(f64::NAN.try_truncate::<i32>().is_err());
        assert!((2147483648.0_f64).try_truncate::<i32>().is_err());
        assert!((-2147483649.0_f64).try_truncate::<i32>().is_err());
        assert_eq!((-2147483648.0_f64).try_truncate::<i32>(), Ok(i32::MIN));
        assert_eq!((2147483647.0_f64).try_truncate::<i32>(), Ok(2147483647));
    }
}
