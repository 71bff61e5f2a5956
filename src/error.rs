//! The two error families surfaced at the API boundary.

use core::fmt;
use std::error::Error as StdError;

use crate::value::ValueType;

/// Errors returned from the `Instance` API entry points before execution
/// begins, or upon resolving an import while constructing an `Instance`.
///
/// # Note
///
/// Setup errors never leave an `Instance` or `Store` in a partially modified
/// state: they are checked before any stack or memory mutation happens.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SetupError {
    /// The named export does not resolve to a function, or the function's
    /// type index has no corresponding entry in the module's type section.
    FuncIndexExceedsTypesLength,
    /// A function index used during import resolution or `call` had no
    /// corresponding handle in the `Store`.
    FunctionIndexOutOfBounds,
    /// A memory index had no corresponding handle in the `Store`.
    MemoryIndexOutOfBounds,
    /// A table index had no corresponding handle in the `Store`.
    TableIndexOutOfBounds,
    /// A global index had no corresponding handle in the `Store`.
    GlobalIndexOutOfBounds,
    /// `invoke_typed`/`invoke_dynamic` was called with the wrong number of
    /// arguments for the target function's declared parameters.
    ParamCountMismatch,
    /// An argument did not match the target function's declared parameter
    /// type at the same position.
    ParamTypeMismatch {
        /// The position of the mismatched argument.
        index: usize,
        /// The type the function declares at this position.
        expected: ValueType,
        /// The type of the value actually supplied.
        found: ValueType,
    },
    /// The caller's requested result type does not match the function's
    /// single declared result type.
    ResultTypeMismatch,
    /// The target function declares more than one result, which
    /// `invoke_typed`/`invoke_dynamic` cannot represent.
    OnlySingleReturnValueSupported,
    /// No host function was registered under the requested
    /// `(module_name, name)` pair.
    ImportNotFound {
        /// The import's module name.
        module_name: String,
        /// The import's field name.
        name: String,
    },
    /// `invoke_dynamic` targeted a host function, which this engine does not
    /// support invoking dynamically.
    InvokeDynamicHostFunctionNotImplemented,
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FuncIndexExceedsTypesLength => {
                write!(f, "function index exceeds the length of the type section")
            }
            Self::FunctionIndexOutOfBounds => write!(f, "function index out of bounds"),
            Self::MemoryIndexOutOfBounds => write!(f, "memory index out of bounds"),
            Self::TableIndexOutOfBounds => write!(f, "table index out of bounds"),
            Self::GlobalIndexOutOfBounds => write!(f, "global index out of bounds"),
            Self::ParamCountMismatch => write!(f, "parameter count mismatch"),
            Self::ParamTypeMismatch {
                index,
                expected,
                found,
            } => write!(
                f,
                "parameter {index} type mismatch: expected {expected:?}, found {found:?}"
            ),
            Self::ResultTypeMismatch => write!(f, "result type mismatch"),
            Self::OnlySingleReturnValueSupported => {
                write!(f, "only functions with a single or no return value are supported")
            }
            Self::ImportNotFound { module_name, name } => {
                write!(f, "import not found: {module_name}::{name}")
            }
            Self::InvokeDynamicHostFunctionNotImplemented => {
                write!(f, "invoke_dynamic cannot target a host function")
            }
        }
    }
}

impl StdError for SetupError {}

/// Runtime errors that abort the current invocation.
///
/// # Note
///
/// A trap unwinds the interpreter's per-call stacks but leaves the
/// `Instance` otherwise usable: memories, tables and globals retain whatever
/// state was committed by instructions that executed before the trap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TrapCode {
    /// An `unreachable` instruction was executed.
    UnreachableExecuted,
    /// Integer division or remainder by zero.
    IntegerDivideByZero,
    /// Signed division overflow (`INT_MIN / -1`).
    IntegerOverflow,
    /// A float-to-integer conversion encountered a NaN or out-of-range value.
    InvalidConversionToInteger,
    /// A memory load or store exceeded the memory's current size.
    OutOfBoundsMemoryAccess,
    /// A table access exceeded the table's current size.
    OutOfBoundsTableAccess,
    /// An indirect call targeted a table slot with no function reference.
    UninitializedElement,
    /// An indirect call's callee type did not match the expected type.
    IndirectCallTypeMismatch,
    /// The operand, frame, or label stack exceeded its configured capacity.
    StackOverflow,
    /// A `call_indirect` or table initializer referenced an element index
    /// beyond the table's declared bounds.
    UndefinedElement,
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::UnreachableExecuted => "unreachable instruction executed",
            Self::IntegerDivideByZero => "integer divide by zero",
            Self::IntegerOverflow => "integer overflow",
            Self::InvalidConversionToInteger => "invalid conversion to integer",
            Self::OutOfBoundsMemoryAccess => "out of bounds memory access",
            Self::OutOfBoundsTableAccess => "out of bounds table access",
            Self::UninitializedElement => "uninitialized element",
            Self::IndirectCallTypeMismatch => "indirect call type mismatch",
            Self::StackOverflow => "stack overflow",
            Self::UndefinedElement => "undefined element",
        };
        f.write_str(message)
    }
}

impl StdError for TrapCode {}
