//! Global variables.

use crate::error::SetupError;
use crate::store::{AsContext, AsContextMut, GlobalIdx, Stored};
use crate::value::{Value, ValueType};

/// Whether a [`Global`] accepts `global.set`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mutability {
    /// The global's value is fixed after initialization.
    Const,
    /// The global's value can be updated with `global.set`.
    Var,
}

/// The in-`Store` global entity.
#[derive(Debug)]
pub struct GlobalEntity {
    value: Value,
    mutability: Mutability,
}

impl GlobalEntity {
    pub(crate) fn new(init_value: Value, mutability: Mutability) -> Self {
        Self {
            value: init_value,
            mutability,
        }
    }

    /// The global's current value.
    pub fn get(&self) -> Value {
        self.value
    }

    /// The global's declared value type.
    pub fn value_type(&self) -> ValueType {
        self.value.value_type()
    }

    /// The global's mutability.
    pub fn mutability(&self) -> Mutability {
        self.mutability
    }

    /// Updates the global's value.
    ///
    /// Fails if the global is immutable or if `new_value`'s type does not
    /// match the global's declared type.
    pub fn set(&mut self, new_value: Value) -> Result<(), SetupError> {
        if self.mutability == Mutability::Const {
            return Err(SetupError::GlobalIndexOutOfBounds);
        }
        if new_value.value_type() != self.value_type() {
            return Err(SetupError::ParamTypeMismatch {
                index: 0,
                expected: self.value_type(),
                found: new_value.value_type(),
            });
        }
        self.value = new_value;
        Ok(())
    }
}

/// A handle to a [`GlobalEntity`] allocated in a [`Store`](crate::Store).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Global {
    inner: Stored<GlobalIdx>,
}

impl Global {
    pub(crate) fn from_inner(inner: Stored<GlobalIdx>) -> Self {
        Self { inner }
    }

    pub(crate) fn into_inner(self) -> Stored<GlobalIdx> {
        self.inner
    }

    /// Allocates a new global in `store`.
    pub fn new(mut ctx: impl AsContextMut, init_value: Value, mutability: Mutability) -> Self {
        ctx.as_context_mut()
            .store
            .alloc_global(GlobalEntity::new(init_value, mutability))
    }

    /// Returns the global's current value.
    pub fn get(&self, ctx: impl AsContext) -> Value {
        ctx.as_context()
            .store
            .resolve_global(*self)
            .expect("global handle out of bounds")
            .get()
    }

    /// Returns the global's declared value type.
    pub fn value_type(&self, ctx: impl AsContext) -> ValueType {
        ctx.as_context()
            .store
            .resolve_global(*self)
            .expect("global handle out of bounds")
            .value_type()
    }

    /// Updates the global's current value.
    pub fn set(&self, mut ctx: impl AsContextMut, new_value: Value) -> Result<(), SetupError> {
        ctx.as_context_mut()
            .store
            .resolve_global_mut(*self)
            .expect("global handle out of bounds")
            .set(new_value)
    }
}
