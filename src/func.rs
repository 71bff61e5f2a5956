//! Functions: the `Wasm`/`Host` two-variant [`Func`] entity and the host
//! calling convention.

use std::fmt;
use std::sync::Arc;

use crate::error::TrapCode;
use crate::instance::Instance;
use crate::module::FunctionType;
use crate::store::{AsContext, AsContextMut, FuncIdx, Stored, StoreContext, StoreContextMut};
use crate::value::Value;

/// The caller-side view passed to a host function's callable.
///
/// Grants the host callback the same store access an embedder has, scoped to
/// the duration of one call.
pub struct Caller<'a, T> {
    pub(crate) store: StoreContextMut<'a, T>,
}

impl<T> AsContext for Caller<'_, T> {
    type UserState = T;

    fn as_context(&self) -> StoreContext<'_, T> {
        self.store.as_context()
    }
}

impl<T> AsContextMut for Caller<'_, T> {
    fn as_context_mut(&mut self) -> StoreContextMut<'_, T> {
        self.store.as_context_mut()
    }
}

impl<T> Caller<'_, T> {
    /// Returns a shared reference to the user state carried by the store.
    pub fn state(&self) -> &T {
        self.store.store.state()
    }

    /// Returns an exclusive reference to the user state carried by the
    /// store.
    pub fn state_mut(&mut self) -> &mut T {
        self.store.store.state_mut()
    }
}

type HostTrampoline<T> = dyn Fn(Caller<'_, T>, &[Value], &mut [Value]) -> Result<(), TrapCode> + Send + Sync;

/// A host-provided callable: the embedder's side of the host-function
/// bridge.
pub struct HostFunc<T> {
    signature: FunctionType,
    trampoline: Arc<HostTrampoline<T>>,
}

impl<T> Clone for HostFunc<T> {
    fn clone(&self) -> Self {
        Self {
            signature: self.signature.clone(),
            trampoline: self.trampoline.clone(),
        }
    }
}

impl<T> fmt::Debug for HostFunc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunc").field("signature", &self.signature).finish()
    }
}

impl<T> HostFunc<T> {
    /// Wraps a callable as a host function of the given signature.
    pub fn new(
        signature: FunctionType,
        callable: impl Fn(Caller<'_, T>, &[Value], &mut [Value]) -> Result<(), TrapCode> + Send + Sync + 'static,
    ) -> Self {
        Self {
            signature,
            trampoline: Arc::new(callable),
        }
    }

    /// The host function's declared signature.
    pub fn signature(&self) -> &FunctionType {
        &self.signature
    }

    /// Invokes the host callable.
    pub(crate) fn call(&self, caller: Caller<'_, T>, inputs: &[Value], outputs: &mut [Value]) -> Result<(), TrapCode> {
        (self.trampoline)(caller, inputs, outputs)
    }
}

/// The per-variant payload of a [`FuncEntity`].
pub(crate) enum FuncEntityInternal<T> {
    /// A module-defined function: a back-reference to its owning
    /// [`Instance`] plus the combined-index-space function index that
    /// identifies its [`FunctionDef`](crate::module::FunctionDef) within
    /// that instance's module.
    Wasm { instance: Instance, func_idx: u32 },
    /// A callable supplied by the embedder.
    Host(HostFunc<T>),
}

impl<T> Clone for FuncEntityInternal<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Wasm { instance, func_idx } => Self::Wasm {
                instance: *instance,
                func_idx: *func_idx,
            },
            Self::Host(func) => Self::Host(func.clone()),
        }
    }
}

impl<T> fmt::Debug for FuncEntityInternal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wasm { func_idx, .. } => f.debug_struct("Wasm").field("func_idx", func_idx).finish(),
            Self::Host(func) => f.debug_tuple("Host").field(func).finish(),
        }
    }
}

/// The in-`Store` function entity: the closed `{Wasm, Host}` sum described
/// by the function bridge.
#[derive(Debug)]
pub struct FuncEntity<T> {
    internal: FuncEntityInternal<T>,
}

impl<T> Clone for FuncEntity<T> {
    fn clone(&self) -> Self {
        Self {
            internal: self.internal.clone(),
        }
    }
}

impl<T> FuncEntity<T> {
    pub(crate) fn new_wasm(instance: Instance, func_idx: u32) -> Self {
        Self {
            internal: FuncEntityInternal::Wasm { instance, func_idx },
        }
    }

    pub(crate) fn new_host(host_func: HostFunc<T>) -> Self {
        Self {
            internal: FuncEntityInternal::Host(host_func),
        }
    }

    pub(crate) fn as_internal(&self) -> &FuncEntityInternal<T> {
        &self.internal
    }
}

/// A handle to a [`FuncEntity`] allocated in a [`Store`](crate::Store).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Func {
    inner: Stored<FuncIdx>,
}

impl Func {
    pub(crate) fn from_inner(inner: Stored<FuncIdx>) -> Self {
        Self { inner }
    }

    pub(crate) fn into_inner(self) -> Stored<FuncIdx> {
        self.inner
    }

    /// Registers `host_func` as a freestanding host function in `store`.
    pub fn wrap<T>(mut ctx: impl AsContextMut<UserState = T>, host_func: HostFunc<T>) -> Self {
        let entity = FuncEntity::new_host(host_func);
        ctx.as_context_mut().store.alloc_func(entity)
    }
}
