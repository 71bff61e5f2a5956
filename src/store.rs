//! The [`Store`]: the process-level registry of runtime objects shared
//! between module instances.

use core::fmt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::arena::{Arena, ArenaIndex};
use crate::error::SetupError;
use crate::func::{Func, FuncEntity, HostFunc};
use crate::global::{Global, GlobalEntity};
use crate::instance::{Instance, InstanceEntity};
use crate::memory::{Memory, MemoryEntity};
use crate::table::{Table, TableEntity};
use crate::Engine;

/// A unique store index, used to reject handles that originated from a
/// different [`Store`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StoreIdx(usize);

fn next_store_index() -> StoreIdx {
    static CURRENT_STORE_IDX: AtomicUsize = AtomicUsize::new(0);
    StoreIdx(CURRENT_STORE_IDX.fetch_add(1, Ordering::AcqRel))
}

/// An opaque handle: a store-tagged arena index.
///
/// # Note
///
/// Tagging every handle with the index of the store that minted it turns an
/// accidental cross-store handle use into an immediate panic rather than a
/// silently wrong lookup.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Stored<Idx> {
    store_idx: StoreIdx,
    entity_idx: Idx,
}

impl<Idx> Stored<Idx> {
    pub(crate) fn new(store_idx: StoreIdx, entity_idx: Idx) -> Self {
        Self {
            store_idx,
            entity_idx,
        }
    }

    pub(crate) fn store_index(&self) -> StoreIdx {
        self.store_idx
    }

    pub(crate) fn entity_index(&self) -> &Idx {
        &self.entity_idx
    }
}

macro_rules! define_index {
    ($name:ident) => {
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
        pub(crate) struct $name(usize);

        impl ArenaIndex for $name {
            fn into_usize(self) -> usize {
                self.0
            }

            fn from_usize(value: usize) -> Self {
                Self(value)
            }
        }
    };
}

define_index!(FuncIdx);
define_index!(MemoryIdx);
define_index!(TableIdx);
define_index!(GlobalIdx);
define_index!(InstanceIdx);

/// Owns every runtime object reachable from any [`Instance`] built against
/// it: functions, memories, tables, globals, and the instances themselves.
///
/// `T` is arbitrary user-provided state, reachable from host functions via
/// [`Caller::state`](crate::Caller::state).
#[derive(Debug)]
pub struct Store<T> {
    idx: StoreIdx,
    funcs: Arena<FuncIdx, FuncEntity<T>>,
    memories: Arena<MemoryIdx, MemoryEntity>,
    tables: Arena<TableIdx, TableEntity>,
    globals: Arena<GlobalIdx, GlobalEntity>,
    instances: Arena<InstanceIdx, InstanceEntity>,
    host_imports: BTreeMap<(String, String), Func>,
    engine: Engine,
    user_state: T,
}

impl<T> Store<T> {
    /// Creates a new, empty store bound to `engine`, owning `user_state`.
    pub fn new(engine: &Engine, user_state: T) -> Self {
        Self {
            idx: next_store_index(),
            funcs: Arena::new(),
            memories: Arena::new(),
            tables: Arena::new(),
            globals: Arena::new(),
            instances: Arena::new(),
            host_imports: BTreeMap::new(),
            engine: engine.clone(),
            user_state,
        }
    }

    /// Registers a host function under `(module_name, name)`, making it
    /// resolvable by [`Store::import`] during instance construction.
    pub fn add_host_function(
        &mut self,
        module_name: impl Into<String>,
        name: impl Into<String>,
        host_func: HostFunc<T>,
    ) -> Func {
        let func = self.alloc_func(FuncEntity::new_host(host_func));
        self.host_imports.insert((module_name.into(), name.into()), func);
        func
    }

    /// Resolves a previously registered host import by `(module_name, name)`.
    pub fn import(&self, module_name: &str, name: &str) -> Result<Func, SetupError> {
        self.host_imports
            .get(&(module_name.to_owned(), name.to_owned()))
            .copied()
            .ok_or_else(|| SetupError::ImportNotFound {
                module_name: module_name.to_owned(),
                name: name.to_owned(),
            })
    }

    /// Returns the [`Engine`] this store is bound to.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Returns a shared reference to the user state.
    pub fn state(&self) -> &T {
        &self.user_state
    }

    /// Returns an exclusive reference to the user state.
    pub fn state_mut(&mut self) -> &mut T {
        &mut self.user_state
    }

    fn unwrap_index<Idx>(&self, stored: Stored<Idx>) -> Idx
    where
        Idx: fmt::Debug,
    {
        assert_eq!(
            self.idx,
            stored.store_index(),
            "tried to access entity {:?} of a foreign store",
            stored.entity_index(),
        );
        stored.entity_idx
    }

    pub(crate) fn alloc_func(&mut self, entity: FuncEntity<T>) -> Func {
        Func::from_inner(Stored::new(self.idx, self.funcs.alloc(entity)))
    }

    pub(crate) fn alloc_memory(&mut self, entity: MemoryEntity) -> Memory {
        Memory::from_inner(Stored::new(self.idx, self.memories.alloc(entity)))
    }

    pub(crate) fn alloc_table(&mut self, entity: TableEntity) -> Table {
        Table::from_inner(Stored::new(self.idx, self.tables.alloc(entity)))
    }

    pub(crate) fn alloc_global(&mut self, entity: GlobalEntity) -> Global {
        Global::from_inner(Stored::new(self.idx, self.globals.alloc(entity)))
    }

    pub(crate) fn alloc_instance(&mut self, entity: InstanceEntity) -> Instance {
        Instance::from_inner(Stored::new(self.idx, self.instances.alloc(entity)))
    }

    pub(crate) fn resolve_func(&self, func: Func) -> Result<&FuncEntity<T>, SetupError> {
        let idx = self.unwrap_index(func.into_inner());
        self.funcs.get(idx).ok_or(SetupError::FunctionIndexOutOfBounds)
    }

    pub(crate) fn resolve_memory(&self, memory: Memory) -> Result<&MemoryEntity, SetupError> {
        let idx = self.unwrap_index(memory.into_inner());
        self.memories.get(idx).ok_or(SetupError::MemoryIndexOutOfBounds)
    }

    pub(crate) fn resolve_memory_mut(&mut self, memory: Memory) -> Result<&mut MemoryEntity, SetupError> {
        let idx = self.unwrap_index(memory.into_inner());
        self.memories.get_mut(idx).ok_or(SetupError::MemoryIndexOutOfBounds)
    }

    pub(crate) fn resolve_table(&self, table: Table) -> Result<&TableEntity, SetupError> {
        let idx = self.unwrap_index(table.into_inner());
        self.tables.get(idx).ok_or(SetupError::TableIndexOutOfBounds)
    }

    pub(crate) fn resolve_table_mut(&mut self, table: Table) -> Result<&mut TableEntity, SetupError> {
        let idx = self.unwrap_index(table.into_inner());
        self.tables.get_mut(idx).ok_or(SetupError::TableIndexOutOfBounds)
    }

    pub(crate) fn resolve_global(&self, global: Global) -> Result<&GlobalEntity, SetupError> {
        let idx = self.unwrap_index(global.into_inner());
        self.globals.get(idx).ok_or(SetupError::GlobalIndexOutOfBounds)
    }

    pub(crate) fn resolve_global_mut(&mut self, global: Global) -> Result<&mut GlobalEntity, SetupError> {
        let idx = self.unwrap_index(global.into_inner());
        self.globals.get_mut(idx).ok_or(SetupError::GlobalIndexOutOfBounds)
    }

    pub(crate) fn resolve_instance(&self, instance: Instance) -> &InstanceEntity {
        let idx = self.unwrap_index(instance.into_inner());
        self.instances
            .get(idx)
            .unwrap_or_else(|| panic!("failed to resolve stored instance: {idx:?}"))
    }

    pub(crate) fn resolve_instance_mut(&mut self, instance: Instance) -> &mut InstanceEntity {
        let idx = self.unwrap_index(instance.into_inner());
        self.instances
            .get_mut(idx)
            .unwrap_or_else(|| panic!("failed to resolve stored instance: {idx:?}"))
    }
}

/// Grants shared access to a [`Store`] through a borrow of `Self`.
pub trait AsContext {
    /// The user state carried by the underlying [`Store`].
    type UserState;

    /// Returns a temporary shared view of the store.
    fn as_context(&self) -> StoreContext<'_, Self::UserState>;
}

/// Grants exclusive access to a [`Store`] through a borrow of `Self`.
pub trait AsContextMut: AsContext {
    /// Returns a temporary exclusive view of the store.
    fn as_context_mut(&mut self) -> StoreContextMut<'_, Self::UserState>;
}

/// A temporary shared handle to a `&Store<T>`.
#[derive(Debug)]
pub struct StoreContext<'a, T> {
    pub(crate) store: &'a Store<T>,
}

/// A temporary exclusive handle to a `&mut Store<T>`.
#[derive(Debug)]
pub struct StoreContextMut<'a, T> {
    pub(crate) store: &'a mut Store<T>,
}

impl<C> AsContext for &'_ C
where
    C: AsContext,
{
    type UserState = C::UserState;

    fn as_context(&self) -> StoreContext<'_, C::UserState> {
        C::as_context(self)
    }
}

impl<C> AsContext for &'_ mut C
where
    C: AsContext,
{
    type UserState = C::UserState;

    fn as_context(&self) -> StoreContext<'_, C::UserState> {
        C::as_context(self)
    }
}

impl<C> AsContextMut for &'_ mut C
where
    C: AsContextMut,
{
    fn as_context_mut(&mut self) -> StoreContextMut<'_, C::UserState> {
        C::as_context_mut(self)
    }
}

impl<T> AsContext for Store<T> {
    type UserState = T;

    fn as_context(&self) -> StoreContext<'_, T> {
        StoreContext { store: self }
    }
}

impl<T> AsContextMut for Store<T> {
    fn as_context_mut(&mut self) -> StoreContextMut<'_, T> {
        StoreContextMut { store: self }
    }
}

impl<'a, T> AsContext for StoreContext<'a, T> {
    type UserState = T;

    fn as_context(&self) -> StoreContext<'_, T> {
        StoreContext { store: self.store }
    }
}

impl<'a, T> AsContext for StoreContextMut<'a, T> {
    type UserState = T;

    fn as_context(&self) -> StoreContext<'_, T> {
        StoreContext { store: self.store }
    }
}

impl<'a, T> AsContextMut for StoreContextMut<'a, T> {
    fn as_context_mut(&mut self) -> StoreContextMut<'_, T> {
        StoreContextMut { store: self.store }
    }
}
