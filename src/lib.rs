//! `wasmstack` — a small stack-machine WebAssembly execution engine.
//!
//! This crate implements the *runtime* half of a Wasm engine: a [`Store`] of
//! functions, memories, tables and globals shared between module instances,
//! and an [`Instance`] that binds a decoded [`Module`] to a `Store` and can
//! `invoke` its exports. Decoding a `.wasm` binary into a [`Module`] is not
//! this crate's job — it consumes modules that have already been parsed.

mod arena;
mod engine;
mod error;
mod func;
mod global;
mod instance;
mod limits;
mod memory;
pub mod module;
mod store;
mod table;
mod value;

pub use self::{
    engine::Engine,
    error::{SetupError, TrapCode},
    func::{Caller, Func, HostFunc},
    global::{Global, Mutability},
    instance::{Extern, ExportsIter, Instance, InvokeError},
    limits::Config,
    memory::{Memory, MemoryType},
    module::Module,
    store::{AsContext, AsContextMut, Store, StoreContext, StoreContextMut},
    table::{Table, TableType},
    value::{Value, ValueType},
};

pub(crate) use self::arena::{Arena, ArenaIndex, DedupArena};
