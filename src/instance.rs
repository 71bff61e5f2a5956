//! [`Instance`]: a decoded module bound to concrete [`Store`](crate::Store)
//! handles for each of its imports and definitions.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{SetupError, TrapCode};
use crate::func::{Func, FuncEntity};
use crate::global::Global;
use crate::memory::Memory;
use crate::module::{ExternIdx, Module};
use crate::store::{AsContext, AsContextMut, InstanceIdx, Stored};
use crate::table::Table;
use crate::value::{Value, ValueType};

/// A resolved export or import target: one of the four kinds of item a
/// module can expose or require.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Extern {
    /// A function handle.
    Func(Func),
    /// A table handle.
    Table(Table),
    /// A linear memory handle.
    Memory(Memory),
    /// A global variable handle.
    Global(Global),
}

impl Extern {
    /// Returns the handle as a [`Func`], if this is a function export.
    pub fn into_func(self) -> Option<Func> {
        match self {
            Self::Func(func) => Some(func),
            _ => None,
        }
    }
}

/// The in-`Store` instance entity: the module's internal index spaces, each
/// resolved to a concrete runtime handle.
#[derive(Debug)]
pub struct InstanceEntity {
    module: Arc<Module>,
    funcaddrs: Vec<Func>,
    memaddrs: Vec<Memory>,
    tableaddrs: Vec<Table>,
    globaladdrs: Vec<Global>,
    exports: BTreeMap<String, Extern>,
}

impl InstanceEntity {
    /// Returns the function at the module's combined function index `i`.
    pub(crate) fn get_func(&self, i: u32) -> Option<Func> {
        self.funcaddrs.get(i as usize).copied()
    }

    /// Returns the memory at the module's combined memory index `i`.
    pub(crate) fn get_memory(&self, i: u32) -> Option<Memory> {
        self.memaddrs.get(i as usize).copied()
    }

    /// Returns the table at the module's combined table index `i`.
    pub(crate) fn get_table(&self, i: u32) -> Option<Table> {
        self.tableaddrs.get(i as usize).copied()
    }

    /// Returns the global at the module's combined global index `i`.
    pub(crate) fn get_global(&self, i: u32) -> Option<Global> {
        self.globaladdrs.get(i as usize).copied()
    }

    /// Returns the export registered under `name`.
    pub(crate) fn get_export(&self, name: &str) -> Option<Extern> {
        self.exports.get(name).copied()
    }

    /// Returns the bound decoded module.
    pub(crate) fn module(&self) -> &Module {
        &self.module
    }

    /// Returns a cheap clone of the bound decoded module, for callers that
    /// need to hold onto it across a mutable borrow of the owning `Store`.
    pub(crate) fn module_arc(&self) -> Arc<Module> {
        self.module.clone()
    }
}

/// An iterator over an instance's exports, yielding `(name, Extern)` pairs.
pub struct ExportsIter<'a> {
    inner: std::collections::btree_map::Iter<'a, String, Extern>,
}

impl<'a> Iterator for ExportsIter<'a> {
    type Item = (&'a str, Extern);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(name, ext)| (name.as_str(), *ext))
    }
}

/// A module bound to a [`Store`](crate::Store): the runtime counterpart of a
/// decoded [`Module`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Instance {
    inner: Stored<InstanceIdx>,
}

impl Instance {
    pub(crate) fn from_inner(inner: Stored<InstanceIdx>) -> Self {
        Self { inner }
    }

    pub(crate) fn into_inner(self) -> Stored<InstanceIdx> {
        self.inner
    }

    /// Instantiates `module` against `store`: resolves every import,
    /// allocates a handle for every local definition, applies active
    /// element/data segments, evaluates global initializers, and runs the
    /// `start` function if present.
    ///
    /// # Note
    ///
    /// Only function imports are resolvable (against host functions
    /// registered with [`Store::add_host_function`](crate::Store::add_host_function));
    /// a module importing a table, memory, or global fails with
    /// [`SetupError::ImportNotFound`], since this crate does not link one
    /// module instance's exports into another's import space.
    pub fn new<T>(mut ctx: impl AsContextMut<UserState = T>, module: Module) -> Result<Self, InvokeError> {
        let module = Arc::new(module);
        let mut funcaddrs = Vec::new();
        let mut memaddrs = Vec::new();
        let mut tableaddrs = Vec::new();
        let mut globaladdrs = Vec::new();

        // Resolve imports first: they occupy the low end of each index space.
        for import in &module.imports {
            let not_found = || {
                SetupError::ImportNotFound {
                    module_name: import.module_name.clone(),
                    name: import.name.clone(),
                }
            };
            match import.idx {
                ExternIdx::Func(_) => {
                    let func = ctx.as_context().store.import(&import.module_name, &import.name)?;
                    funcaddrs.push(func);
                }
                ExternIdx::Memory(_) | ExternIdx::Table(_) | ExternIdx::Global(_) => {
                    return Err(InvokeError::Setup(not_found()));
                }
            }
        }

        // Allocate a Store handle for every locally defined function before
        // evaluating anything that might reference it (globals, elements).
        let instance_placeholder = ctx.as_context_mut().store.alloc_instance(InstanceEntity {
            module: module.clone(),
            funcaddrs: Vec::new(),
            memaddrs: Vec::new(),
            tableaddrs: Vec::new(),
            globaladdrs: Vec::new(),
            exports: BTreeMap::new(),
        });

        for func_idx in 0..module.functions.len() as u32 {
            let entity = FuncEntity::new_wasm(instance_placeholder, func_idx + module.imported_function_count() as u32);
            let func = ctx.as_context_mut().store.alloc_func(entity);
            funcaddrs.push(func);
        }

        for table_def in &module.tables {
            let table = Table::new(
                ctx.as_context_mut(),
                crate::table::TableType::new(table_def.initial, table_def.maximum),
            );
            tableaddrs.push(table);
        }

        for memory_def in &module.memories {
            let memory = Memory::new(
                ctx.as_context_mut(),
                crate::memory::MemoryType::new(memory_def.initial_pages, memory_def.maximum_pages),
            );
            memaddrs.push(memory);
        }

        for global_def in &module.globals {
            let init_value = crate::engine::eval_const_expr(&global_def.init_expr, &globaladdrs, &mut ctx)?;
            let global = Global::new(ctx.as_context_mut(), init_value, global_def.mutability);
            globaladdrs.push(global);
        }

        for element in &module.elements {
            let offset = crate::engine::eval_const_expr(&element.offset_expr, &globaladdrs, &mut ctx)?;
            let offset = match offset {
                Value::I32(v) => v as u32,
                _ => return Err(SetupError::TableIndexOutOfBounds),
            };
            let table = *tableaddrs
                .get(element.table_index as usize)
                .ok_or(SetupError::TableIndexOutOfBounds)?;
            let segment_len = element.func_indices.len() as u32;
            let in_bounds = offset
                .checked_add(segment_len)
                .map_or(false, |end| end <= table.len(ctx.as_context()));
            if !in_bounds {
                return Err(TrapCode::UndefinedElement.into());
            }
            for (i, &func_idx) in element.func_indices.iter().enumerate() {
                let func = *funcaddrs.get(func_idx as usize).ok_or(SetupError::FunctionIndexOutOfBounds)?;
                table.set(ctx.as_context_mut(), offset + i as u32, Some(func))?;
            }
        }

        for data in &module.data {
            let offset = crate::engine::eval_const_expr(&data.offset_expr, &globaladdrs, &mut ctx)?;
            let offset = match offset {
                Value::I32(v) => v as u32,
                _ => return Err(SetupError::MemoryIndexOutOfBounds),
            };
            let memory = *memaddrs
                .get(data.memory_index as usize)
                .ok_or(SetupError::MemoryIndexOutOfBounds)?;
            ctx.as_context_mut()
                .store
                .resolve_memory_mut(memory)?
                .init_data(offset, &data.bytes)?;
        }

        let mut exports = BTreeMap::new();
        for export in &module.exports {
            let value = match export.idx {
                ExternIdx::Func(i) => Extern::Func(*funcaddrs.get(i as usize).ok_or(SetupError::FunctionIndexOutOfBounds)?),
                ExternIdx::Table(i) => Extern::Table(*tableaddrs.get(i as usize).ok_or(SetupError::TableIndexOutOfBounds)?),
                ExternIdx::Memory(i) => Extern::Memory(*memaddrs.get(i as usize).ok_or(SetupError::MemoryIndexOutOfBounds)?),
                ExternIdx::Global(i) => Extern::Global(*globaladdrs.get(i as usize).ok_or(SetupError::GlobalIndexOutOfBounds)?),
            };
            exports.insert(export.name.clone(), value);
        }

        let start_func = match module.start {
            Some(start) => Some(*funcaddrs.get(start as usize).ok_or(SetupError::FunctionIndexOutOfBounds)?),
            None => None,
        };

        let instance = InstanceEntity {
            module: module.clone(),
            funcaddrs,
            memaddrs,
            tableaddrs,
            globaladdrs,
            exports,
        };
        let instance_handle = instance_placeholder;
        *ctx.as_context_mut().store.resolve_instance_mut(instance_handle) = instance;

        if let Some(func) = start_func {
            crate::engine::call_func(ctx.as_context_mut(), func, &[], &mut [])?;
        }

        Ok(instance_handle)
    }

    /// Looks up an export by name.
    pub fn get_export(&self, ctx: impl AsContext, name: &str) -> Option<Extern> {
        ctx.as_context().store.resolve_instance(*self).get_export(name)
    }

    /// Iterates over all exports.
    pub fn exports<'a, T>(&self, ctx: &'a impl AsContext<UserState = T>) -> ExportsIter<'a> {
        let entity = ctx.as_context().store.resolve_instance(*self);
        ExportsIter {
            inner: entity.exports.iter(),
        }
    }

    /// Ahead-of-time typed invocation of an exported function.
    ///
    /// Validates argument count and types against the export's declared
    /// signature, then runs the interpreter to completion.
    pub fn invoke_typed<T>(
        &self,
        mut ctx: impl AsContextMut<UserState = T>,
        name: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, InvokeError> {
        let export = ctx
            .as_context()
            .store
            .resolve_instance(*self)
            .get_export(name)
            .ok_or(InvokeError::Setup(SetupError::FuncIndexExceedsTypesLength))?;
        let func = export.into_func().ok_or(InvokeError::Setup(SetupError::FuncIndexExceedsTypesLength))?;
        let signature = crate::engine::func_signature(&ctx, func)?;

        if args.len() != signature.params().len() {
            return Err(InvokeError::Setup(SetupError::ParamCountMismatch));
        }
        for (index, (arg, expected)) in args.iter().zip(signature.params()).enumerate() {
            if arg.value_type() != *expected {
                return Err(InvokeError::Setup(SetupError::ParamTypeMismatch {
                    index,
                    expected: *expected,
                    found: arg.value_type(),
                }));
            }
        }
        if signature.results().len() > 1 {
            return Err(InvokeError::Setup(SetupError::OnlySingleReturnValueSupported));
        }

        let mut results: Vec<Value> = signature.results().iter().map(|ty| Value::default_for(*ty)).collect();
        crate::engine::call_func(ctx.as_context_mut(), func, args, &mut results)?;
        Ok(results)
    }

    /// Invokes an exported function with values already encoded as 64-bit
    /// cells, checking only argument counts.
    pub fn invoke_dynamic<T>(
        &self,
        mut ctx: impl AsContextMut<UserState = T>,
        name: &str,
        in_values: &[Value],
        out_values: &mut [Value],
    ) -> Result<(), InvokeError> {
        let export = ctx
            .as_context()
            .store
            .resolve_instance(*self)
            .get_export(name)
            .ok_or(InvokeError::Setup(SetupError::FuncIndexExceedsTypesLength))?;
        let func = export.into_func().ok_or(InvokeError::Setup(SetupError::FuncIndexExceedsTypesLength))?;
        if crate::engine::is_host_func(&ctx, func) {
            return Err(InvokeError::Setup(SetupError::InvokeDynamicHostFunctionNotImplemented));
        }
        let signature = crate::engine::func_signature(&ctx, func)?;
        if in_values.len() != signature.params().len() {
            return Err(InvokeError::Setup(SetupError::ParamCountMismatch));
        }
        if signature.results().len() > 1 || out_values.len() != signature.results().len() {
            return Err(InvokeError::Setup(SetupError::OnlySingleReturnValueSupported));
        }
        crate::engine::call_func(ctx.as_context_mut(), func, in_values, out_values)?;
        Ok(())
    }
}

/// Errors surfaced from [`Instance::invoke_typed`]/[`Instance::invoke_dynamic`]:
/// either a setup-time rejection or a runtime trap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// The call was rejected before execution began.
    Setup(SetupError),
    /// Execution trapped.
    Trap(TrapCode),
}

impl From<SetupError> for InvokeError {
    fn from(error: SetupError) -> Self {
        Self::Setup(error)
    }
}

impl From<TrapCode> for InvokeError {
    fn from(error: TrapCode) -> Self {
        Self::Trap(error)
    }
}

impl std::fmt::Display for InvokeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup(error) => write!(f, "{error}"),
            Self::Trap(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for InvokeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{
        DropKeep, ElementSegment, Export, FunctionDef, FunctionType, Import, Instruction, Keep, MemoryDef, Target,
        TableDef,
    };
    use crate::{Engine, Store};
    use Instruction::*;

    fn add_module() -> Module {
        let fn_type = FunctionType::new([ValueType::I32, ValueType::I32], [ValueType::I32]);
        Module {
            types: vec![fn_type],
            functions: vec![FunctionDef {
                type_index: 0,
                locals_count: 0,
                code: vec![LocalGet(0), LocalGet(1), I32Add, End],
            }],
            exports: vec![Export {
                name: "add".to_string(),
                idx: ExternIdx::Func(0),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn add_returns_sum() {
        let engine = Engine::default();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, add_module()).unwrap();
        let results = instance.invoke_typed(&mut store, "add", &[Value::I32(2), Value::I32(3)]).unwrap();
        assert_eq!(results, vec![Value::I32(5)]);
    }

    /// A table with one function slot, populated by an active element
    /// segment, called through `call_indirect`.
    fn call_indirect_module() -> Module {
        let fn_type = FunctionType::new([ValueType::I32], [ValueType::I32]);
        Module {
            types: vec![fn_type],
            tables: vec![TableDef { initial: 1, maximum: Some(1) }],
            functions: vec![FunctionDef {
                type_index: 0,
                locals_count: 0,
                code: vec![LocalGet(0), I32Const(1), I32Add, End],
            }],
            elements: vec![ElementSegment {
                table_index: 0,
                offset_expr: vec![I32Const(0)],
                func_indices: vec![0],
            }],
            exports: vec![Export {
                name: "call_it".to_string(),
                idx: ExternIdx::Func(1),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn call_indirect_dispatches_through_table() {
        let fn_type = FunctionType::new([ValueType::I32], [ValueType::I32]);
        let mut module = call_indirect_module();
        module.types.push(fn_type);
        module.functions.push(FunctionDef {
            type_index: 1,
            locals_count: 0,
            code: vec![LocalGet(0), I32Const(0), CallIndirect { type_index: 0, table_index: 0 }, End],
        });
        module.exports[0].idx = ExternIdx::Func(1);

        let engine = Engine::default();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, module).unwrap();
        let results = instance.invoke_typed(&mut store, "call_it", &[Value::I32(41)]).unwrap();
        assert_eq!(results, vec![Value::I32(42)]);
    }

    #[test]
    fn call_indirect_out_of_range_traps_undefined_element() {
        let fn_type = FunctionType::new([ValueType::I32], [ValueType::I32]);
        let mut module = call_indirect_module();
        module.types.push(fn_type);
        module.functions.push(FunctionDef {
            type_index: 1,
            locals_count: 0,
            code: vec![LocalGet(0), I32Const(5), CallIndirect { type_index: 0, table_index: 0 }, End],
        });
        module.exports[0].idx = ExternIdx::Func(1);

        let engine = Engine::default();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, module).unwrap();
        let err = instance.invoke_typed(&mut store, "call_it", &[Value::I32(41)]).unwrap_err();
        assert_eq!(err, InvokeError::Trap(TrapCode::UndefinedElement));
    }

    #[test]
    fn element_segment_past_table_end_rejected_at_instantiation() {
        let mut module = call_indirect_module();
        module.elements[0].func_indices = vec![0, 0];

        let engine = Engine::default();
        let mut store = Store::new(&engine, ());
        let err = Instance::new(&mut store, module).unwrap_err();
        assert_eq!(err, InvokeError::Trap(TrapCode::UndefinedElement));
    }

    #[test]
    fn div_by_zero_traps() {
        let fn_type = FunctionType::new([ValueType::I32, ValueType::I32], [ValueType::I32]);
        let module = Module {
            types: vec![fn_type],
            functions: vec![FunctionDef {
                type_index: 0,
                locals_count: 0,
                code: vec![LocalGet(0), LocalGet(1), I32DivS, End],
            }],
            exports: vec![Export {
                name: "div".to_string(),
                idx: ExternIdx::Func(0),
            }],
            ..Default::default()
        };
        let engine = Engine::default();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, module).unwrap();
        let err = instance.invoke_typed(&mut store, "div", &[Value::I32(10), Value::I32(0)]).unwrap_err();
        assert_eq!(err, InvokeError::Trap(TrapCode::IntegerDivideByZero));
    }

    /// A 1-page memory: an access of 4 bytes succeeds right up to the page
    /// boundary and traps one byte past it.
    #[test]
    fn memory_load_past_page_end_traps() {
        let fn_type = FunctionType::new([ValueType::I32], [ValueType::I32]);
        let module = Module {
            types: vec![fn_type],
            memories: vec![MemoryDef {
                initial_pages: 1,
                maximum_pages: None,
            }],
            functions: vec![FunctionDef {
                type_index: 0,
                locals_count: 0,
                code: vec![LocalGet(0), I32Load(0), End],
            }],
            exports: vec![Export {
                name: "peek".to_string(),
                idx: ExternIdx::Func(0),
            }],
            ..Default::default()
        };
        let engine = Engine::default();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, module).unwrap();

        let ok = instance.invoke_typed(&mut store, "peek", &[Value::I32(65532)]).unwrap();
        assert_eq!(ok, vec![Value::I32(0)]);

        let err = instance.invoke_typed(&mut store, "peek", &[Value::I32(65533)]).unwrap_err();
        assert_eq!(err, InvokeError::Trap(TrapCode::OutOfBoundsMemoryAccess));
    }

    #[test]
    fn loop_sum_via_loop_and_br_if() {
        let fn_type = FunctionType::new([ValueType::I32], [ValueType::I32]);
        let none = DropKeep { drop: 0, keep: Keep::None };
        // sum = local(1), i = local(2); breaks out of the loop/block pair
        // once i > n, leaving the running sum to be read back at the end.
        let code = vec![
            I32Const(0),
            LocalSet(1),
            I32Const(1),
            LocalSet(2),
            Block { return_arity: 0 },
            Loop { return_arity: 0 },
            LocalGet(2),
            LocalGet(0),
            I32GtS,
            BrIfNez(Target {
                dst_pc: 19,
                drop_keep: none,
                label_drop: 2,
            }),
            LocalGet(1),
            LocalGet(2),
            I32Add,
            LocalSet(1),
            LocalGet(2),
            I32Const(1),
            I32Add,
            LocalSet(2),
            Br(Target {
                dst_pc: 6,
                drop_keep: none,
                label_drop: 0,
            }),
            LocalGet(1),
            End,
        ];
        let module = Module {
            types: vec![fn_type],
            functions: vec![FunctionDef {
                type_index: 0,
                locals_count: 2,
                code,
            }],
            exports: vec![Export {
                name: "loop_sum".to_string(),
                idx: ExternIdx::Func(0),
            }],
            ..Default::default()
        };
        let engine = Engine::default();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, module).unwrap();

        let sum = instance.invoke_typed(&mut store, "loop_sum", &[Value::I32(10)]).unwrap();
        assert_eq!(sum, vec![Value::I32(55)]);
        let zero = instance.invoke_typed(&mut store, "loop_sum", &[Value::I32(0)]).unwrap();
        assert_eq!(zero, vec![Value::I32(0)]);
    }

    #[test]
    fn host_import_observes_call_exactly_once() {
        let log_type = FunctionType::new([ValueType::I32], []);
        let module = Module {
            types: vec![log_type.clone()],
            imports: vec![Import {
                module_name: "env".to_string(),
                name: "log".to_string(),
                idx: ExternIdx::Func(0),
            }],
            functions: vec![FunctionDef {
                type_index: 0,
                locals_count: 0,
                code: vec![LocalGet(0), Call(0), End],
            }],
            exports: vec![Export {
                name: "call_log".to_string(),
                idx: ExternIdx::Func(1),
            }],
            ..Default::default()
        };

        let engine = Engine::default();
        let mut store = Store::new(&engine, Vec::<i32>::new());
        let host_func = crate::func::HostFunc::new(log_type, |mut caller: crate::func::Caller<'_, Vec<i32>>, inputs, _outputs| {
            let Value::I32(v) = inputs[0] else { unreachable!() };
            caller.state_mut().push(v);
            Ok(())
        });
        store.add_host_function("env", "log", host_func);
        let instance = Instance::new(&mut store, module).unwrap();

        instance.invoke_typed(&mut store, "call_log", &[Value::I32(42)]).unwrap();
        assert_eq!(store.state(), &vec![42]);
    }

    #[test]
    fn br_table_dispatches_by_selector() {
        let fn_type = FunctionType::new([ValueType::I32], [ValueType::I32]);
        let none = DropKeep { drop: 0, keep: Keep::None };
        let targets: Box<[Target]> = vec![
            Target {
                dst_pc: 2,
                drop_keep: none,
                label_drop: 0,
            },
            Target {
                dst_pc: 4,
                drop_keep: none,
                label_drop: 0,
            },
            Target {
                dst_pc: 6,
                drop_keep: none,
                label_drop: 0,
            },
            Target {
                dst_pc: 8,
                drop_keep: none,
                label_drop: 0,
            },
        ]
        .into_boxed_slice();
        let code = vec![
            LocalGet(0),
            BrTable(targets),
            I32Const(0),
            Br(Target {
                dst_pc: 9,
                drop_keep: none,
                label_drop: 0,
            }),
            I32Const(1),
            Br(Target {
                dst_pc: 9,
                drop_keep: none,
                label_drop: 0,
            }),
            I32Const(2),
            Br(Target {
                dst_pc: 9,
                drop_keep: none,
                label_drop: 0,
            }),
            I32Const(3),
            End,
        ];
        let module = Module {
            types: vec![fn_type],
            functions: vec![FunctionDef {
                type_index: 0,
                locals_count: 0,
                code,
            }],
            exports: vec![Export {
                name: "select".to_string(),
                idx: ExternIdx::Func(0),
            }],
            ..Default::default()
        };
        let engine = Engine::default();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, module).unwrap();

        let out_of_range = instance.invoke_typed(&mut store, "select", &[Value::I32(5)]).unwrap();
        assert_eq!(out_of_range, vec![Value::I32(3)]);
        let direct = instance.invoke_typed(&mut store, "select", &[Value::I32(1)]).unwrap();
        assert_eq!(direct, vec![Value::I32(1)]);
    }
}
