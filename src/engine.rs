//! The `wasmstack` interpreter: a recursive-descent dispatch loop over a
//! flat, pre-decoded instruction array.
//!
//! # Note
//!
//! Every nested Wasm `call` recurses into [`execute`] rather than pushing
//! onto an explicit frame array; the host call stack holds the "return pc"
//! implicitly. The explicit `frame_stack_size` limit is still enforced via a
//! plain depth counter threaded through the recursion, so a pathologically
//! deep call chain still traps with `StackOverflow` instead of overflowing
//! the host stack.

use std::sync::Arc;

use spin::Mutex;

use crate::error::{SetupError, TrapCode};
use crate::func::{Func, FuncEntityInternal};
use crate::global::Global;
use crate::instance::Instance;
use crate::limits::Config;
use crate::module::{DropKeep, FunctionType, Instruction, Keep, Module, Target};
use crate::store::{AsContext, AsContextMut};
use crate::table::Table;
use crate::value::{FromUntyped, TryTruncate, UntypedValue, Value, ValueType};

/// The `wasmstack` interpreter.
///
/// # Note
/// Cheap to clone: it is a handle to shared, mutex-guarded [`Config`].
/// Most of its API takes `&self`, so it can be shared freely between
/// `Store`s.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<Mutex<Config>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Engine {
    /// Creates a new [`Engine`] with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Mutex::new(config)),
        }
    }

    /// Returns the [`Config`] this engine was created with.
    pub fn config(&self) -> Config {
        *self.inner.lock()
    }
}

/// The operand stack: a single flat run of untyped 64-bit cells shared by
/// every Wasm frame active in one top-level invocation.
#[derive(Debug)]
struct OperandStack {
    entries: Vec<UntypedValue>,
    capacity: usize,
}

impl OperandStack {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn push(&mut self, value: impl Into<UntypedValue>) -> Result<(), TrapCode> {
        if self.entries.len() >= self.capacity {
            return Err(TrapCode::StackOverflow);
        }
        self.entries.push(value.into());
        Ok(())
    }

    fn extend_zeros(&mut self, additional: usize) -> Result<(), TrapCode> {
        let new_len = self.entries.len().checked_add(additional).ok_or(TrapCode::StackOverflow)?;
        if new_len > self.capacity {
            return Err(TrapCode::StackOverflow);
        }
        self.entries.resize(new_len, UntypedValue::default());
        Ok(())
    }

    fn pop(&mut self) -> UntypedValue {
        self.entries.pop().expect("operand stack underflow")
    }

    fn pop_as<T: FromUntyped>(&mut self) -> T {
        self.pop().to::<T>()
    }

    fn last_mut(&mut self) -> &mut UntypedValue {
        let top = self.entries.len() - 1;
        &mut self.entries[top]
    }

    /// Evaluates `f` on the top two cells, reinterpreted as `T`, replacing
    /// them with the single result.
    fn pop_eval_as<T, F>(&mut self, f: F)
    where
        T: FromUntyped + Into<UntypedValue>,
        F: FnOnce(T, T) -> T,
    {
        let rhs = self.pop().to::<T>();
        let lhs_cell = self.last_mut();
        let lhs = lhs_cell.to::<T>();
        *lhs_cell = f(lhs, rhs).into();
    }

    /// Like [`OperandStack::pop_eval_as`], but `f` may trap.
    fn try_pop_eval_as<T, F>(&mut self, f: F) -> Result<(), TrapCode>
    where
        T: FromUntyped + Into<UntypedValue>,
        F: FnOnce(T, T) -> Result<T, TrapCode>,
    {
        let rhs = self.pop_as::<T>();
        let lhs = self.pop_as::<T>();
        self.push(f(lhs, rhs)?)
    }

    /// Evaluates `f` on the single top cell, reinterpreted as `T`.
    fn eval_top_as<T, F>(&mut self, f: F)
    where
        T: FromUntyped + Into<UntypedValue>,
        F: FnOnce(T) -> T,
    {
        let cell = self.last_mut();
        let value = cell.to::<T>();
        *cell = f(value).into();
    }

    /// Like [`OperandStack::eval_top_as`], with a possibly trapping `f` and a
    /// possibly different result type `R`.
    fn try_eval_top_as<T, R, F>(&mut self, f: F) -> Result<(), TrapCode>
    where
        T: FromUntyped,
        R: Into<UntypedValue>,
        F: FnOnce(T) -> Result<R, TrapCode>,
    {
        let value = self.pop_as::<T>();
        self.push(f(value)?)
    }

    /// Applies the drop/keep rewrite of a resolved branch or return: drops
    /// `drop_keep.drop` cells, optionally preserving the single cell above
    /// them.
    fn drop_keep(&mut self, drop_keep: DropKeep) {
        let drop = drop_keep.drop as usize;
        if drop == 0 {
            return;
        }
        match drop_keep.keep {
            Keep::None => {
                let new_len = self.entries.len() - drop;
                self.entries.truncate(new_len);
            }
            Keep::Single => {
                let kept = self.pop();
                let new_len = self.entries.len() - drop;
                self.entries.truncate(new_len);
                self.entries.push(kept);
            }
        }
    }
}

/// One entry of the runtime label stack: just enough to capacity-check
/// nesting depth and to sanity-check the operand stack height invariant at
/// function exit. Pre-resolved [`Target`]s carry their own jump destination
/// and drop/keep, so branches never need to read a `Label`'s fields.
#[derive(Debug, Copy, Clone)]
struct LabelFrame {
    return_arity: u32,
    op_stack_base: usize,
}

#[derive(Debug)]
struct LabelStack {
    entries: Vec<LabelFrame>,
    capacity: usize,
}

impl LabelStack {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn push(&mut self, label: LabelFrame) -> Result<(), TrapCode> {
        if self.entries.len() >= self.capacity {
            return Err(TrapCode::StackOverflow);
        }
        self.entries.push(label);
        Ok(())
    }

    fn pop(&mut self) -> LabelFrame {
        self.entries.pop().expect("label stack underflow")
    }

    fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }
}

/// The stacks shared across every Wasm frame of one top-level invocation.
struct Stacks {
    operands: OperandStack,
    labels: LabelStack,
    frame_stack_size: usize,
}

/// Looks up `func`'s declared signature, whether it is a Wasm or host
/// function.
pub(crate) fn func_signature<T>(ctx: &impl AsContext<UserState = T>, func: Func) -> Result<FunctionType, SetupError> {
    let entity = ctx.as_context().store.resolve_func(func)?;
    match entity.as_internal() {
        FuncEntityInternal::Host(host_func) => Ok(host_func.signature().clone()),
        FuncEntityInternal::Wasm { instance, func_idx } => {
            let module = ctx.as_context().store.resolve_instance(*instance).module();
            module
                .function_type_at(*func_idx)
                .cloned()
                .ok_or(SetupError::FuncIndexExceedsTypesLength)
        }
    }
}

/// Returns `true` if `func` is a host function.
pub(crate) fn is_host_func<T>(ctx: &impl AsContext<UserState = T>, func: Func) -> bool {
    let entity = ctx.as_context().store.resolve_func(func).expect("func handle out of bounds");
    matches!(entity.as_internal(), FuncEntityInternal::Host(_))
}

/// Evaluates a constant-expression instruction sequence (a global
/// initializer, or an element/data segment's offset) to a single value.
///
/// Constant expressions are a tightly restricted subset of the full
/// instruction set (`*.const`, `global.get` of an imported immutable
/// global): this walks the sequence directly rather than spinning up a full
/// [`Stacks`]/label-stack for what is always a one- or two-instruction
/// program.
pub(crate) fn eval_const_expr<T>(
    expr: &[Instruction],
    globals: &[Global],
    ctx: &mut impl AsContextMut<UserState = T>,
) -> Result<Value, SetupError> {
    let mut result = None;
    for inst in expr {
        let value = match inst {
            Instruction::I32Const(v) => Value::I32(*v),
            Instruction::I64Const(v) => Value::I64(*v),
            Instruction::F32Const(v) => Value::F32(*v),
            Instruction::F64Const(v) => Value::F64(*v),
            Instruction::GlobalGet(idx) => {
                let global = *globals.get(*idx as usize).ok_or(SetupError::GlobalIndexOutOfBounds)?;
                global.get(ctx.as_context())
            }
            Instruction::End => break,
            _ => return Err(SetupError::FuncIndexExceedsTypesLength),
        };
        result = Some(value);
    }
    result.ok_or(SetupError::FuncIndexExceedsTypesLength)
}

/// Runs `func` to completion against `inputs`, writing its result (if any)
/// into `outputs`.
///
/// `inputs`/`outputs` are already known to match `func`'s declared
/// signature in length and per-slot type; this only handles execution.
pub(crate) fn call_func<T>(
    mut ctx: impl AsContextMut<UserState = T>,
    func: Func,
    inputs: &[Value],
    outputs: &mut [Value],
) -> Result<(), TrapCode> {
    let internal = ctx
        .as_context()
        .store
        .resolve_func(func)
        .expect("func handle out of bounds")
        .as_internal()
        .clone();
    match internal {
        FuncEntityInternal::Host(host_func) => {
            let caller = crate::func::Caller {
                store: ctx.as_context_mut(),
            };
            host_func.call(caller, inputs, outputs)
        }
        FuncEntityInternal::Wasm { instance, func_idx } => {
            let config = ctx.as_context().store.engine().config();
            let mut stacks = Stacks {
                operands: OperandStack::new(config.operand_stack_size()),
                labels: LabelStack::new(config.label_stack_size()),
                frame_stack_size: config.frame_stack_size(),
            };
            for input in inputs {
                stacks.operands.push(UntypedValue::from(*input))?;
            }
            let return_arity = outputs.len() as u32;
            execute(ctx.as_context_mut(), instance, func_idx, return_arity, &mut stacks, 0)?;
            for output in outputs.iter_mut().rev() {
                *output = stacks.operands.pop().with_type(output.value_type());
            }
            Ok(())
        }
    }
}

/// Dispatches a `call`/`call_indirect` target reached mid-execution: pops
/// its arguments (already sitting on top of `stacks.operands`, per the
/// shared-operand-stack calling convention) and, for a host function,
/// pushes its results back; for a Wasm function, recurses into [`execute`].
fn dispatch_call<T>(
    mut ctx: impl AsContextMut<UserState = T>,
    func: Func,
    stacks: &mut Stacks,
    depth: usize,
) -> Result<(), TrapCode> {
    let internal = ctx
        .as_context()
        .store
        .resolve_func(func)
        .expect("func handle out of bounds")
        .as_internal()
        .clone();
    match internal {
        FuncEntityInternal::Host(host_func) => {
            let signature = host_func.signature().clone();
            let mut inputs = vec![Value::I32(0); signature.params().len()];
            for (slot, param_ty) in inputs.iter_mut().zip(signature.params()).rev() {
                *slot = stacks.operands.pop().with_type(*param_ty);
            }
            let mut outputs: Vec<Value> = signature.results().iter().map(|ty| Value::default_for(*ty)).collect();
            let caller = crate::func::Caller {
                store: ctx.as_context_mut(),
            };
            host_func.call(caller, &inputs, &mut outputs)?;
            for output in outputs {
                stacks.operands.push(UntypedValue::from(output))?;
            }
            Ok(())
        }
        FuncEntityInternal::Wasm { instance, func_idx } => {
            let module = ctx.as_context().store.resolve_instance(instance).module_arc();
            let return_arity = module.function_type_at(func_idx).map(|ty| ty.results().len()).unwrap_or(0) as u32;
            execute(ctx, instance, func_idx, return_arity, stacks, depth + 1)
        }
    }
}

/// Reads a table slot for `call_indirect`, checking its declared type
/// against `type_index` before returning the callee.
fn resolve_indirect_callee<T>(
    ctx: &impl AsContext<UserState = T>,
    instance: Instance,
    table_index: u32,
    type_index: u32,
    elem_index: i32,
) -> Result<Func, TrapCode> {
    let elem_index: u32 = elem_index.try_into().map_err(|_| TrapCode::UndefinedElement)?;
    let table: Table = ctx
        .as_context()
        .store
        .resolve_instance(instance)
        .get_table(table_index)
        .expect("valid table index");
    if elem_index >= table.len(ctx.as_context()) {
        return Err(TrapCode::UndefinedElement);
    }
    let func = table.get(ctx.as_context(), elem_index)?.ok_or(TrapCode::UninitializedElement)?;
    let expected = ctx
        .as_context()
        .store
        .resolve_instance(instance)
        .module()
        .types
        .get(type_index as usize)
        .expect("valid type index");
    let actual = func_signature(ctx, func).map_err(|_| TrapCode::IndirectCallTypeMismatch)?;
    if actual != *expected {
        return Err(TrapCode::IndirectCallTypeMismatch);
    }
    Ok(func)
}

fn apply_branch(stacks: &mut Stacks, target: &Target) {
    stacks.operands.drop_keep(target.drop_keep);
    let new_label_len = stacks.labels.len() - target.label_drop as usize;
    stacks.labels.truncate(new_label_len);
}

fn effective_memory<T>(ctx: &impl AsContext<UserState = T>, instance: Instance) -> crate::memory::Memory {
    ctx.as_context()
        .store
        .resolve_instance(instance)
        .get_memory(0)
        .expect("memory.load/store requires a memory at index 0")
}

macro_rules! load_instr {
    ($stacks:expr, $ctx:expr, $instance:expr, $offset:expr, $wide:ty, $narrow:ty) => {{
        let memory = effective_memory(&$ctx, $instance);
        let addr = $stacks.operands.pop_as::<u32>();
        let entity = $ctx
            .as_context()
            .store
            .resolve_memory(memory)
            .expect("memory handle out of bounds");
        let value: $narrow = entity.read::<$narrow>(addr, *$offset)?;
        $stacks.operands.push(value as $wide)?;
    }};
}

macro_rules! store_instr {
    ($stacks:expr, $ctx:expr, $instance:expr, $offset:expr, $pop_ty:ty, $write_ty:ty) => {{
        let memory = effective_memory(&$ctx, $instance);
        let value = $stacks.operands.pop_as::<$pop_ty>() as $write_ty;
        let addr = $stacks.operands.pop_as::<u32>();
        let entity = $ctx
            .as_context_mut()
            .store
            .resolve_memory_mut(memory)
            .expect("memory handle out of bounds");
        entity.write(addr, *$offset, value)?;
    }};
}

/// Runs the function at `func_idx` (in `instance`'s combined function index
/// space) starting at program counter 0, leaving exactly its declared
/// `return_arity` result cells (0 or 1) on top of `stacks.operands` when it
/// returns normally.
fn execute<T>(
    mut ctx: impl AsContextMut<UserState = T>,
    instance: Instance,
    func_idx: u32,
    return_arity: u32,
    stacks: &mut Stacks,
    depth: usize,
) -> Result<(), TrapCode> {
    if depth >= stacks.frame_stack_size {
        return Err(TrapCode::StackOverflow);
    }

    let module: Arc<Module> = ctx.as_context().store.resolve_instance(instance).module_arc();
    let local_idx = (func_idx as usize) - module.imported_function_count();
    let function_def = &module.functions[local_idx];
    let code = &function_def.code;

    // Arguments are already sitting atop the shared operand stack (pushed by
    // the caller before reaching this call); locals_count additional zeroed
    // slots are appended here, after op_stack_base is fixed at the start of
    // the parameter run.
    let op_stack_base = stacks.operands.len() - param_count(&module, func_idx);
    stacks.operands.extend_zeros(function_def.locals_count as usize)?;
    let label_stack_base = stacks.labels.len();
    stacks.labels.push(LabelFrame {
        return_arity,
        op_stack_base,
    })?;

    let mut pc: usize = 0;
    loop {
        let inst = &code[pc];
        match inst {
            Instruction::Block { return_arity } => {
                stacks.labels.push(LabelFrame {
                    return_arity: *return_arity,
                    op_stack_base: stacks.operands.len(),
                })?;
                pc += 1;
            }
            Instruction::Loop { return_arity } => {
                stacks.labels.push(LabelFrame {
                    return_arity: *return_arity,
                    op_stack_base: stacks.operands.len(),
                })?;
                pc += 1;
            }
            Instruction::If { return_arity, else_pc } => {
                let condition = stacks.operands.pop_as::<i32>();
                stacks.labels.push(LabelFrame {
                    return_arity: *return_arity,
                    op_stack_base: stacks.operands.len(),
                })?;
                pc = if condition != 0 { pc + 1 } else { *else_pc as usize };
            }
            Instruction::Else { end_pc } => {
                pc = *end_pc as usize;
            }
            Instruction::End => {
                let label = stacks.labels.pop();
                if stacks.labels.len() == label_stack_base {
                    debug_assert_eq!(label.op_stack_base, op_stack_base);
                    finish(stacks, op_stack_base, return_arity);
                    return Ok(());
                }
                pc += 1;
            }

            Instruction::LocalGet(n) => {
                let value = stacks.operands.entries[op_stack_base + *n as usize];
                stacks.operands.push(value)?;
                pc += 1;
            }
            Instruction::LocalSet(n) => {
                let value = stacks.operands.pop();
                stacks.operands.entries[op_stack_base + *n as usize] = value;
                pc += 1;
            }
            Instruction::LocalTee(n) => {
                let value = *stacks.operands.last_mut();
                stacks.operands.entries[op_stack_base + *n as usize] = value;
                pc += 1;
            }

            Instruction::Br(target) => {
                apply_branch(stacks, target);
                pc = target.dst_pc as usize;
            }
            Instruction::BrIfEqz(target) => {
                let condition = stacks.operands.pop_as::<i32>();
                if condition == 0 {
                    apply_branch(stacks, target);
                    pc = target.dst_pc as usize;
                } else {
                    pc += 1;
                }
            }
            Instruction::BrIfNez(target) => {
                let condition = stacks.operands.pop_as::<i32>();
                if condition != 0 {
                    apply_branch(stacks, target);
                    pc = target.dst_pc as usize;
                } else {
                    pc += 1;
                }
            }
            Instruction::BrTable(targets) => {
                let selector = stacks.operands.pop_as::<i32>();
                let selector = usize::try_from(selector).unwrap_or(usize::MAX);
                let target = targets.get(selector).unwrap_or_else(|| targets.last().expect("br_table always carries a default target"));
                apply_branch(stacks, target);
                pc = target.dst_pc as usize;
            }

            Instruction::Unreachable => return Err(TrapCode::UnreachableExecuted),
            Instruction::Return(drop_keep) => {
                stacks.operands.drop_keep(*drop_keep);
                stacks.labels.truncate(label_stack_base);
                finish(stacks, op_stack_base, return_arity);
                return Ok(());
            }

            Instruction::Call(callee_idx) => {
                let callee = ctx
                    .as_context()
                    .store
                    .resolve_instance(instance)
                    .get_func(*callee_idx)
                    .expect("valid function index");
                dispatch_call(ctx.as_context_mut(), callee, stacks, depth)?;
                pc += 1;
            }
            Instruction::CallIndirect { type_index, table_index } => {
                let elem_index = stacks.operands.pop_as::<i32>();
                let callee = resolve_indirect_callee(&ctx, instance, *table_index, *type_index, elem_index)?;
                dispatch_call(ctx.as_context_mut(), callee, stacks, depth)?;
                pc += 1;
            }

            Instruction::Drop => {
                stacks.operands.pop();
                pc += 1;
            }
            Instruction::Select => {
                let condition = stacks.operands.pop_as::<i32>();
                let on_false = stacks.operands.pop();
                let on_true = stacks.operands.pop();
                stacks.operands.push(if condition != 0 { on_true } else { on_false })?;
                pc += 1;
            }

            Instruction::GlobalGet(idx) => {
                let global = ctx
                    .as_context()
                    .store
                    .resolve_instance(instance)
                    .get_global(*idx)
                    .expect("valid global index");
                let value = global.get(ctx.as_context());
                stacks.operands.push(UntypedValue::from(value))?;
                pc += 1;
            }
            Instruction::GlobalSet(idx) => {
                let global = ctx
                    .as_context()
                    .store
                    .resolve_instance(instance)
                    .get_global(*idx)
                    .expect("valid global index");
                let value_type = global.value_type(ctx.as_context());
                let raw = stacks.operands.pop();
                global
                    .set(ctx.as_context_mut(), raw.with_type(value_type))
                    .expect("global.set of a validated module always matches type and mutability");
                pc += 1;
            }

            Instruction::I32Load(offset) => load_instr!(stacks, ctx, instance, offset, i32, i32),
            Instruction::I64Load(offset) => load_instr!(stacks, ctx, instance, offset, i64, i64),
            Instruction::F32Load(offset) => load_instr!(stacks, ctx, instance, offset, f32, f32),
            Instruction::F64Load(offset) => load_instr!(stacks, ctx, instance, offset, f64, f64),
            Instruction::I32Load8S(offset) => load_instr!(stacks, ctx, instance, offset, i32, i8),
            Instruction::I32Load8U(offset) => load_instr!(stacks, ctx, instance, offset, i32, u8),
            Instruction::I32Load16S(offset) => load_instr!(stacks, ctx, instance, offset, i32, i16),
            Instruction::I32Load16U(offset) => load_instr!(stacks, ctx, instance, offset, i32, u16),
            Instruction::I64Load8S(offset) => load_instr!(stacks, ctx, instance, offset, i64, i8),
            Instruction::I64Load8U(offset) => load_instr!(stacks, ctx, instance, offset, i64, u8),
            Instruction::I64Load16S(offset) => load_instr!(stacks, ctx, instance, offset, i64, i16),
            Instruction::I64Load16U(offset) => load_instr!(stacks, ctx, instance, offset, i64, u16),
            Instruction::I64Load32S(offset) => load_instr!(stacks, ctx, instance, offset, i64, i32),
            Instruction::I64Load32U(offset) => load_instr!(stacks, ctx, instance, offset, i64, u32),

            Instruction::I32Store(offset) => store_instr!(stacks, ctx, instance, offset, i32, i32),
            Instruction::I64Store(offset) => store_instr!(stacks, ctx, instance, offset, i64, i64),
            Instruction::F32Store(offset) => store_instr!(stacks, ctx, instance, offset, f32, f32),
            Instruction::F64Store(offset) => store_instr!(stacks, ctx, instance, offset, f64, f64),
            Instruction::I32Store8(offset) => store_instr!(stacks, ctx, instance, offset, i32, i8),
            Instruction::I32Store16(offset) => store_instr!(stacks, ctx, instance, offset, i32, i16),
            Instruction::I64Store8(offset) => store_instr!(stacks, ctx, instance, offset, i64, i8),
            Instruction::I64Store16(offset) => store_instr!(stacks, ctx, instance, offset, i64, i16),
            Instruction::I64Store32(offset) => store_instr!(stacks, ctx, instance, offset, i64, i32),

            Instruction::CurrentMemory => {
                let memory = effective_memory(&ctx, instance);
                stacks.operands.push(memory.size(ctx.as_context()) as i32)?;
                pc += 1;
            }
            Instruction::GrowMemory => {
                let memory = effective_memory(&ctx, instance);
                let delta = stacks.operands.pop_as::<u32>();
                let result = memory.grow(ctx.as_context_mut(), delta).map(|old| old as i32).unwrap_or(-1);
                stacks.operands.push(result)?;
                pc += 1;
            }

            Instruction::I32Const(v) => {
                stacks.operands.push(*v)?;
                pc += 1;
            }
            Instruction::I64Const(v) => {
                stacks.operands.push(*v)?;
                pc += 1;
            }
            Instruction::F32Const(v) => {
                stacks.operands.push(*v)?;
                pc += 1;
            }
            Instruction::F64Const(v) => {
                stacks.operands.push(*v)?;
                pc += 1;
            }

            Instruction::I32Eqz => {
                stacks.operands.eval_top_as::<i32, _>(|v| (v == 0) as i32);
                pc += 1;
            }
            Instruction::I32Eq => {
                stacks.operands.pop_eval_as::<i32, _>(|a, b| (a == b) as i32);
                pc += 1;
            }
            Instruction::I32Ne => {
                stacks.operands.pop_eval_as::<i32, _>(|a, b| (a != b) as i32);
                pc += 1;
            }
            Instruction::I32LtS => {
                stacks.operands.pop_eval_as::<i32, _>(|a, b| (a < b) as i32);
                pc += 1;
            }
            Instruction::I32LtU => {
                stacks.operands.pop_eval_as::<u32, _>(|a, b| (a < b) as u32);
                pc += 1;
            }
            Instruction::I32GtS => {
                stacks.operands.pop_eval_as::<i32, _>(|a, b| (a > b) as i32);
                pc += 1;
            }
            Instruction::I32GtU => {
                stacks.operands.pop_eval_as::<u32, _>(|a, b| (a > b) as u32);
                pc += 1;
            }
            Instruction::I32LeS => {
                stacks.operands.pop_eval_as::<i32, _>(|a, b| (a <= b) as i32);
                pc += 1;
            }
            Instruction::I32LeU => {
                stacks.operands.pop_eval_as::<u32, _>(|a, b| (a <= b) as u32);
                pc += 1;
            }
            Instruction::I32GeS => {
                stacks.operands.pop_eval_as::<i32, _>(|a, b| (a >= b) as i32);
                pc += 1;
            }
            Instruction::I32GeU => {
                stacks.operands.pop_eval_as::<u32, _>(|a, b| (a >= b) as u32);
                pc += 1;
            }

            Instruction::I64Eqz => {
                stacks.operands.eval_top_as::<i64, _>(|v| (v == 0) as i64);
                pc += 1;
            }
            Instruction::I64Eq => {
                stacks.operands.pop_eval_as::<i64, _>(|a, b| (a == b) as i64);
                pc += 1;
            }
            Instruction::I64Ne => {
                stacks.operands.pop_eval_as::<i64, _>(|a, b| (a != b) as i64);
                pc += 1;
            }
            Instruction::I64LtS => {
                stacks.operands.pop_eval_as::<i64, _>(|a, b| (a < b) as i64);
                pc += 1;
            }
            Instruction::I64LtU => {
                stacks.operands.pop_eval_as::<u64, _>(|a, b| (a < b) as u64);
                pc += 1;
            }
            Instruction::I64GtS => {
                stacks.operands.pop_eval_as::<i64, _>(|a, b| (a > b) as i64);
                pc += 1;
            }
            Instruction::I64GtU => {
                stacks.operands.pop_eval_as::<u64, _>(|a, b| (a > b) as u64);
                pc += 1;
            }
            Instruction::I64LeS => {
                stacks.operands.pop_eval_as::<i64, _>(|a, b| (a <= b) as i64);
                pc += 1;
            }
            Instruction::I64LeU => {
                stacks.operands.pop_eval_as::<u64, _>(|a, b| (a <= b) as u64);
                pc += 1;
            }
            Instruction::I64GeS => {
                stacks.operands.pop_eval_as::<i64, _>(|a, b| (a >= b) as i64);
                pc += 1;
            }
            Instruction::I64GeU => {
                stacks.operands.pop_eval_as::<u64, _>(|a, b| (a >= b) as u64);
                pc += 1;
            }

            Instruction::F32Eq => {
                stacks.operands.pop_eval_as::<f32, _>(|a, b| i32_bool(a == b) as f32);
                pc += 1;
            }
            Instruction::F32Ne => {
                stacks.operands.pop_eval_as::<f32, _>(|a, b| i32_bool(a != b) as f32);
                pc += 1;
            }
            Instruction::F32Lt => {
                stacks.operands.pop_eval_as::<f32, _>(|a, b| i32_bool(a < b) as f32);
                pc += 1;
            }
            Instruction::F32Gt => {
                stacks.operands.pop_eval_as::<f32, _>(|a, b| i32_bool(a > b) as f32);
                pc += 1;
            }
            Instruction::F32Le => {
                stacks.operands.pop_eval_as::<f32, _>(|a, b| i32_bool(a <= b) as f32);
                pc += 1;
            }
            Instruction::F32Ge => {
                stacks.operands.pop_eval_as::<f32, _>(|a, b| i32_bool(a >= b) as f32);
                pc += 1;
            }

            Instruction::F64Eq => {
                stacks.operands.pop_eval_as::<f64, _>(|a, b| i32_bool(a == b) as f64);
                pc += 1;
            }
            Instruction::F64Ne => {
                stacks.operands.pop_eval_as::<f64, _>(|a, b| i32_bool(a != b) as f64);
                pc += 1;
            }
            Instruction::F64Lt => {
                stacks.operands.pop_eval_as::<f64, _>(|a, b| i32_bool(a < b) as f64);
                pc += 1;
            }
            Instruction::F64Gt => {
                stacks.operands.pop_eval_as::<f64, _>(|a, b| i32_bool(a > b) as f64);
                pc += 1;
            }
            Instruction::F64Le => {
                stacks.operands.pop_eval_as::<f64, _>(|a, b| i32_bool(a <= b) as f64);
                pc += 1;
            }
            Instruction::F64Ge => {
                stacks.operands.pop_eval_as::<f64, _>(|a, b| i32_bool(a >= b) as f64);
                pc += 1;
            }

            Instruction::I32Clz => {
                stacks.operands.eval_top_as::<i32, _>(|v| v.leading_zeros() as i32);
                pc += 1;
            }
            Instruction::I32Ctz => {
                stacks.operands.eval_top_as::<i32, _>(|v| v.trailing_zeros() as i32);
                pc += 1;
            }
            Instruction::I32Popcnt => {
                stacks.operands.eval_top_as::<i32, _>(|v| v.count_ones() as i32);
                pc += 1;
            }
            Instruction::I32Add => {
                stacks.operands.pop_eval_as::<i32, _>(i32::wrapping_add);
                pc += 1;
            }
            Instruction::I32Sub => {
                stacks.operands.pop_eval_as::<i32, _>(i32::wrapping_sub);
                pc += 1;
            }
            Instruction::I32Mul => {
                stacks.operands.pop_eval_as::<i32, _>(i32::wrapping_mul);
                pc += 1;
            }
            Instruction::I32DivS => {
                stacks.operands.try_pop_eval_as::<i32, _>(|a, b| {
                    if b == 0 {
                        return Err(TrapCode::IntegerDivideByZero);
                    }
                    a.checked_div(b).ok_or(TrapCode::IntegerOverflow)
                })?;
                pc += 1;
            }
            Instruction::I32DivU => {
                stacks.operands.try_pop_eval_as::<u32, _>(|a, b| a.checked_div(b).ok_or(TrapCode::IntegerDivideByZero))?;
                pc += 1;
            }
            Instruction::I32RemS => {
                stacks.operands.try_pop_eval_as::<i32, _>(|a, b| {
                    if b == 0 {
                        return Err(TrapCode::IntegerDivideByZero);
                    }
                    Ok(a.checked_rem(b).unwrap_or(0))
                })?;
                pc += 1;
            }
            Instruction::I32RemU => {
                stacks.operands.try_pop_eval_as::<u32, _>(|a, b| a.checked_rem(b).ok_or(TrapCode::IntegerDivideByZero))?;
                pc += 1;
            }
            Instruction::I32And => {
                stacks.operands.pop_eval_as::<i32, _>(|a, b| a & b);
                pc += 1;
            }
            Instruction::I32Or => {
                stacks.operands.pop_eval_as::<i32, _>(|a, b| a | b);
                pc += 1;
            }
            Instruction::I32Xor => {
                stacks.operands.pop_eval_as::<i32, _>(|a, b| a ^ b);
                pc += 1;
            }
            Instruction::I32Shl => {
                stacks.operands.pop_eval_as::<i32, _>(|a, b| a.wrapping_shl(b as u32));
                pc += 1;
            }
            Instruction::I32ShrS => {
                stacks.operands.pop_eval_as::<i32, _>(|a, b| a.wrapping_shr(b as u32));
                pc += 1;
            }
            Instruction::I32ShrU => {
                stacks.operands.pop_eval_as::<u32, _>(|a, b| a.wrapping_shr(b));
                pc += 1;
            }
            Instruction::I32Rotl => {
                stacks.operands.pop_eval_as::<u32, _>(|a, b| a.rotate_left(b));
                pc += 1;
            }
            Instruction::I32Rotr => {
                stacks.operands.pop_eval_as::<u32, _>(|a, b| a.rotate_right(b));
                pc += 1;
            }

            Instruction::I64Clz => {
                stacks.operands.eval_top_as::<i64, _>(|v| v.leading_zeros() as i64);
                pc += 1;
            }
            Instruction::I64Ctz => {
                stacks.operands.eval_top_as::<i64, _>(|v| v.trailing_zeros() as i64);
                pc += 1;
            }
            Instruction::I64Popcnt => {
                stacks.operands.eval_top_as::<i64, _>(|v| v.count_ones() as i64);
                pc += 1;
            }
            Instruction::I64Add => {
                stacks.operands.pop_eval_as::<i64, _>(i64::wrapping_add);
                pc += 1;
            }
            Instruction::I64Sub => {
                stacks.operands.pop_eval_as::<i64, _>(i64::wrapping_sub);
                pc += 1;
            }
            Instruction::I64Mul => {
                stacks.operands.pop_eval_as::<i64, _>(i64::wrapping_mul);
                pc += 1;
            }
            Instruction::I64DivS => {
                stacks.operands.try_pop_eval_as::<i64, _>(|a, b| {
                    if b == 0 {
                        return Err(TrapCode::IntegerDivideByZero);
                    }
                    a.checked_div(b).ok_or(TrapCode::IntegerOverflow)
                })?;
                pc += 1;
            }
            Instruction::I64DivU => {
                stacks.operands.try_pop_eval_as::<u64, _>(|a, b| a.checked_div(b).ok_or(TrapCode::IntegerDivideByZero))?;
                pc += 1;
            }
            Instruction::I64RemS => {
                stacks.operands.try_pop_eval_as::<i64, _>(|a, b| {
                    if b == 0 {
                        return Err(TrapCode::IntegerDivideByZero);
                    }
                    Ok(a.checked_rem(b).unwrap_or(0))
                })?;
                pc += 1;
            }
            Instruction::I64RemU => {
                stacks.operands.try_pop_eval_as::<u64, _>(|a, b| a.checked_rem(b).ok_or(TrapCode::IntegerDivideByZero))?;
                pc += 1;
            }
            Instruction::I64And => {
                stacks.operands.pop_eval_as::<i64, _>(|a, b| a & b);
                pc += 1;
            }
            Instruction::I64Or => {
                stacks.operands.pop_eval_as::<i64, _>(|a, b| a | b);
                pc += 1;
            }
            Instruction::I64Xor => {
                stacks.operands.pop_eval_as::<i64, _>(|a, b| a ^ b);
                pc += 1;
            }
            Instruction::I64Shl => {
                stacks.operands.pop_eval_as::<i64, _>(|a, b| a.wrapping_shl(b as u32));
                pc += 1;
            }
            Instruction::I64ShrS => {
                stacks.operands.pop_eval_as::<i64, _>(|a, b| a.wrapping_shr(b as u32));
                pc += 1;
            }
            Instruction::I64ShrU => {
                stacks.operands.pop_eval_as::<u64, _>(|a, b| a.wrapping_shr(b as u32));
                pc += 1;
            }
            Instruction::I64Rotl => {
                stacks.operands.pop_eval_as::<u64, _>(|a, b| a.rotate_left(b as u32));
                pc += 1;
            }
            Instruction::I64Rotr => {
                stacks.operands.pop_eval_as::<u64, _>(|a, b| a.rotate_right(b as u32));
                pc += 1;
            }

            Instruction::F32Abs => {
                stacks.operands.eval_top_as::<f32, _>(f32::abs);
                pc += 1;
            }
            Instruction::F32Neg => {
                stacks.operands.eval_top_as::<f32, _>(|v| -v);
                pc += 1;
            }
            Instruction::F32Ceil => {
                stacks.operands.eval_top_as::<f32, _>(f32::ceil);
                pc += 1;
            }
            Instruction::F32Floor => {
                stacks.operands.eval_top_as::<f32, _>(f32::floor);
                pc += 1;
            }
            Instruction::F32Trunc => {
                stacks.operands.eval_top_as::<f32, _>(f32::trunc);
                pc += 1;
            }
            Instruction::F32Nearest => {
                stacks.operands.eval_top_as::<f32, _>(nearest_f32);
                pc += 1;
            }
            Instruction::F32Sqrt => {
                stacks.operands.eval_top_as::<f32, _>(f32::sqrt);
                pc += 1;
            }
            Instruction::F32Add => {
                stacks.operands.pop_eval_as::<f32, _>(|a, b| a + b);
                pc += 1;
            }
            Instruction::F32Sub => {
                stacks.operands.pop_eval_as::<f32, _>(|a, b| a - b);
                pc += 1;
            }
            Instruction::F32Mul => {
                stacks.operands.pop_eval_as::<f32, _>(|a, b| a * b);
                pc += 1;
            }
            Instruction::F32Div => {
                stacks.operands.pop_eval_as::<f32, _>(|a, b| a / b);
                pc += 1;
            }
            Instruction::F32Min => {
                stacks.operands.pop_eval_as::<f32, _>(wasm_fmin);
                pc += 1;
            }
            Instruction::F32Max => {
                stacks.operands.pop_eval_as::<f32, _>(wasm_fmax);
                pc += 1;
            }
            Instruction::F32Copysign => {
                stacks.operands.pop_eval_as::<f32, _>(f32::copysign);
                pc += 1;
            }

            Instruction::F64Abs => {
                stacks.operands.eval_top_as::<f64, _>(f64::abs);
                pc += 1;
            }
            Instruction::F64Neg => {
                stacks.operands.eval_top_as::<f64, _>(|v| -v);
                pc += 1;
            }
            Instruction::F64Ceil => {
                stacks.operands.eval_top_as::<f64, _>(f64::ceil);
                pc += 1;
            }
            Instruction::F64Floor => {
                stacks.operands.eval_top_as::<f64, _>(f64::floor);
                pc += 1;
            }
            Instruction::F64Trunc => {
                stacks.operands.eval_top_as::<f64, _>(f64::trunc);
                pc += 1;
            }
            Instruction::F64Nearest => {
                stacks.operands.eval_top_as::<f64, _>(nearest_f64);
                pc += 1;
            }
            Instruction::F64Sqrt => {
                stacks.operands.eval_top_as::<f64, _>(f64::sqrt);
                pc += 1;
            }
            Instruction::F64Add => {
                stacks.operands.pop_eval_as::<f64, _>(|a, b| a + b);
                pc += 1;
            }
            Instruction::F64Sub => {
                stacks.operands.pop_eval_as::<f64, _>(|a, b| a - b);
                pc += 1;
            }
            Instruction::F64Mul => {
                stacks.operands.pop_eval_as::<f64, _>(|a, b| a * b);
                pc += 1;
            }
            Instruction::F64Div => {
                stacks.operands.pop_eval_as::<f64, _>(|a, b| a / b);
                pc += 1;
            }
            Instruction::F64Min => {
                stacks.operands.pop_eval_as::<f64, _>(wasm_fmin_f64);
                pc += 1;
            }
            Instruction::F64Max => {
                stacks.operands.pop_eval_as::<f64, _>(wasm_fmax_f64);
                pc += 1;
            }
            Instruction::F64Copysign => {
                stacks.operands.pop_eval_as::<f64, _>(f64::copysign);
                pc += 1;
            }

            Instruction::I32WrapI64 => {
                stacks.operands.try_eval_top_as::<i64, i32, _>(|v| Ok(v as i32))?;
                pc += 1;
            }
            Instruction::I32TruncSF32 => {
                stacks.operands.try_eval_top_as::<f32, i32, _>(|v| v.try_truncate())?;
                pc += 1;
            }
            Instruction::I32TruncUF32 => {
                stacks.operands.try_eval_top_as::<f32, u32, _>(|v| v.try_truncate())?;
                pc += 1;
            }
            Instruction::I32TruncSF64 => {
                stacks.operands.try_eval_top_as::<f64, i32, _>(|v| v.try_truncate())?;
                pc += 1;
            }
            Instruction::I32TruncUF64 => {
                stacks.operands.try_eval_top_as::<f64, u32, _>(|v| v.try_truncate())?;
                pc += 1;
            }
            Instruction::I64ExtendSI32 => {
                stacks.operands.try_eval_top_as::<i32, i64, _>(|v| Ok(v as i64))?;
                pc += 1;
            }
            Instruction::I64ExtendUI32 => {
                stacks.operands.try_eval_top_as::<u32, i64, _>(|v| Ok(v as i64))?;
                pc += 1;
            }
            Instruction::I64TruncSF32 => {
                stacks.operands.try_eval_top_as::<f32, i64, _>(|v| v.try_truncate())?;
                pc += 1;
            }
            Instruction::I64TruncUF32 => {
                stacks.operands.try_eval_top_as::<f32, u64, _>(|v| v.try_truncate())?;
                pc += 1;
            }
            Instruction::I64TruncSF64 => {
                stacks.operands.try_eval_top_as::<f64, i64, _>(|v| v.try_truncate())?;
                pc += 1;
            }
            Instruction::I64TruncUF64 => {
                stacks.operands.try_eval_top_as::<f64, u64, _>(|v| v.try_truncate())?;
                pc += 1;
            }
            Instruction::F32ConvertSI32 => {
                stacks.operands.try_eval_top_as::<i32, f32, _>(|v| Ok(v as f32))?;
                pc += 1;
            }
            Instruction::F32ConvertUI32 => {
                stacks.operands.try_eval_top_as::<u32, f32, _>(|v| Ok(v as f32))?;
                pc += 1;
            }
            Instruction::F32ConvertSI64 => {
                stacks.operands.try_eval_top_as::<i64, f32, _>(|v| Ok(v as f32))?;
                pc += 1;
            }
            Instruction::F32ConvertUI64 => {
                stacks.operands.try_eval_top_as::<u64, f32, _>(|v| Ok(v as f32))?;
                pc += 1;
            }
            Instruction::F32DemoteF64 => {
                stacks.operands.try_eval_top_as::<f64, f32, _>(|v| Ok(v as f32))?;
                pc += 1;
            }
            Instruction::F64ConvertSI32 => {
                stacks.operands.try_eval_top_as::<i32, f64, _>(|v| Ok(v as f64))?;
                pc += 1;
            }
            Instruction::F64ConvertUI32 => {
                stacks.operands.try_eval_top_as::<u32, f64, _>(|v| Ok(v as f64))?;
                pc += 1;
            }
            Instruction::F64ConvertSI64 => {
                stacks.operands.try_eval_top_as::<i64, f64, _>(|v| Ok(v as f64))?;
                pc += 1;
            }
            Instruction::F64ConvertUI64 => {
                stacks.operands.try_eval_top_as::<u64, f64, _>(|v| Ok(v as f64))?;
                pc += 1;
            }
            Instruction::F64PromoteF32 => {
                stacks.operands.try_eval_top_as::<f32, f64, _>(|v| Ok(v as f64))?;
                pc += 1;
            }

            Instruction::I32ReinterpretF32 => {
                stacks.operands.try_eval_top_as::<f32, i32, _>(|v| Ok(v.to_bits() as i32))?;
                pc += 1;
            }
            Instruction::I64ReinterpretF64 => {
                stacks.operands.try_eval_top_as::<f64, i64, _>(|v| Ok(v.to_bits() as i64))?;
                pc += 1;
            }
            Instruction::F32ReinterpretI32 => {
                stacks.operands.try_eval_top_as::<i32, f32, _>(|v| Ok(f32::from_bits(v as u32)))?;
                pc += 1;
            }
            Instruction::F64ReinterpretI64 => {
                stacks.operands.try_eval_top_as::<i64, f64, _>(|v| Ok(f64::from_bits(v as u64)))?;
                pc += 1;
            }
        }
    }
}

/// Truncates the operand stack back down to `op_stack_base`, preserving the
/// top `return_arity` (0 or 1) cells — the function-exit drop/keep implied
/// by the spec's Frame/Label bookkeeping.
fn finish(stacks: &mut Stacks, op_stack_base: usize, return_arity: u32) {
    debug_assert!(return_arity <= 1);
    if return_arity == 1 {
        let result = stacks.operands.pop();
        stacks.operands.entries.truncate(op_stack_base);
        stacks.operands.entries.push(result);
    } else {
        stacks.operands.entries.truncate(op_stack_base);
    }
}

fn param_count(module: &Module, func_idx: u32) -> usize {
    module.function_type_at(func_idx).map(|ty| ty.params().len()).unwrap_or(0)
}

fn i32_bool(value: bool) -> i32 {
    value as i32
}

fn nearest_f32(v: f32) -> f32 {
    let rounded = v.round();
    if (v.fract().abs() - 0.5).abs() < f32::EPSILON && (rounded as i64) % 2 != 0 {
        rounded - v.signum()
    } else {
        rounded
    }
}

fn nearest_f64(v: f64) -> f64 {
    let rounded = v.round();
    if (v.fract().abs() - 0.5).abs() < f64::EPSILON && (rounded as i64) % 2 != 0 {
        rounded - v.signum()
    } else {
        rounded
    }
}

fn wasm_fmin(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == 0.0_f32 && b == 0.0_f32 {
        return if a.is_sign_negative() || b.is_sign_negative() { -0.0 } else { 0.0 };
    }
    a.min(b)
}

fn wasm_fmax(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == 0.0_f32 && b == 0.0_f32 {
        return if a.is_sign_positive() || b.is_sign_positive() { 0.0 } else { -0.0 };
    }
    a.max(b)
}

fn wasm_fmin_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == 0.0_f64 && b == 0.0_f64 {
        return if a.is_sign_negative() || b.is_sign_negative() { -0.0 } else { 0.0 };
    }
    a.min(b)
}

fn wasm_fmax_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == 0.0_f64 && b == 0.0_f64 {
        return if a.is_sign_positive() || b.is_sign_positive() { 0.0 } else { -0.0 };
    }
    a.max(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{DropKeep, Keep};

    #[test]
    fn operand_stack_drop_keep_preserves_top() {
        let mut stack = OperandStack::new(16);
        stack.push(1_i32).unwrap();
        stack.push(2_i32).unwrap();
        stack.push(3_i32).unwrap();
        stack.drop_keep(DropKeep { drop: 2, keep: Keep::Single });
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.pop_as::<i32>(), 3);
    }

    #[test]
    fn operand_stack_overflow_traps() {
        let mut stack = OperandStack::new(1);
        assert!(stack.push(1_i32).is_ok());
        assert!(matches!(stack.push(2_i32), Err(TrapCode::StackOverflow)));
    }

    #[test]
    fn wasm_float_min_max_signed_zero_regression() {
        assert_eq!(wasm_fmin(0.0, -0.0).to_bits(), (-0.0_f32).to_bits());
        assert_eq!(wasm_fmin(-0.0, 0.0).to_bits(), (-0.0_f32).to_bits());
        assert_eq!(wasm_fmax(0.0, -0.0).to_bits(), (0.0_f32).to_bits());
        assert_eq!(wasm_fmax(-0.0, 0.0).to_bits(), (0.0_f32).to_bits());
        assert_eq!(wasm_fmin_f64(0.0, -0.0).to_bits(), (-0.0_f64).to_bits());
        assert_eq!(wasm_fmax_f64(-0.0, 0.0).to_bits(), (0.0_f64).to_bits());
        assert!(wasm_fmin(1.0, f32::NAN).is_nan());
        assert!(wasm_fmax(f32::NAN, 1.0).is_nan());
        assert_eq!(wasm_fmin(1.0, 2.0), 1.0);
        assert_eq!(wasm_fmax(1.0, 2.0), 2.0);
    }
}
