//! Virtual machine executor
//!
//! Frame-oriented stack interpreter. Each coroutine owns an
//! [`ExecutionContext`]; `resume` executes up to a step budget of
//! instructions and reports the scheduler state, `run_function` drives a
//! context to completion (honoring sleep/yield wake times) and finishes
//! with the delete-hook sweep.
//!
//! Module initialization is scheduled through the frame stack: pushing a
//! frame into a module whose `__module_init__` has not run stacks the
//! init frame on top, and operations on module objects re-dispatch after
//! pushing the init frame so globals are always observed initialized.

use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::bytecode::{pin_key, ModulePin, OpCode, Value, MODULE_INIT};
use crate::host::{HostCall, HostFunction, HostRegistry};
use crate::runtime::loader::ModuleLoader;
use crate::runtime::tasks::TaskSystem;
use crate::types::module::materialize_export;
use crate::types::{
    string, type_spec_of, DictEntry, DictKey, DictObject, Dispatch, InstanceObject, ListObject,
    ObjectData,
};

use super::context::{ExecutionContext, Frame, RunState};
use super::errors::RuntimeError;

/// Instructions executed per `resume` call inside `run_function`.
pub const DEFAULT_STEP_BUDGET: usize = 1000;

type Args = SmallVec<[Value; 8]>;

/// Interpreter bound to an entry module, a host registry and the shared
/// task system. Cheap to construct; spawned coroutines build their own.
pub struct VirtualMachine {
    module: ModulePin,
    hosts: Arc<HostRegistry>,
    tasks: Arc<TaskSystem>,
    loader: Arc<ModuleLoader>,
}

#[derive(Default)]
struct FrameOptions {
    replace_return_with_instance: bool,
    constructor_instance: Value,
    captures: Vec<Value>,
    discard_return: bool,
    module_init: bool,
    skip_init_check: bool,
}

fn current_frame(ctx: &mut ExecutionContext) -> Result<&mut Frame, RuntimeError> {
    ctx.frames.last_mut().ok_or(RuntimeError::StackUnderflow)
}

fn pop_value(ctx: &mut ExecutionContext) -> Result<Value, RuntimeError> {
    current_frame(ctx)?
        .stack
        .pop()
        .ok_or(RuntimeError::StackUnderflow)
}

fn push_value(ctx: &mut ExecutionContext, value: Value) -> Result<(), RuntimeError> {
    current_frame(ctx)?.stack.push(value);
    Ok(())
}

fn collect_args(ctx: &mut ExecutionContext, count: usize) -> Result<Args, RuntimeError> {
    let frame = current_frame(ctx)?;
    if frame.stack.len() < count {
        return Err(RuntimeError::NotEnoughArguments);
    }
    let start = frame.stack.len() - count;
    Ok(frame.stack.drain(start..).collect())
}

fn module_string(pin: &ModulePin, index: i32) -> Result<String, RuntimeError> {
    pin.strings
        .get(index.max(0) as usize)
        .filter(|_| index >= 0)
        .cloned()
        .ok_or(RuntimeError::StringIndexOutOfRange)
}

fn as_int(value: Value) -> Result<i64, RuntimeError> {
    value
        .as_int()
        .ok_or(RuntimeError::WrongTag { expected: "integer" })
}

fn normalize(
    ctx: &mut ExecutionContext,
    pin: &ModulePin,
    value: Value,
    normalize_strings: bool,
) -> Result<Value, RuntimeError> {
    ctx.dispatch().normalize_value(pin, value, normalize_strings)
}

fn value_equals(
    ctx: &ExecutionContext,
    lhs: Value,
    rhs: Value,
) -> Result<bool, RuntimeError> {
    Ok(match (lhs, rhs) {
        (Value::Nil, Value::Nil) => true,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => {
            let left = ctx
                .string_pool
                .get(a.max(0) as usize)
                .filter(|_| a >= 0)
                .ok_or(RuntimeError::StringIndexOutOfRange)?;
            let right = ctx
                .string_pool
                .get(b.max(0) as usize)
                .filter(|_| b >= 0)
                .ok_or(RuntimeError::StringIndexOutOfRange)?;
            left == right
        }
        (Value::Ref(a), Value::Ref(b)) => a == b,
        (Value::Function(a), Value::Function(b)) => a == b,
        (Value::Class(a), Value::Class(b)) => a == b,
        (Value::Module(a), Value::Module(b)) => a == b,
        _ => false,
    })
}

/// Falsy: Int 0, Nil, empty String. Object references cannot be tested.
fn is_falsy(ctx: &mut ExecutionContext, value: Value) -> Result<bool, RuntimeError> {
    match value {
        Value::Int(v) => Ok(v == 0),
        Value::Nil => Ok(true),
        Value::Str(index) => Ok(ctx
            .string_pool
            .get(index.max(0) as usize)
            .filter(|_| index >= 0)
            .ok_or(RuntimeError::StringIndexOutOfRange)?
            .is_empty()),
        other => {
            let type_name = ctx.dispatch().type_name(other);
            Err(RuntimeError::BadCondition(type_name))
        }
    }
}

fn needs_init(ctx: &ExecutionContext, pin: &ModulePin) -> bool {
    let key = pin_key(pin);
    pin.find_function(MODULE_INIT).is_some()
        && !ctx.initialized_modules.contains(&key)
        && !ctx.init_in_progress.contains(&key)
}

impl VirtualMachine {
    pub fn new(
        module: ModulePin,
        hosts: Arc<HostRegistry>,
        tasks: Arc<TaskSystem>,
        loader: Arc<ModuleLoader>,
    ) -> Self {
        Self {
            module,
            hosts,
            tasks,
            loader,
        }
    }

    /// Run a named function to completion: create the coroutine, drive it
    /// (sleeping through suspensions), then run the delete-hook sweep and
    /// hand back the return value.
    pub fn run_function(&self, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        let ctx = self.run_to_completion(name, args)?;
        Ok(ctx.return_value)
    }

    /// Like [`VirtualMachine::run_function`], but render the result to a
    /// host string before the context (and with it the string pool and
    /// heap) is dropped.
    pub fn run_function_rendered(
        &self,
        name: &str,
        args: &[Value],
    ) -> Result<String, RuntimeError> {
        let mut ctx = self.run_to_completion(name, args)?;
        let result = ctx.return_value;
        ctx.dispatch().value_str(result)
    }

    fn run_to_completion(
        &self,
        name: &str,
        args: &[Value],
    ) -> Result<ExecutionContext, RuntimeError> {
        debug!(function = name, "vm run");
        let mut ctx = self.begin_coroutine(name, args)?;
        loop {
            match self.resume(&mut ctx, DEFAULT_STEP_BUDGET)? {
                RunState::Completed => {
                    self.run_delete_hooks(&mut ctx);
                    debug!(function = name, "vm complete");
                    return Ok(ctx);
                }
                RunState::Suspended => {
                    if let Some(wake) = ctx.wake_time {
                        let now = Instant::now();
                        if wake > now {
                            std::thread::sleep(wake - now);
                        }
                    }
                }
                RunState::Running => {}
            }
        }
    }

    /// Create a coroutine positioned at the entry of `name`.
    pub fn begin_coroutine(
        &self,
        name: &str,
        args: &[Value],
    ) -> Result<ExecutionContext, RuntimeError> {
        let index = self
            .module
            .find_function(name)
            .ok_or_else(|| RuntimeError::FunctionNotFound(name.to_string()))?;
        let mut ctx = ExecutionContext::new(&self.module);
        self.push_call_frame(&mut ctx, self.module.clone(), index, args, FrameOptions::default())?;
        ctx.state = RunState::Running;
        Ok(ctx)
    }

    /// Execute up to `step_budget` instructions, then report the state.
    pub fn resume(
        &self,
        ctx: &mut ExecutionContext,
        step_budget: usize,
    ) -> Result<RunState, RuntimeError> {
        if ctx.state == RunState::Completed {
            return Ok(RunState::Completed);
        }
        if ctx.state == RunState::Suspended {
            if let Some(wake) = ctx.wake_time {
                if Instant::now() < wake {
                    return Ok(RunState::Suspended);
                }
            }
        }
        ctx.state = RunState::Running;

        for _ in 0..step_budget {
            if ctx.frames.is_empty() {
                ctx.state = RunState::Completed;
                return Ok(RunState::Completed);
            }
            if let Some(state) = self.step(ctx)? {
                return Ok(state);
            }
        }

        Ok(ctx.state)
    }

    /// Execute one instruction. `Some(state)` short-circuits the resume
    /// loop (suspension or completion).
    fn step(&self, ctx: &mut ExecutionContext) -> Result<Option<RunState>, RuntimeError> {
        let (pin, ins) = {
            let frame = ctx.frames.last().ok_or(RuntimeError::StackUnderflow)?;
            let pin = frame.module.clone();
            let function = pin
                .functions
                .get(frame.function_index)
                .ok_or(RuntimeError::FunctionIndexOutOfRange)?;
            if frame.ip >= function.code.len() {
                return Err(RuntimeError::InstructionPointerOutOfRange);
            }
            let ins = function.code[frame.ip];
            (pin, ins)
        };
        current_frame(ctx)?.ip += 1;

        match ins.op {
            OpCode::PushConst => {
                let constant = *pin
                    .constants
                    .get(ins.a.max(0) as usize)
                    .filter(|_| ins.a >= 0)
                    .ok_or(RuntimeError::ConstantIndexOutOfRange)?;
                let value = normalize(ctx, &pin, constant, true)?;
                push_value(ctx, value)?;
            }
            OpCode::LoadLocal => {
                let stored = {
                    let frame = current_frame(ctx)?;
                    *frame
                        .locals
                        .get(ins.a.max(0) as usize)
                        .filter(|_| ins.a >= 0)
                        .ok_or(RuntimeError::LocalIndexOutOfRange)?
                };
                let value = normalize(ctx, &pin, stored, false)?;
                push_value(ctx, value)?;
            }
            OpCode::StoreLocal => {
                let value = pop_value(ctx)?;
                let frame = current_frame(ctx)?;
                let slot = frame
                    .locals
                    .get_mut(ins.a.max(0) as usize)
                    .filter(|_| ins.a >= 0)
                    .ok_or(RuntimeError::LocalIndexOutOfRange)?;
                *slot = value;
            }
            OpCode::LoadName => {
                let name = module_string(&pin, ins.a)?;
                let value = self.load_name(ctx, &pin, &name)?;
                push_value(ctx, value)?;
            }
            OpCode::StoreName => {
                let name = module_string(&pin, ins.a)?;
                let value = pop_value(ctx)?;
                ctx.module_globals
                    .entry(pin_key(&pin))
                    .or_default()
                    .insert(name, value);
            }
            OpCode::Add => {
                let rhs = pop_value(ctx)?;
                let lhs = pop_value(ctx)?;
                let result = match (lhs, rhs) {
                    (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(b)),
                    _ => {
                        let mut d = ctx.dispatch();
                        let text = format!("{}{}", d.value_str(lhs)?, d.value_str(rhs)?);
                        d.make_string(text)
                    }
                };
                push_value(ctx, result)?;
            }
            OpCode::Sub => {
                let rhs = pop_value(ctx)?;
                let lhs = pop_value(ctx)?;
                push_value(ctx, Value::Int(as_int(lhs)?.wrapping_sub(as_int(rhs)?)))?;
            }
            OpCode::Mul => {
                let rhs = pop_value(ctx)?;
                let lhs = pop_value(ctx)?;
                push_value(ctx, Value::Int(as_int(lhs)?.wrapping_mul(as_int(rhs)?)))?;
            }
            OpCode::Div => {
                let rhs = pop_value(ctx)?;
                let lhs = pop_value(ctx)?;
                let divisor = as_int(rhs)?;
                if divisor == 0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                push_value(ctx, Value::Int(as_int(lhs)?.wrapping_div(divisor)))?;
            }
            OpCode::LessThan => self.compare(ctx, |a, b| a < b)?,
            OpCode::GreaterThan => self.compare(ctx, |a, b| a > b)?,
            OpCode::LessEqual => self.compare(ctx, |a, b| a <= b)?,
            OpCode::GreaterEqual => self.compare(ctx, |a, b| a >= b)?,
            OpCode::Equal => {
                let rhs = pop_value(ctx)?;
                let lhs = pop_value(ctx)?;
                let equal = value_equals(ctx, lhs, rhs)?;
                push_value(ctx, Value::Int(if equal { 1 } else { 0 }))?;
            }
            OpCode::NotEqual => {
                let rhs = pop_value(ctx)?;
                let lhs = pop_value(ctx)?;
                let equal = value_equals(ctx, lhs, rhs)?;
                push_value(ctx, Value::Int(if equal { 0 } else { 1 }))?;
            }
            OpCode::Jump => {
                if ins.a < 0 {
                    return Err(RuntimeError::InstructionPointerOutOfRange);
                }
                current_frame(ctx)?.ip = ins.a as usize;
            }
            OpCode::JumpIfFalse => {
                let condition = pop_value(ctx)?;
                if is_falsy(ctx, condition)? {
                    if ins.a < 0 {
                        return Err(RuntimeError::InstructionPointerOutOfRange);
                    }
                    current_frame(ctx)?.ip = ins.a as usize;
                }
            }
            OpCode::CallHost => {
                let args = collect_args(ctx, ins.b.max(0) as usize)?;
                let name = module_string(&pin, ins.a)?;
                let result = self.invoke_host_function(ctx, &name, &args)?;
                push_value(ctx, result)?;
            }
            OpCode::CallFunc => {
                let args = collect_args(ctx, ins.b.max(0) as usize)?;
                self.push_call_frame(
                    ctx,
                    pin.clone(),
                    ins.a.max(0) as usize,
                    &args,
                    FrameOptions::default(),
                )?;
            }
            OpCode::NewInstance => {
                let args = collect_args(ctx, ins.b.max(0) as usize)?;
                self.construct_instance(ctx, &pin, ins.a.max(0) as usize, &args)?;
            }
            OpCode::LoadAttr => {
                let name = module_string(&pin, ins.a)?;
                self.op_load_attr(ctx, &name)?;
            }
            OpCode::StoreAttr => {
                let name = module_string(&pin, ins.a)?;
                self.op_store_attr(ctx, &pin, &name)?;
            }
            OpCode::CallMethod => {
                let args = collect_args(ctx, ins.b.max(0) as usize)?;
                let name = module_string(&pin, ins.a)?;
                self.op_call_method(ctx, &name, args)?;
            }
            OpCode::CallValue => {
                let args = collect_args(ctx, ins.a.max(0) as usize)?;
                let callable = pop_value(ctx)?;
                let callable = normalize(ctx, &pin, callable, false)?;
                if let Some(result) = self.invoke_callable(ctx, callable, &args)? {
                    push_value(ctx, result)?;
                }
            }
            OpCode::SpawnFunc => {
                let args = collect_args(ctx, ins.b.max(0) as usize)?;
                let function_name = pin
                    .functions
                    .get(ins.a.max(0) as usize)
                    .filter(|_| ins.a >= 0)
                    .ok_or(RuntimeError::FunctionIndexOutOfRange)?
                    .name
                    .clone();
                let module = pin.clone();
                let hosts = self.hosts.clone();
                let tasks = self.tasks.clone();
                let loader = self.loader.clone();
                let spawn_args: Vec<Value> = args.to_vec();
                let handle = self.tasks.spawn(move || {
                    let vm = VirtualMachine::new(module, hosts, tasks, loader);
                    vm.run_function(&function_name, &spawn_args)
                });
                push_value(ctx, Value::Int(handle))?;
            }
            OpCode::Await => {
                let handle = as_int(pop_value(ctx)?)?;
                let result = self.tasks.await_handle(handle)?;
                push_value(ctx, result)?;
            }
            OpCode::MakeList => {
                let items = collect_args(ctx, ins.a.max(0) as usize)?;
                let value = ctx
                    .dispatch()
                    .alloc(ObjectData::List(ListObject::new(items.to_vec())));
                push_value(ctx, value)?;
            }
            OpCode::MakeDict => {
                let pair_count = ins.a.max(0) as usize;
                let flat = collect_args(ctx, pair_count * 2)?;
                let mut dict = DictObject::default();
                {
                    let d = ctx.dispatch();
                    for pair in flat.chunks_exact(2) {
                        let key = DictKey::from_value(&d, pair[0])?;
                        dict.entries.insert(
                            key,
                            DictEntry {
                                key: pair[0],
                                value: pair[1],
                            },
                        );
                    }
                }
                let value = ctx.dispatch().alloc(ObjectData::Dict(dict));
                push_value(ctx, value)?;
            }
            OpCode::Sleep => {
                ctx.state = RunState::Suspended;
                ctx.wake_time =
                    Some(Instant::now() + Duration::from_millis(ins.a.max(0) as u64));
                return Ok(Some(RunState::Suspended));
            }
            OpCode::Yield => {
                ctx.state = RunState::Suspended;
                ctx.wake_time = Some(Instant::now());
                return Ok(Some(RunState::Suspended));
            }
            OpCode::Return => {
                let mut frame = ctx.frames.pop().ok_or(RuntimeError::StackUnderflow)?;
                let mut result = frame.stack.pop().unwrap_or(Value::Nil);
                if frame.replace_return_with_instance {
                    result = frame.constructor_instance;
                }
                if frame.module_init {
                    let key = pin_key(&frame.module);
                    ctx.init_in_progress.remove(&key);
                    ctx.initialized_modules.insert(key);
                }
                if ctx.frames.is_empty() {
                    if !frame.discard_return {
                        ctx.return_value = result;
                    }
                    ctx.state = RunState::Completed;
                    return Ok(Some(RunState::Completed));
                }
                if !frame.discard_return {
                    push_value(ctx, result)?;
                }
            }
            OpCode::Pop => {
                pop_value(ctx)?;
            }
        }

        Ok(None)
    }

    fn compare(
        &self,
        ctx: &mut ExecutionContext,
        op: fn(i64, i64) -> bool,
    ) -> Result<(), RuntimeError> {
        let rhs = pop_value(ctx)?;
        let lhs = pop_value(ctx)?;
        let result = op(as_int(lhs)?, as_int(rhs)?);
        push_value(ctx, Value::Int(if result { 1 } else { 0 }))
    }

    // ---- frames ---------------------------------------------------------

    fn push_call_frame(
        &self,
        ctx: &mut ExecutionContext,
        pin: ModulePin,
        function_index: usize,
        args: &[Value],
        options: FrameOptions,
    ) -> Result<(), RuntimeError> {
        let function = pin
            .functions
            .get(function_index)
            .ok_or(RuntimeError::FunctionIndexOutOfRange)?;
        if args.len() != function.params.len() {
            return Err(RuntimeError::FunctionArityMismatch(function.name.clone()));
        }

        let mut locals = vec![Value::Nil; function.local_count.max(args.len())];
        locals[..args.len()].copy_from_slice(args);

        let is_init_target = function.name == MODULE_INIT;
        let stack_capacity = function.stack_slot_count;
        ctx.frames.push(Frame {
            function_index,
            ip: 0,
            module: pin.clone(),
            locals,
            captures: options.captures,
            stack: Vec::with_capacity(stack_capacity),
            replace_return_with_instance: options.replace_return_with_instance,
            constructor_instance: options.constructor_instance,
            discard_return: options.discard_return,
            module_init: options.module_init,
        });

        if !options.skip_init_check && !is_init_target && needs_init(ctx, &pin) {
            self.push_module_init_frame(ctx, &pin)?;
        }
        Ok(())
    }

    /// Stack the module's `__module_init__` above the current frame; it
    /// runs first and its return value is discarded.
    fn push_module_init_frame(
        &self,
        ctx: &mut ExecutionContext,
        pin: &ModulePin,
    ) -> Result<(), RuntimeError> {
        let index = pin
            .find_function(MODULE_INIT)
            .ok_or_else(|| RuntimeError::FunctionNotFound(MODULE_INIT.to_string()))?;
        ctx.init_in_progress.insert(pin_key(pin));
        self.push_call_frame(
            ctx,
            pin.clone(),
            index,
            &[],
            FrameOptions {
                discard_return: true,
                module_init: true,
                skip_init_check: true,
                ..Default::default()
            },
        )
    }

    // ---- names ----------------------------------------------------------

    /// `LoadName`: module runtime globals, then the module's compiled
    /// global bindings, then the module's own functions and classes as
    /// first-class values, then the host registry.
    fn load_name(
        &self,
        ctx: &mut ExecutionContext,
        pin: &ModulePin,
        name: &str,
    ) -> Result<Value, RuntimeError> {
        if let Some(value) = ctx
            .module_globals
            .get(&pin_key(pin))
            .and_then(|globals| globals.get(name))
        {
            return Ok(*value);
        }

        if let Some(global) = pin.find_global(name) {
            let value = normalize(ctx, pin, global.initial_value, true)?;
            ctx.module_globals
                .entry(pin_key(pin))
                .or_default()
                .insert(name.to_string(), value);
            return Ok(value);
        }

        if let Some(index) = pin.find_function(name) {
            return normalize(ctx, pin, Value::Function(index as i64), false);
        }
        if let Some(index) = pin.find_class(name) {
            return normalize(ctx, pin, Value::Class(index as i64), false);
        }

        let mut d = ctx.dispatch();
        if let Some(value) = self.hosts.resolve(name, &mut d) {
            return Ok(value);
        }

        Err(RuntimeError::UnknownName(name.to_string()))
    }

    // ---- attribute access ------------------------------------------------

    fn op_load_attr(&self, ctx: &mut ExecutionContext, name: &str) -> Result<(), RuntimeError> {
        let receiver = pop_value(ctx)?;

        if receiver.as_str_index().is_some() {
            let value = string::get_member(&mut ctx.dispatch(), receiver, name)?;
            return push_value(ctx, value);
        }

        let id = receiver.as_ref_id().ok_or(RuntimeError::NotAnObject)?;
        enum Kind {
            Instance(ModulePin),
            Module,
            Other,
        }
        let kind = match &ctx.dispatch().object(id)?.data {
            ObjectData::Instance(instance) => Kind::Instance(instance.module.clone()),
            ObjectData::Module(_) => Kind::Module,
            _ => Kind::Other,
        };

        match kind {
            Kind::Instance(instance_pin) => {
                let stored = {
                    let d = ctx.dispatch();
                    let ObjectData::Instance(instance) = &d.object(id)?.data else {
                        return Err(RuntimeError::NotAnObject);
                    };
                    *instance
                        .fields
                        .get(name)
                        .ok_or_else(|| RuntimeError::UnknownAttribute(name.to_string()))?
                };
                let value = normalize(ctx, &instance_pin, stored, false)?;
                if let ObjectData::Instance(instance) = &mut ctx.dispatch().object_mut(id)?.data {
                    instance.fields.insert(name.to_string(), value);
                }
                push_value(ctx, value)
            }
            Kind::Module => {
                match self.module_member(ctx, id, name)? {
                    ModuleAccess::Value(value) => push_value(ctx, value),
                    ModuleAccess::NeedsInit(module_pin) => {
                        // Re-dispatch after init: restore the operand and
                        // rewind onto this instruction.
                        let frame = current_frame(ctx)?;
                        frame.stack.push(receiver);
                        frame.ip -= 1;
                        self.push_module_init_frame(ctx, &module_pin)
                    }
                }
            }
            Kind::Other => {
                let mut d = ctx.dispatch();
                let spec = type_spec_of(&d.object(id)?.data);
                let value = spec.get_member(&mut d, id, name)?;
                push_value(ctx, value)
            }
        }
    }

    fn op_store_attr(
        &self,
        ctx: &mut ExecutionContext,
        pin: &ModulePin,
        name: &str,
    ) -> Result<(), RuntimeError> {
        let assigned = pop_value(ctx)?;
        let receiver = pop_value(ctx)?;
        let value = normalize(ctx, pin, assigned, false)?;

        if receiver.as_str_index().is_some() {
            return Err(string::set_member(&mut ctx.dispatch(), receiver, name));
        }

        let id = receiver.as_ref_id().ok_or(RuntimeError::NotAnObject)?;
        enum Kind {
            Instance,
            Module,
            Other,
        }
        let kind = match &ctx.dispatch().object(id)?.data {
            ObjectData::Instance(_) => Kind::Instance,
            ObjectData::Module(_) => Kind::Module,
            _ => Kind::Other,
        };
        match kind {
            Kind::Instance => {
                if let ObjectData::Instance(instance) = &mut ctx.dispatch().object_mut(id)?.data {
                    instance.fields.insert(name.to_string(), value);
                }
            }
            Kind::Module => {
                if let ObjectData::Module(module) = &mut ctx.dispatch().object_mut(id)?.data {
                    module.exports.insert(name.to_string(), value);
                }
            }
            Kind::Other => {
                let mut d = ctx.dispatch();
                let spec = type_spec_of(&d.object(id)?.data);
                spec.set_member(&mut d, id, name, value)?;
            }
        }
        push_value(ctx, value)
    }

    // ---- module member resolution -----------------------------------------

    fn module_member(
        &self,
        ctx: &mut ExecutionContext,
        module_id: u64,
        name: &str,
    ) -> Result<ModuleAccess, RuntimeError> {
        let (module_pin, module_name, cached) = {
            let d = ctx.dispatch();
            let ObjectData::Module(module) = &d.object(module_id)?.data else {
                return Err(RuntimeError::NotAnObject);
            };
            (
                module.module.clone(),
                module.name.clone(),
                module.exports.get(name).copied(),
            )
        };

        if let Some(value) = cached {
            return Ok(ModuleAccess::Value(value));
        }

        let Some(module_pin) = module_pin else {
            return Err(RuntimeError::UnknownMember {
                type_name: "Module".to_string(),
                member: name.to_string(),
            });
        };

        if needs_init(ctx, &module_pin) {
            return Ok(ModuleAccess::NeedsInit(module_pin));
        }
        if ctx.init_in_progress.contains(&pin_key(&module_pin)) {
            return Err(RuntimeError::ModuleInitCycle(module_name));
        }

        // Runtime globals first — init has run, so the live value wins
        // over the compiled initial.
        if let Some(value) = ctx
            .module_globals
            .get(&pin_key(&module_pin))
            .and_then(|globals| globals.get(name))
            .copied()
        {
            if let ObjectData::Module(module) = &mut ctx.dispatch().object_mut(module_id)?.data {
                module.exports.insert(name.to_string(), value);
            }
            return Ok(ModuleAccess::Value(value));
        }

        let materialized = {
            let mut d = ctx.dispatch();
            materialize_export(&mut d, &module_pin, name)?
        };
        let Some(value) = materialized else {
            return Err(RuntimeError::UnknownMember {
                type_name: "Module".to_string(),
                member: name.to_string(),
            });
        };
        let value = normalize(ctx, &module_pin, value, true)?;
        if let ObjectData::Module(module) = &mut ctx.dispatch().object_mut(module_id)?.data {
            module.exports.insert(name.to_string(), value);
        }
        Ok(ModuleAccess::Value(value))
    }

    // ---- calls ------------------------------------------------------------

    fn op_call_method(
        &self,
        ctx: &mut ExecutionContext,
        name: &str,
        args: Args,
    ) -> Result<(), RuntimeError> {
        let receiver = pop_value(ctx)?;

        if receiver.as_str_index().is_some() {
            let value = string::call_method(&mut ctx.dispatch(), receiver, name, &args)?;
            return push_value(ctx, value);
        }

        let id = receiver.as_ref_id().ok_or(RuntimeError::NotAnObject)?;
        enum Kind {
            Module,
            Instance(ModulePin, usize),
            Other,
        }
        let kind = match &ctx.dispatch().object(id)?.data {
            ObjectData::Module(_) => Kind::Module,
            ObjectData::Instance(instance) => {
                Kind::Instance(instance.module.clone(), instance.class_index)
            }
            _ => Kind::Other,
        };

        match kind {
            Kind::Module => {
                match self.module_method(ctx, id, name, &args)? {
                    None => Ok(()),
                    Some(ModuleAccess::Value(result)) => push_value(ctx, result),
                    Some(ModuleAccess::NeedsInit(module_pin)) => {
                        let frame = current_frame(ctx)?;
                        frame.stack.push(receiver);
                        frame.stack.extend(args.iter().copied());
                        frame.ip -= 1;
                        self.push_module_init_frame(ctx, &module_pin)
                    }
                }
            }
            Kind::Instance(instance_pin, class_index) => {
                let field = {
                    let d = ctx.dispatch();
                    let ObjectData::Instance(instance) = &d.object(id)?.data else {
                        return Err(RuntimeError::NotAnObject);
                    };
                    instance.fields.get(name).copied()
                };

                if let Some(stored) = field {
                    let callable = normalize(ctx, &instance_pin, stored, false)?;
                    if let ObjectData::Instance(instance) =
                        &mut ctx.dispatch().object_mut(id)?.data
                    {
                        instance.fields.insert(name.to_string(), callable);
                    }
                    if let Some(result) = self.invoke_callable(ctx, callable, &args)? {
                        push_value(ctx, result)?;
                    }
                    return Ok(());
                }

                if let Some(method_index) = instance_pin.find_class_method(class_index, name) {
                    let mut method_args: Args = SmallVec::with_capacity(args.len() + 1);
                    method_args.push(receiver);
                    method_args.extend(args.iter().copied());
                    return self.push_call_frame(
                        ctx,
                        instance_pin,
                        method_index,
                        &method_args,
                        FrameOptions::default(),
                    );
                }

                let mut d = ctx.dispatch();
                let spec = type_spec_of(&d.object(id)?.data);
                let result = spec.call_method(&mut d, id, name, &args)?;
                push_value(ctx, result)
            }
            Kind::Other => {
                let result = {
                    let mut d = ctx.dispatch();
                    let spec = type_spec_of(&d.object(id)?.data);
                    spec.call_method(&mut d, id, name, &args)?
                };
                push_value(ctx, result)
            }
        }
    }

    /// Method dispatch on a module object: exports, then the module's
    /// functions, classes and globals. `Ok(None)` means a frame was
    /// pushed and the result arrives through `Return`.
    fn module_method(
        &self,
        ctx: &mut ExecutionContext,
        module_id: u64,
        name: &str,
        args: &[Value],
    ) -> Result<Option<ModuleAccess>, RuntimeError> {
        let (module_pin, module_name, cached) = {
            let d = ctx.dispatch();
            let ObjectData::Module(module) = &d.object(module_id)?.data else {
                return Err(RuntimeError::NotAnObject);
            };
            (
                module.module.clone(),
                module.name.clone(),
                module.exports.get(name).copied(),
            )
        };

        // Host-backed modules resolve through their export table only.
        let Some(module_pin) = module_pin else {
            let Some(callable) = cached else {
                return Err(RuntimeError::FunctionNotFound(format!(
                    "{}.{}",
                    module_name, name
                )));
            };
            return match self.invoke_callable(ctx, callable, args)? {
                Some(result) => Ok(Some(ModuleAccess::Value(result))),
                None => Ok(None),
            };
        };

        if needs_init(ctx, &module_pin) {
            return Ok(Some(ModuleAccess::NeedsInit(module_pin)));
        }
        if ctx.init_in_progress.contains(&pin_key(&module_pin)) {
            return Err(RuntimeError::ModuleInitCycle(module_name));
        }

        if let Some(callable) = cached {
            return match self.invoke_callable(ctx, callable, args)? {
                Some(result) => Ok(Some(ModuleAccess::Value(result))),
                None => Ok(None),
            };
        }

        if let Some(function_index) = module_pin.find_function(name) {
            self.push_call_frame(
                ctx,
                module_pin,
                function_index,
                args,
                FrameOptions::default(),
            )?;
            return Ok(None);
        }

        if let Some(class_index) = module_pin.find_class(name) {
            self.construct_instance(ctx, &module_pin, class_index, args)?;
            return Ok(None);
        }

        if let Some(global) = ctx
            .module_globals
            .get(&pin_key(&module_pin))
            .and_then(|globals| globals.get(name))
            .copied()
        {
            return match self.invoke_callable(ctx, global, args)? {
                Some(result) => Ok(Some(ModuleAccess::Value(result))),
                None => Ok(None),
            };
        }

        Err(RuntimeError::FunctionNotFound(name.to_string()))
    }

    /// Call a first-class value. Function/Lambda/Class push frames
    /// (`Ok(None)`); native functions return their value directly.
    fn invoke_callable(
        &self,
        ctx: &mut ExecutionContext,
        callable: Value,
        args: &[Value],
    ) -> Result<Option<Value>, RuntimeError> {
        let Some(id) = callable.as_ref_id() else {
            let type_name = ctx.dispatch().type_name(callable);
            return Err(RuntimeError::NotCallable(type_name));
        };

        enum Target {
            Function(ModulePin, usize),
            Lambda(ModulePin, usize, Vec<Value>),
            Class(ModulePin, usize),
            Native(HostFunction),
        }
        let target = {
            let d = ctx.dispatch();
            match &d.object(id)?.data {
                ObjectData::Function(function) => {
                    Target::Function(function.module.clone(), function.function_index)
                }
                ObjectData::Lambda(lambda) => Target::Lambda(
                    lambda.module.clone(),
                    lambda.function_index,
                    lambda.captures.clone(),
                ),
                ObjectData::Class(class) => {
                    Target::Class(class.module.clone(), class.class_index)
                }
                ObjectData::Native(native) => Target::Native(native.callback.clone()),
                other => {
                    let type_name = type_spec_of(other).name.to_string();
                    return Err(RuntimeError::NotCallable(type_name));
                }
            }
        };

        match target {
            Target::Function(module, function_index) => {
                self.push_call_frame(ctx, module, function_index, args, FrameOptions::default())?;
                Ok(None)
            }
            Target::Lambda(module, function_index, captures) => {
                self.push_call_frame(
                    ctx,
                    module,
                    function_index,
                    args,
                    FrameOptions {
                        captures,
                        ..Default::default()
                    },
                )?;
                Ok(None)
            }
            Target::Class(module, class_index) => {
                self.construct_instance(ctx, &module, class_index, args)?;
                Ok(None)
            }
            Target::Native(callback) => {
                let mut call = self.host_call(ctx);
                Ok(Some(callback(&mut call, args)?))
            }
        }
    }

    // ---- construction -----------------------------------------------------

    /// Constructor protocol: allocate the instance, seed its fields by a
    /// base-first walk of attribute defaults, then push the `__new__`
    /// frame with the instance prepended. Its return value is replaced by
    /// the instance.
    fn construct_instance(
        &self,
        ctx: &mut ExecutionContext,
        pin: &ModulePin,
        class_index: usize,
        args: &[Value],
    ) -> Result<(), RuntimeError> {
        let instance = self.make_script_instance(ctx, pin, class_index)?;

        let class_name = pin
            .classes
            .get(class_index)
            .ok_or(RuntimeError::ClassIndexOutOfRange)?
            .name
            .clone();
        let ctor_index = pin
            .find_class_method(class_index, "__new__")
            .ok_or(RuntimeError::MissingConstructor(class_name))?;

        let mut ctor_args: Args = SmallVec::with_capacity(args.len() + 1);
        ctor_args.push(instance);
        ctor_args.extend(args.iter().copied());
        self.push_call_frame(
            ctx,
            pin.clone(),
            ctor_index,
            &ctor_args,
            FrameOptions {
                replace_return_with_instance: true,
                constructor_instance: instance,
                ..Default::default()
            },
        )
    }

    fn make_script_instance(
        &self,
        ctx: &mut ExecutionContext,
        pin: &ModulePin,
        class_index: usize,
    ) -> Result<Value, RuntimeError> {
        let class = pin
            .classes
            .get(class_index)
            .ok_or(RuntimeError::ClassIndexOutOfRange)?;

        // Base-first chain so derived defaults override base defaults.
        let mut chain = Vec::new();
        let mut cursor = class_index as i32;
        while cursor >= 0 {
            let current = pin
                .classes
                .get(cursor as usize)
                .ok_or(RuntimeError::ClassIndexOutOfRange)?;
            chain.push(cursor as usize);
            cursor = current.base_class_index;
        }
        chain.reverse();

        let instance = ctx.dispatch().alloc(ObjectData::Instance(InstanceObject {
            class_index,
            class_name: class.name.clone(),
            module: pin.clone(),
            fields: Default::default(),
        }));
        let instance_id = instance.as_ref_id().ok_or(RuntimeError::ObjectNotFound)?;

        for link in chain {
            let defaults: Vec<(String, Value)> = pin.classes[link]
                .attributes
                .iter()
                .map(|attr| (attr.name.clone(), attr.default_value))
                .collect();
            for (attr_name, default_value) in defaults {
                let value = normalize(ctx, pin, default_value, true)?;
                if let ObjectData::Instance(instance) =
                    &mut ctx.dispatch().object_mut(instance_id)?.data
                {
                    instance.fields.insert(attr_name, value);
                }
            }
        }

        Ok(instance)
    }

    // ---- host plumbing ----------------------------------------------------

    fn host_call<'a>(&'a self, ctx: &'a mut ExecutionContext) -> HostCall<'a> {
        let ExecutionContext {
            heap,
            string_pool,
            visiting,
            module_cache,
            ..
        } = ctx;
        HostCall {
            d: Dispatch {
                heap,
                strings: string_pool,
                visiting,
            },
            loader: &self.loader,
            module_cache,
        }
    }

    fn invoke_host_function(
        &self,
        ctx: &mut ExecutionContext,
        name: &str,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let mut call = self.host_call(ctx);
        self.hosts.invoke(name, &mut call, args)
    }

    // ---- delete hooks -----------------------------------------------------

    /// Final sweep over the heap: every script instance whose class chain
    /// defines `__delete__` gets its hook invoked as a fresh top-level
    /// call in this context. A failing hook is logged and skipped; the
    /// sweep runs at most once per context.
    pub fn run_delete_hooks(&self, ctx: &mut ExecutionContext) {
        if ctx.delete_hooks_ran {
            return;
        }
        ctx.delete_hooks_ran = true;

        struct Hook {
            object: Value,
            function_index: usize,
            module: ModulePin,
        }
        let mut hooks = Vec::new();
        for (id, object) in &ctx.heap {
            let ObjectData::Instance(instance) = &object.data else {
                continue;
            };
            if let Some(function_index) = instance
                .module
                .find_class_method(instance.class_index, "__delete__")
            {
                hooks.push(Hook {
                    object: Value::Ref(*id),
                    function_index,
                    module: instance.module.clone(),
                });
            }
        }
        if hooks.is_empty() {
            return;
        }
        debug!(count = hooks.len(), "running delete hooks");

        for hook in hooks {
            ctx.state = RunState::Running;
            ctx.frames.clear();
            let pushed = self.push_call_frame(
                ctx,
                hook.module,
                hook.function_index,
                &[hook.object],
                FrameOptions {
                    discard_return: true,
                    skip_init_check: true,
                    ..Default::default()
                },
            );
            if let Err(error) = pushed {
                warn!(%error, "delete hook could not start");
                continue;
            }

            loop {
                match self.resume(ctx, DEFAULT_STEP_BUDGET) {
                    Ok(RunState::Completed) => break,
                    Ok(RunState::Suspended) => {
                        if let Some(wake) = ctx.wake_time {
                            let now = Instant::now();
                            if wake > now {
                                std::thread::sleep(wake - now);
                            }
                        }
                    }
                    Ok(RunState::Running) => {}
                    Err(error) => {
                        warn!(%error, "delete hook failed");
                        ctx.frames.clear();
                        break;
                    }
                }
            }
        }
    }
}

enum ModuleAccess {
    Value(Value),
    NeedsInit(ModulePin),
}
