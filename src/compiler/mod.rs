//! Compiler: Program → CompiledModule
//!
//! Three passes over the parsed program:
//!
//! 1. Index classes and functions by name; duplicates are errors. Collect
//!    module globals from top-level `let` statements, constant-folding
//!    their initializers where the restricted evaluator allows.
//! 2. Pre-declare every method as a mangled `Class::method` function,
//!    resolve base-class indices and evaluate class attribute defaults.
//!    Every class must define `__new__` with a leading self parameter.
//! 3. Compile each function body, each method body and the synthetic
//!    `__module_init__` that executes top-level statements.
//!
//! Per body, locals are collected up front (duplicate declarations and
//! use-before-declare are errors; branch-local declarations join the
//! single flat scope of the enclosing body), expressions emit in stack
//! order, and loops patch their break/continue jumps through a
//! [`LoopContext`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::bytecode::{
    estimate_stack_slots, ClassAttribute, ClassBytecode, ClassMethod, CompiledModule,
    FunctionBytecode, GlobalBinding, Instruction, OpCode, Value, MODULE_INIT,
};
use crate::error::ScriptError;
use crate::frontend::imports::{preprocess_file, preprocess_source, ImportCache};
use crate::frontend::lexer::tokens::Pos;
use crate::frontend::lexer::tokenize;
use crate::frontend::parser::ast::{BinaryOp, Expr, LetInit, Program, Stmt};
use crate::frontend::parser::parse_program;

/// Compiler error
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    #[error("{pos}: error: Duplicate class name: {name} [function: <module>]")]
    DuplicateClass { name: String, pos: Pos },
    #[error("{pos}: error: Duplicate function name: {name} [function: <module>]")]
    DuplicateFunction { name: String, pos: Pos },
    #[error("{pos}: error: Duplicate method: {name} [function: {name}]")]
    DuplicateMethod { name: String, pos: Pos },
    #[error("{pos}: error: Duplicate top-level symbol name: {name} [function: <module>]")]
    DuplicateTopLevelSymbol { name: String, pos: Pos },
    #[error("{pos}: error: Duplicate let declaration in scope: {name} [function: {scope}]")]
    DuplicateLet { name: String, scope: String, pos: Pos },
    #[error("error: Duplicate parameter in scope: {name} [function: {scope}]")]
    DuplicateParameter { name: String, scope: String },
    #[error("{pos}: error: Local variable used before declaration: {name} [function: {scope}]")]
    UseBeforeDeclare { name: String, scope: String, pos: Pos },
    #[error("{pos}: error: Unknown base class: {name} [function: <module>]")]
    UnknownBaseClass { name: String, pos: Pos },
    #[error("{pos}: error: Class must define constructor __new__: {class} [function: {class}]")]
    MissingConstructor { class: String, pos: Pos },
    #[error("{pos}: error: Class constructor __new__ must declare self parameter: {class} [function: {class}::__new__]")]
    ConstructorWithoutSelf { class: String, pos: Pos },
    #[error("{pos}: error: Class field initializer must be number/string/symbol name [function: {scope}]")]
    InvalidFieldInitializer { scope: String, pos: Pos },
    #[error("{pos}: error: 'break' used outside of loop [function: {scope}]")]
    BreakOutsideLoop { scope: String, pos: Pos },
    #[error("{pos}: error: 'continue' used outside of loop [function: {scope}]")]
    ContinueOutsideLoop { scope: String, pos: Pos },
    #[error("{pos}: error: '{what}' is temporarily disabled. Coroutine features are not enabled. [function: {scope}]")]
    CoroutineDisabled {
        what: &'static str,
        scope: String,
        pos: Pos,
    },
    /// An already-rendered diagnostic, used after scope inference has
    /// rewritten the `[function: …]` tag of a file-level compile.
    #[error("{message}")]
    Rendered { message: String },
}

type CompileResult<T> = Result<T, CompileError>;

fn mangle_method_name(class_name: &str, method_name: &str) -> String {
    format!("{}::{}", class_name, method_name)
}

// ---- module construction helpers ---------------------------------------

fn add_constant(module: &mut CompiledModule, value: Value) -> i32 {
    module.constants.push(value);
    (module.constants.len() - 1) as i32
}

fn add_string(module: &mut CompiledModule, value: &str) -> i32 {
    if let Some(index) = module.strings.iter().position(|s| s == value) {
        return index as i32;
    }
    module.strings.push(value.to_string());
    (module.strings.len() - 1) as i32
}

fn emit(code: &mut Vec<Instruction>, op: OpCode, a: i32, b: i32) {
    code.push(Instruction::new(op, a, b));
}

fn emit_jump(code: &mut Vec<Instruction>, op: OpCode) -> usize {
    code.push(Instruction::new(op, -1, 0));
    code.len() - 1
}

fn patch_jump(code: &mut [Instruction], jump_index: usize, target: usize) {
    code[jump_index].a = target as i32;
}

/// Jump bookkeeping for one loop nesting level.
#[derive(Default)]
struct LoopContext {
    break_jumps: Vec<usize>,
    continue_jumps: Vec<usize>,
    continue_target: usize,
}

// ---- restricted constant evaluator --------------------------------------

fn resolve_named_value(
    module: &CompiledModule,
    func_index: &HashMap<String, usize>,
    class_index: &HashMap<String, usize>,
    name: &str,
) -> Option<Value> {
    if let Some(global) = module.find_global(name) {
        return Some(global.initial_value);
    }
    if let Some(&index) = func_index.get(name) {
        return Some(Value::Function(index as i64));
    }
    if let Some(&index) = class_index.get(name) {
        return Some(Value::Class(index as i64));
    }
    None
}

/// Literal number, literal string, or a symbolic reference to a known
/// function/class/global. Everything else is rejected.
fn eval_const_init(
    expr: &Expr,
    module: &mut CompiledModule,
    func_index: &HashMap<String, usize>,
    class_index: &HashMap<String, usize>,
) -> Option<Value> {
    match expr {
        Expr::Number { value, .. } => Some(Value::Int(*value)),
        Expr::StringLit { value, .. } => {
            let index = add_string(module, value);
            Some(Value::Str(index as i64))
        }
        Expr::Variable { name, .. } => resolve_named_value(module, func_index, class_index, name),
        _ => None,
    }
}

// ---- scope analysis -----------------------------------------------------

fn collect_local_declarations(
    statements: &[Stmt],
    local_names: &mut HashSet<String>,
    scope: &str,
) -> CompileResult<()> {
    for stmt in statements {
        if let Stmt::Let { name, pos, .. } = stmt {
            if !local_names.insert(name.clone()) {
                return Err(CompileError::DuplicateLet {
                    name: name.clone(),
                    scope: scope.to_string(),
                    pos: *pos,
                });
            }
        }
        match stmt {
            Stmt::ForRange { body, .. }
            | Stmt::ForList { body, .. }
            | Stmt::ForDict { body, .. }
            | Stmt::While { body, .. } => {
                collect_local_declarations(body, local_names, scope)?;
            }
            Stmt::If {
                branches,
                else_body,
                ..
            } => {
                for (_, body) in branches {
                    collect_local_declarations(body, local_names, scope)?;
                }
                collect_local_declarations(else_body, local_names, scope)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_expr_usage(
    expr: &Expr,
    local_names: &HashSet<String>,
    declared: &HashSet<String>,
    scope: &str,
) -> CompileResult<()> {
    match expr {
        Expr::Variable { name, pos } => {
            if local_names.contains(name) && !declared.contains(name) {
                return Err(CompileError::UseBeforeDeclare {
                    name: name.clone(),
                    scope: scope.to_string(),
                    pos: *pos,
                });
            }
        }
        Expr::AssignVariable { name, value, pos } => {
            if local_names.contains(name) && !declared.contains(name) {
                return Err(CompileError::UseBeforeDeclare {
                    name: name.clone(),
                    scope: scope.to_string(),
                    pos: *pos,
                });
            }
            validate_expr_usage(value, local_names, declared, scope)?;
        }
        Expr::AssignProperty { object, value, .. } => {
            validate_expr_usage(object, local_names, declared, scope)?;
            validate_expr_usage(value, local_names, declared, scope)?;
        }
        Expr::AssignIndex {
            object,
            index,
            value,
            ..
        } => {
            validate_expr_usage(object, local_names, declared, scope)?;
            validate_expr_usage(index, local_names, declared, scope)?;
            validate_expr_usage(value, local_names, declared, scope)?;
        }
        Expr::Binary { left, right, .. } => {
            validate_expr_usage(left, local_names, declared, scope)?;
            validate_expr_usage(right, local_names, declared, scope)?;
        }
        Expr::Call { callee, args, .. } => {
            validate_expr_usage(callee, local_names, declared, scope)?;
            for arg in args {
                validate_expr_usage(arg, local_names, declared, scope)?;
            }
        }
        Expr::MethodCall { object, args, .. } => {
            validate_expr_usage(object, local_names, declared, scope)?;
            for arg in args {
                validate_expr_usage(arg, local_names, declared, scope)?;
            }
        }
        Expr::Property { object, .. } => {
            validate_expr_usage(object, local_names, declared, scope)?;
        }
        Expr::Index { object, index, .. } => {
            validate_expr_usage(object, local_names, declared, scope)?;
            validate_expr_usage(index, local_names, declared, scope)?;
        }
        Expr::ListLit { elements, .. } => {
            for element in elements {
                validate_expr_usage(element, local_names, declared, scope)?;
            }
        }
        Expr::DictLit { entries, .. } => {
            for (key, value) in entries {
                validate_expr_usage(key, local_names, declared, scope)?;
                validate_expr_usage(value, local_names, declared, scope)?;
            }
        }
        Expr::Number { .. } | Expr::StringLit { .. } => {}
    }
    Ok(())
}

fn validate_stmt_usage(
    statements: &[Stmt],
    local_names: &HashSet<String>,
    declared: &mut HashSet<String>,
    scope: &str,
) -> CompileResult<()> {
    for stmt in statements {
        match stmt {
            Stmt::Let { name, init, pos } => {
                declared.insert(name.clone());
                match init {
                    LetInit::Expr(expr) => {
                        validate_expr_usage(expr, local_names, declared, scope)?;
                    }
                    LetInit::Spawn { args, .. } => {
                        for arg in args {
                            validate_expr_usage(arg, local_names, declared, scope)?;
                        }
                    }
                    LetInit::Await { handle } => {
                        if local_names.contains(handle) && !declared.contains(handle) {
                            return Err(CompileError::UseBeforeDeclare {
                                name: handle.clone(),
                                scope: scope.to_string(),
                                pos: *pos,
                            });
                        }
                    }
                }
            }
            Stmt::ForRange {
                var,
                start,
                end,
                body,
                ..
            } => {
                validate_expr_usage(start, local_names, declared, scope)?;
                validate_expr_usage(end, local_names, declared, scope)?;
                declared.insert(var.clone());
                validate_stmt_usage(body, local_names, declared, scope)?;
            }
            Stmt::ForList {
                var,
                iterable,
                body,
                ..
            } => {
                validate_expr_usage(iterable, local_names, declared, scope)?;
                declared.insert(var.clone());
                validate_stmt_usage(body, local_names, declared, scope)?;
            }
            Stmt::ForDict {
                key,
                value,
                iterable,
                body,
                ..
            } => {
                validate_expr_usage(iterable, local_names, declared, scope)?;
                declared.insert(key.clone());
                declared.insert(value.clone());
                validate_stmt_usage(body, local_names, declared, scope)?;
            }
            Stmt::If {
                branches,
                else_body,
                ..
            } => {
                for (condition, body) in branches {
                    validate_expr_usage(condition, local_names, declared, scope)?;
                    validate_stmt_usage(body, local_names, declared, scope)?;
                }
                validate_stmt_usage(else_body, local_names, declared, scope)?;
            }
            Stmt::While {
                condition, body, ..
            } => {
                validate_expr_usage(condition, local_names, declared, scope)?;
                validate_stmt_usage(body, local_names, declared, scope)?;
            }
            Stmt::Expr { expr, .. } | Stmt::Return { expr, .. } => {
                validate_expr_usage(expr, local_names, declared, scope)?;
            }
            Stmt::Break { .. } | Stmt::Continue { .. } | Stmt::Sleep { .. } | Stmt::Yield { .. } => {
            }
        }
    }
    Ok(())
}

fn validate_scope_local_rules(
    statements: &[Stmt],
    predeclared: &[String],
    scope: &str,
) -> CompileResult<()> {
    let mut local_names = HashSet::new();
    let mut declared = HashSet::new();
    for name in predeclared {
        if !local_names.insert(name.clone()) {
            return Err(CompileError::DuplicateParameter {
                name: name.clone(),
                scope: scope.to_string(),
            });
        }
        declared.insert(name.clone());
    }
    collect_local_declarations(statements, &mut local_names, scope)?;
    validate_stmt_usage(statements, &local_names, &mut declared, scope)
}

// ---- body compilation ---------------------------------------------------

struct BodyCompiler<'a> {
    module: &'a mut CompiledModule,
    locals: HashMap<String, usize>,
    func_index: &'a HashMap<String, usize>,
    class_index: &'a HashMap<String, usize>,
    module_globals: &'a HashSet<String>,
    scope: String,
    is_module_init: bool,
}

impl<'a> BodyCompiler<'a> {
    fn ensure_local(&mut self, out: &mut FunctionBytecode, name: &str) -> usize {
        if let Some(&slot) = self.locals.get(name) {
            return slot;
        }
        let slot = out.local_count;
        self.locals.insert(name.to_string(), slot);
        out.local_count += 1;
        slot
    }

    fn compile_expr(&mut self, expr: &Expr, code: &mut Vec<Instruction>) -> CompileResult<()> {
        match expr {
            Expr::Number { value, .. } => {
                let index = add_constant(self.module, Value::Int(*value));
                emit(code, OpCode::PushConst, index, 0);
            }
            Expr::StringLit { value, .. } => {
                let string_index = add_string(self.module, value);
                let index = add_constant(self.module, Value::Str(string_index as i64));
                emit(code, OpCode::PushConst, index, 0);
            }
            Expr::Variable { name, .. } => {
                if let Some(&slot) = self.locals.get(name) {
                    emit(code, OpCode::LoadLocal, slot as i32, 0);
                } else {
                    let name_index = add_string(self.module, name);
                    emit(code, OpCode::LoadName, name_index, 0);
                }
            }
            Expr::AssignVariable { name, value, .. } => {
                self.compile_expr(value, code)?;
                if let Some(&slot) = self.locals.get(name) {
                    emit(code, OpCode::StoreLocal, slot as i32, 0);
                    emit(code, OpCode::LoadLocal, slot as i32, 0);
                } else {
                    let name_index = add_string(self.module, name);
                    emit(code, OpCode::StoreName, name_index, 0);
                    emit(code, OpCode::LoadName, name_index, 0);
                }
            }
            Expr::AssignProperty {
                object,
                name,
                value,
                ..
            } => {
                self.compile_expr(object, code)?;
                self.compile_expr(value, code)?;
                let name_index = add_string(self.module, name);
                emit(code, OpCode::StoreAttr, name_index, 0);
            }
            Expr::AssignIndex {
                object,
                index,
                value,
                ..
            } => {
                self.compile_expr(object, code)?;
                self.compile_expr(index, code)?;
                self.compile_expr(value, code)?;
                let set_index = add_string(self.module, "set");
                emit(code, OpCode::CallMethod, set_index, 2);
            }
            Expr::Binary {
                op, left, right, ..
            } => {
                self.compile_expr(left, code)?;
                self.compile_expr(right, code)?;
                let opcode = match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Less => OpCode::LessThan,
                    BinaryOp::Greater => OpCode::GreaterThan,
                    BinaryOp::Equal => OpCode::Equal,
                    BinaryOp::NotEqual => OpCode::NotEqual,
                    BinaryOp::LessEqual => OpCode::LessEqual,
                    BinaryOp::GreaterEqual => OpCode::GreaterEqual,
                };
                emit(code, opcode, 0, 0);
            }
            Expr::ListLit { elements, .. } => {
                for element in elements {
                    self.compile_expr(element, code)?;
                }
                emit(code, OpCode::MakeList, elements.len() as i32, 0);
            }
            Expr::DictLit { entries, .. } => {
                for (key, value) in entries {
                    self.compile_expr(key, code)?;
                    self.compile_expr(value, code)?;
                }
                emit(code, OpCode::MakeDict, entries.len() as i32, 0);
            }
            Expr::Call { callee, args, .. } => {
                self.compile_call(callee, args, code)?;
            }
            Expr::MethodCall {
                object,
                method,
                args,
                ..
            } => {
                self.compile_expr(object, code)?;
                for arg in args {
                    self.compile_expr(arg, code)?;
                }
                let name_index = add_string(self.module, method);
                emit(code, OpCode::CallMethod, name_index, args.len() as i32);
            }
            Expr::Property { object, name, .. } => {
                self.compile_expr(object, code)?;
                let name_index = add_string(self.module, name);
                emit(code, OpCode::LoadAttr, name_index, 0);
            }
            Expr::Index { object, index, .. } => {
                self.compile_expr(object, code)?;
                self.compile_expr(index, code)?;
                let get_index = add_string(self.module, "get");
                emit(code, OpCode::CallMethod, get_index, 1);
            }
        }
        Ok(())
    }

    /// Calls resolve the callee at compile time: locals and other
    /// first-class values go through `CallValue`, known functions through
    /// `CallFunc`, known classes through `NewInstance`, known module
    /// globals through `LoadName` + `CallValue`, and any remaining bare
    /// name is a host call by name.
    fn compile_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        code: &mut Vec<Instruction>,
    ) -> CompileResult<()> {
        if let Expr::Variable { name, .. } = callee {
            if let Some(&slot) = self.locals.get(name) {
                emit(code, OpCode::LoadLocal, slot as i32, 0);
                for arg in args {
                    self.compile_expr(arg, code)?;
                }
                emit(code, OpCode::CallValue, args.len() as i32, 0);
                return Ok(());
            }
            if let Some(&index) = self.func_index.get(name) {
                for arg in args {
                    self.compile_expr(arg, code)?;
                }
                emit(code, OpCode::CallFunc, index as i32, args.len() as i32);
                return Ok(());
            }
            if let Some(&index) = self.class_index.get(name) {
                for arg in args {
                    self.compile_expr(arg, code)?;
                }
                emit(code, OpCode::NewInstance, index as i32, args.len() as i32);
                return Ok(());
            }
            if self.module_globals.contains(name) {
                let name_index = add_string(self.module, name);
                emit(code, OpCode::LoadName, name_index, 0);
                for arg in args {
                    self.compile_expr(arg, code)?;
                }
                emit(code, OpCode::CallValue, args.len() as i32, 0);
                return Ok(());
            }

            let name_index = add_string(self.module, name);
            for arg in args {
                self.compile_expr(arg, code)?;
            }
            emit(code, OpCode::CallHost, name_index, args.len() as i32);
            return Ok(());
        }

        self.compile_expr(callee, code)?;
        for arg in args {
            self.compile_expr(arg, code)?;
        }
        emit(code, OpCode::CallValue, args.len() as i32, 0);
        Ok(())
    }

    fn compile_statements(
        &mut self,
        statements: &[Stmt],
        out: &mut FunctionBytecode,
        mut loop_context: Option<&mut LoopContext>,
    ) -> CompileResult<()> {
        for stmt in statements {
            match stmt {
                Stmt::Let { name, init, pos } => match init {
                    LetInit::Expr(expr) => {
                        self.compile_expr(expr, &mut out.code)?;
                        if self.is_module_init {
                            let name_index = add_string(self.module, name);
                            emit(&mut out.code, OpCode::StoreName, name_index, 0);
                        } else {
                            let slot = self.ensure_local(out, name);
                            emit(&mut out.code, OpCode::StoreLocal, slot as i32, 0);
                        }
                    }
                    LetInit::Spawn { .. } => {
                        return Err(CompileError::CoroutineDisabled {
                            what: "spawn",
                            scope: self.scope.clone(),
                            pos: *pos,
                        });
                    }
                    LetInit::Await { .. } => {
                        return Err(CompileError::CoroutineDisabled {
                            what: "await",
                            scope: self.scope.clone(),
                            pos: *pos,
                        });
                    }
                },
                Stmt::ForRange {
                    var,
                    start,
                    end,
                    body,
                    ..
                } => {
                    let iter_slot = self.ensure_local(out, var);
                    let end_slot =
                        self.ensure_local(out, &format!("__for_end_{}{}", var, out.code.len()));

                    self.compile_expr(start, &mut out.code)?;
                    emit(&mut out.code, OpCode::StoreLocal, iter_slot as i32, 0);
                    self.compile_expr(end, &mut out.code)?;
                    emit(&mut out.code, OpCode::StoreLocal, end_slot as i32, 0);

                    let loop_start = out.code.len();
                    emit(&mut out.code, OpCode::LoadLocal, iter_slot as i32, 0);
                    emit(&mut out.code, OpCode::LoadLocal, end_slot as i32, 0);
                    emit(&mut out.code, OpCode::LessThan, 0, 0);
                    let exit_jump = emit_jump(&mut out.code, OpCode::JumpIfFalse);

                    let mut local_loop = LoopContext::default();
                    self.compile_statements(body, out, Some(&mut local_loop))?;

                    local_loop.continue_target = out.code.len();
                    let one = add_constant(self.module, Value::Int(1));
                    emit(&mut out.code, OpCode::LoadLocal, iter_slot as i32, 0);
                    emit(&mut out.code, OpCode::PushConst, one, 0);
                    emit(&mut out.code, OpCode::Add, 0, 0);
                    emit(&mut out.code, OpCode::StoreLocal, iter_slot as i32, 0);
                    emit(&mut out.code, OpCode::Jump, loop_start as i32, 0);

                    let loop_end = out.code.len();
                    patch_jump(&mut out.code, exit_jump, loop_end);
                    for jump in local_loop.continue_jumps {
                        patch_jump(&mut out.code, jump, local_loop.continue_target);
                    }
                    for jump in local_loop.break_jumps {
                        patch_jump(&mut out.code, jump, loop_end);
                    }
                }
                Stmt::ForList {
                    var,
                    iterable,
                    body,
                    ..
                } => {
                    let item_slot = self.ensure_local(out, var);
                    let suffix = out.code.len();
                    let list_slot =
                        self.ensure_local(out, &format!("__for_list_{}{}", var, suffix));
                    let index_slot =
                        self.ensure_local(out, &format!("__for_idx_{}{}", var, suffix));
                    let size_slot =
                        self.ensure_local(out, &format!("__for_size_{}{}", var, suffix));

                    self.compile_expr(iterable, &mut out.code)?;
                    emit(&mut out.code, OpCode::StoreLocal, list_slot as i32, 0);
                    let zero = add_constant(self.module, Value::Int(0));
                    emit(&mut out.code, OpCode::PushConst, zero, 0);
                    emit(&mut out.code, OpCode::StoreLocal, index_slot as i32, 0);

                    // The size is re-read every iteration so growth or
                    // shrinkage during the loop is observed.
                    let loop_start = out.code.len();
                    let size_name = add_string(self.module, "size");
                    emit(&mut out.code, OpCode::LoadLocal, list_slot as i32, 0);
                    emit(&mut out.code, OpCode::CallMethod, size_name, 0);
                    emit(&mut out.code, OpCode::StoreLocal, size_slot as i32, 0);

                    emit(&mut out.code, OpCode::LoadLocal, index_slot as i32, 0);
                    emit(&mut out.code, OpCode::LoadLocal, size_slot as i32, 0);
                    emit(&mut out.code, OpCode::LessThan, 0, 0);
                    let exit_jump = emit_jump(&mut out.code, OpCode::JumpIfFalse);

                    let get_name = add_string(self.module, "get");
                    emit(&mut out.code, OpCode::LoadLocal, list_slot as i32, 0);
                    emit(&mut out.code, OpCode::LoadLocal, index_slot as i32, 0);
                    emit(&mut out.code, OpCode::CallMethod, get_name, 1);
                    emit(&mut out.code, OpCode::StoreLocal, item_slot as i32, 0);

                    let mut local_loop = LoopContext::default();
                    self.compile_statements(body, out, Some(&mut local_loop))?;

                    local_loop.continue_target = out.code.len();
                    let one = add_constant(self.module, Value::Int(1));
                    emit(&mut out.code, OpCode::LoadLocal, index_slot as i32, 0);
                    emit(&mut out.code, OpCode::PushConst, one, 0);
                    emit(&mut out.code, OpCode::Add, 0, 0);
                    emit(&mut out.code, OpCode::StoreLocal, index_slot as i32, 0);
                    emit(&mut out.code, OpCode::Jump, loop_start as i32, 0);

                    let loop_end = out.code.len();
                    patch_jump(&mut out.code, exit_jump, loop_end);
                    for jump in local_loop.continue_jumps {
                        patch_jump(&mut out.code, jump, local_loop.continue_target);
                    }
                    for jump in local_loop.break_jumps {
                        patch_jump(&mut out.code, jump, loop_end);
                    }
                }
                Stmt::ForDict {
                    key,
                    value,
                    iterable,
                    body,
                    ..
                } => {
                    let key_slot = self.ensure_local(out, key);
                    let value_slot = self.ensure_local(out, value);
                    let suffix = out.code.len();
                    let dict_slot =
                        self.ensure_local(out, &format!("__for_dict_{}{}", key, suffix));
                    let index_slot =
                        self.ensure_local(out, &format!("__for_idx_{}{}", key, suffix));
                    let size_slot =
                        self.ensure_local(out, &format!("__for_size_{}{}", key, suffix));

                    self.compile_expr(iterable, &mut out.code)?;
                    emit(&mut out.code, OpCode::StoreLocal, dict_slot as i32, 0);
                    let zero = add_constant(self.module, Value::Int(0));
                    emit(&mut out.code, OpCode::PushConst, zero, 0);
                    emit(&mut out.code, OpCode::StoreLocal, index_slot as i32, 0);

                    let loop_start = out.code.len();
                    let size_name = add_string(self.module, "size");
                    emit(&mut out.code, OpCode::LoadLocal, dict_slot as i32, 0);
                    emit(&mut out.code, OpCode::CallMethod, size_name, 0);
                    emit(&mut out.code, OpCode::StoreLocal, size_slot as i32, 0);

                    emit(&mut out.code, OpCode::LoadLocal, index_slot as i32, 0);
                    emit(&mut out.code, OpCode::LoadLocal, size_slot as i32, 0);
                    emit(&mut out.code, OpCode::LessThan, 0, 0);
                    let exit_jump = emit_jump(&mut out.code, OpCode::JumpIfFalse);

                    let key_at = add_string(self.module, "key_at");
                    emit(&mut out.code, OpCode::LoadLocal, dict_slot as i32, 0);
                    emit(&mut out.code, OpCode::LoadLocal, index_slot as i32, 0);
                    emit(&mut out.code, OpCode::CallMethod, key_at, 1);
                    emit(&mut out.code, OpCode::StoreLocal, key_slot as i32, 0);

                    let value_at = add_string(self.module, "value_at");
                    emit(&mut out.code, OpCode::LoadLocal, dict_slot as i32, 0);
                    emit(&mut out.code, OpCode::LoadLocal, index_slot as i32, 0);
                    emit(&mut out.code, OpCode::CallMethod, value_at, 1);
                    emit(&mut out.code, OpCode::StoreLocal, value_slot as i32, 0);

                    let mut local_loop = LoopContext::default();
                    self.compile_statements(body, out, Some(&mut local_loop))?;

                    local_loop.continue_target = out.code.len();
                    let one = add_constant(self.module, Value::Int(1));
                    emit(&mut out.code, OpCode::LoadLocal, index_slot as i32, 0);
                    emit(&mut out.code, OpCode::PushConst, one, 0);
                    emit(&mut out.code, OpCode::Add, 0, 0);
                    emit(&mut out.code, OpCode::StoreLocal, index_slot as i32, 0);
                    emit(&mut out.code, OpCode::Jump, loop_start as i32, 0);

                    let loop_end = out.code.len();
                    patch_jump(&mut out.code, exit_jump, loop_end);
                    for jump in local_loop.continue_jumps {
                        patch_jump(&mut out.code, jump, local_loop.continue_target);
                    }
                    for jump in local_loop.break_jumps {
                        patch_jump(&mut out.code, jump, loop_end);
                    }
                }
                Stmt::If {
                    branches,
                    else_body,
                    ..
                } => {
                    let mut end_jumps = Vec::new();
                    for (condition, body) in branches {
                        self.compile_expr(condition, &mut out.code)?;
                        let false_jump = emit_jump(&mut out.code, OpCode::JumpIfFalse);
                        self.compile_statements(body, out, loop_context.as_deref_mut())?;
                        end_jumps.push(emit_jump(&mut out.code, OpCode::Jump));
                        let next = out.code.len();
                        patch_jump(&mut out.code, false_jump, next);
                    }

                    if !else_body.is_empty() {
                        self.compile_statements(else_body, out, loop_context.as_deref_mut())?;
                    }

                    let after_if = out.code.len();
                    for jump in end_jumps {
                        patch_jump(&mut out.code, jump, after_if);
                    }
                }
                Stmt::While {
                    condition, body, ..
                } => {
                    let loop_start = out.code.len();
                    let mut local_loop = LoopContext {
                        continue_target: loop_start,
                        ..Default::default()
                    };

                    self.compile_expr(condition, &mut out.code)?;
                    let exit_jump = emit_jump(&mut out.code, OpCode::JumpIfFalse);

                    self.compile_statements(body, out, Some(&mut local_loop))?;
                    emit(&mut out.code, OpCode::Jump, loop_start as i32, 0);

                    let loop_end = out.code.len();
                    patch_jump(&mut out.code, exit_jump, loop_end);
                    for jump in local_loop.continue_jumps {
                        patch_jump(&mut out.code, jump, local_loop.continue_target);
                    }
                    for jump in local_loop.break_jumps {
                        patch_jump(&mut out.code, jump, loop_end);
                    }
                }
                Stmt::Break { pos } => match loop_context.as_deref_mut() {
                    Some(context) => {
                        context
                            .break_jumps
                            .push(emit_jump(&mut out.code, OpCode::Jump));
                    }
                    None => {
                        return Err(CompileError::BreakOutsideLoop {
                            scope: self.scope.clone(),
                            pos: *pos,
                        });
                    }
                },
                Stmt::Continue { pos } => match loop_context.as_deref_mut() {
                    Some(context) => {
                        context
                            .continue_jumps
                            .push(emit_jump(&mut out.code, OpCode::Jump));
                    }
                    None => {
                        return Err(CompileError::ContinueOutsideLoop {
                            scope: self.scope.clone(),
                            pos: *pos,
                        });
                    }
                },
                Stmt::Expr { expr, .. } => {
                    self.compile_expr(expr, &mut out.code)?;
                    emit(&mut out.code, OpCode::Pop, 0, 0);
                }
                Stmt::Return { expr, .. } => {
                    self.compile_expr(expr, &mut out.code)?;
                    emit(&mut out.code, OpCode::Return, 0, 0);
                }
                Stmt::Sleep { pos, .. } => {
                    return Err(CompileError::CoroutineDisabled {
                        what: "sleep",
                        scope: self.scope.clone(),
                        pos: *pos,
                    });
                }
                Stmt::Yield { pos } => {
                    return Err(CompileError::CoroutineDisabled {
                        what: "yield",
                        scope: self.scope.clone(),
                        pos: *pos,
                    });
                }
            }
        }
        Ok(())
    }
}

// ---- program compilation ------------------------------------------------

/// Compile a parsed program into a module.
pub fn compile_program(program: &Program) -> CompileResult<CompiledModule> {
    let mut module = CompiledModule::default();
    let mut func_index: HashMap<String, usize> = HashMap::new();
    let mut class_index: HashMap<String, usize> = HashMap::new();

    // Pass 1: indices and module globals.
    for class in &program.classes {
        if class_index.contains_key(&class.name) {
            return Err(CompileError::DuplicateClass {
                name: class.name.clone(),
                pos: class.pos,
            });
        }
        class_index.insert(class.name.clone(), module.classes.len());
        module.classes.push(ClassBytecode {
            name: class.name.clone(),
            ..Default::default()
        });
    }

    for function in &program.functions {
        if func_index.contains_key(&function.name) {
            return Err(CompileError::DuplicateFunction {
                name: function.name.clone(),
                pos: function.pos,
            });
        }
        func_index.insert(function.name.clone(), module.functions.len());
        module.functions.push(FunctionBytecode {
            name: function.name.clone(),
            params: function.params.clone(),
            local_count: function.params.len(),
            ..Default::default()
        });
    }

    if !func_index.contains_key(MODULE_INIT) {
        func_index.insert(MODULE_INIT.to_string(), module.functions.len());
        module.functions.push(FunctionBytecode {
            name: MODULE_INIT.to_string(),
            ..Default::default()
        });
    }

    let mut declared_globals = HashSet::new();
    for stmt in &program.top_level {
        let Stmt::Let { name, init, pos } = stmt else {
            continue;
        };
        if func_index.contains_key(name) || class_index.contains_key(name) {
            return Err(CompileError::DuplicateTopLevelSymbol {
                name: name.clone(),
                pos: *pos,
            });
        }
        if declared_globals.insert(name.clone()) {
            // Fold literal/symbolic initializers into the binding; anything
            // runtime-dependent starts Nil and is assigned by module init.
            let initial = match init {
                LetInit::Expr(expr) => {
                    eval_const_init(expr, &mut module, &func_index, &class_index)
                        .unwrap_or(Value::Nil)
                }
                _ => Value::Nil,
            };
            module.globals.push(GlobalBinding {
                name: name.clone(),
                initial_value: initial,
            });
        }
    }

    // Pass 2: class descriptors, attribute defaults, method pre-declaration.
    for class in &program.classes {
        let class_slot = class_index[&class.name];

        if let Some(base_name) = &class.base_name {
            let Some(&base_slot) = class_index.get(base_name) else {
                return Err(CompileError::UnknownBaseClass {
                    name: base_name.clone(),
                    pos: class.pos,
                });
            };
            module.classes[class_slot].base_class_index = base_slot as i32;
        }

        for attr in &class.attributes {
            let Some(default_value) =
                eval_const_init(&attr.initializer, &mut module, &func_index, &class_index)
            else {
                return Err(CompileError::InvalidFieldInitializer {
                    scope: format!("{}::<attr>", class.name),
                    pos: attr.pos,
                });
            };
            module.classes[class_slot].attributes.push(ClassAttribute {
                name: attr.name.clone(),
                default_value,
            });
        }

        let mut has_constructor = false;
        for method in &class.methods {
            if method.name == "__new__" {
                has_constructor = true;
                if method.params.is_empty() {
                    return Err(CompileError::ConstructorWithoutSelf {
                        class: class.name.clone(),
                        pos: method.pos,
                    });
                }
            }

            let mangled = mangle_method_name(&class.name, &method.name);
            if func_index.contains_key(&mangled) {
                return Err(CompileError::DuplicateMethod {
                    name: mangled,
                    pos: method.pos,
                });
            }
            let index = module.functions.len();
            func_index.insert(mangled.clone(), index);
            module.functions.push(FunctionBytecode {
                name: mangled,
                params: method.params.clone(),
                local_count: method.params.len(),
                ..Default::default()
            });
            module.classes[class_slot].methods.push(ClassMethod {
                name: method.name.clone(),
                function_index: index,
            });
        }

        if !has_constructor {
            return Err(CompileError::MissingConstructor {
                class: class.name.clone(),
                pos: class.pos,
            });
        }
    }

    // Pass 3: bodies.
    let module_globals: HashSet<String> =
        module.globals.iter().map(|g| g.name.clone()).collect();

    for function in &program.functions {
        let index = func_index[&function.name];
        compile_body(
            &mut module,
            &func_index,
            &class_index,
            &module_globals,
            index,
            &function.params,
            &function.body,
            &function.name,
            false,
        )?;
    }

    for class in &program.classes {
        for method in &class.methods {
            let mangled = mangle_method_name(&class.name, &method.name);
            let index = func_index[&mangled];
            compile_body(
                &mut module,
                &func_index,
                &class_index,
                &module_globals,
                index,
                &method.params,
                &method.body,
                &mangled,
                false,
            )?;
        }
    }

    let init_index = func_index[MODULE_INIT];
    compile_body(
        &mut module,
        &func_index,
        &class_index,
        &module_globals,
        init_index,
        &[],
        &program.top_level,
        MODULE_INIT,
        true,
    )?;

    debug!(
        functions = module.functions.len(),
        classes = module.classes.len(),
        globals = module.globals.len(),
        "module compiled"
    );
    Ok(module)
}

#[allow(clippy::too_many_arguments)]
fn compile_body(
    module: &mut CompiledModule,
    func_index: &HashMap<String, usize>,
    class_index: &HashMap<String, usize>,
    module_globals: &HashSet<String>,
    function_slot: usize,
    params: &[String],
    body: &[Stmt],
    scope: &str,
    is_module_init: bool,
) -> CompileResult<()> {
    validate_scope_local_rules(body, params, scope)?;

    let mut out = std::mem::take(&mut module.functions[function_slot]);
    let mut locals = HashMap::new();
    for (slot, param) in params.iter().enumerate() {
        locals.insert(param.clone(), slot);
    }

    let mut body_compiler = BodyCompiler {
        module,
        locals,
        func_index,
        class_index,
        module_globals,
        scope: scope.to_string(),
        is_module_init,
    };
    body_compiler.compile_statements(body, &mut out, None)?;

    // Fall-off-the-end bodies return 0.
    if out.code.last().map(|ins| ins.op) != Some(OpCode::Return) {
        let zero = add_constant(module, Value::Int(0));
        emit(&mut out.code, OpCode::PushConst, zero, 0);
        emit(&mut out.code, OpCode::Return, 0, 0);
    }

    out.stack_slot_count = estimate_stack_slots(&out.code);
    module.functions[function_slot] = out;
    Ok(())
}

// ---- source-level entry points ------------------------------------------

/// Compile in-memory source (after rewriting any import lines).
pub fn compile_source(source: &str) -> Result<CompiledModule, ScriptError> {
    let rewritten = preprocess_source(source)?;
    let tokens = tokenize(&rewritten)?;
    let program = parse_program(tokens)?;
    Ok(compile_program(&program)?)
}

/// Compile a source file: imports are preprocessed (and their targets
/// validated recursively), then the rewritten source is compiled.
/// Diagnostics tagged `[function: <module>]` are upgraded with the
/// enclosing function name inferred from the source text.
pub fn compile_source_file(
    path: &Path,
    search_paths: &[PathBuf],
) -> Result<CompiledModule, ScriptError> {
    let mut cache = ImportCache::default();
    let rewritten = preprocess_file(path, search_paths, &mut cache)?;

    tokenize(&rewritten)
        .map_err(ScriptError::from)
        .and_then(|tokens| parse_program(tokens).map_err(ScriptError::from))
        .and_then(|program| compile_program(&program).map_err(ScriptError::from))
        .map_err(|error| upgrade_scope_tag(error, path, &rewritten))
}

static FN_HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*fn\s+([A-Za-z_][A-Za-z0-9_]*)\s*\([^)]*\)\s*\{").expect("fn header regex")
});

/// Find the function whose body encloses `line_no`, by brace counting.
pub fn infer_function_at_line(source: &str, line_no: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    if line_no == 0 || line_no > lines.len() {
        return "<module>".to_string();
    }

    let mut current = "<module>".to_string();
    let mut depth = 0i32;
    let mut function_depth = 0i32;

    for line in lines.iter().take(line_no) {
        let header = FN_HEADER_RE.captures(line);

        for c in line.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
        }

        if let Some(caps) = header {
            current = caps[1].to_string();
            function_depth = depth;
        }

        if current != "<module>" && depth < function_depth {
            current = "<module>".to_string();
            function_depth = 0;
        }
    }

    current
}

static LINE_COL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+):\d+: error:").expect("line-col regex"));

/// Diagnostics that could only name `<module>` as their scope are
/// re-rendered with the function inferred from the (rewritten) source,
/// prefixed with the file path.
fn upgrade_scope_tag(error: ScriptError, path: &Path, source: &str) -> ScriptError {
    const MODULE_TAG: &str = "[function: <module>]";
    let rendered = error.to_string();
    if !rendered.contains(MODULE_TAG) {
        return error;
    }
    let Some(caps) = LINE_COL_RE.captures(&rendered) else {
        return error;
    };
    let Ok(line_no) = caps[1].parse::<usize>() else {
        return error;
    };
    let inferred = infer_function_at_line(source, line_no);
    if inferred == "<module>" {
        return error;
    }

    let message = format!(
        "{}:{}",
        path.display(),
        rendered.replace(MODULE_TAG, &format!("[function: {}]", inferred))
    );
    ScriptError::Compile(CompileError::Rendered { message })
}

#[cfg(test)]
mod tests;
