use super::{compile_program, compile_source, infer_function_at_line, CompileError};
use crate::bytecode::{stack_delta, CompiledModule, OpCode, Value, MODULE_INIT};
use crate::error::ScriptError;
use crate::frontend::lexer::tokenize;
use crate::frontend::parser::parse_program;

fn compile(source: &str) -> CompiledModule {
    compile_source(source).expect("compiles")
}

fn compile_err(source: &str) -> CompileError {
    let tokens = tokenize(source).expect("tokenizes");
    let program = parse_program(tokens).expect("parses");
    compile_program(&program).expect_err("should fail to compile")
}

/// Effective stack movement for flow analysis. `CallFunc`/`NewInstance`
/// deliver their result through the callee's `Return`, so the raw delta
/// excludes it; by the time the next instruction runs the result is on
/// the stack, so it counts as pushed here.
fn flow_delta(ins: &crate::bytecode::Instruction) -> i32 {
    match ins.op {
        OpCode::CallFunc | OpCode::NewInstance => stack_delta(ins) + 1,
        _ => stack_delta(ins),
    }
}

/// Walk every reachable instruction from ip 0, accumulating stack deltas.
/// The running depth must never go negative and every `Return` must see
/// exactly one value on the operand stack.
fn check_stack_discipline(module: &CompiledModule) {
    for function in &module.functions {
        let code = &function.code;
        let mut depth_at: Vec<Option<i32>> = vec![None; code.len()];
        let mut work = vec![(0usize, 0i32)];
        while let Some((ip, depth)) = work.pop() {
            if ip >= code.len() {
                panic!("{}: jump past end of code", function.name);
            }
            if let Some(seen) = depth_at[ip] {
                assert_eq!(
                    seen, depth,
                    "{}: inconsistent stack depth at ip {}",
                    function.name, ip
                );
                continue;
            }
            depth_at[ip] = Some(depth);

            let ins = &code[ip];
            let next_depth = depth + flow_delta(ins);
            assert!(
                next_depth >= 0,
                "{}: stack underflow at ip {} ({:?})",
                function.name,
                ip,
                ins.op
            );
            match ins.op {
                OpCode::Return => {
                    assert_eq!(
                        depth, 1,
                        "{}: Return at ip {} with depth {}",
                        function.name, ip, depth
                    );
                }
                OpCode::Jump => work.push((ins.a as usize, next_depth)),
                OpCode::JumpIfFalse => {
                    work.push((ins.a as usize, next_depth));
                    work.push((ip + 1, next_depth));
                }
                _ => work.push((ip + 1, next_depth)),
            }
        }
    }
}

#[test]
fn simple_function_compiles_to_stack_code() {
    let module = compile("fn main() { let a = 1; let b = 2; return a + b; }");
    let main_index = module.find_function("main").unwrap();
    let main = &module.functions[main_index];
    assert_eq!(main.local_count, 2);
    let ops: Vec<OpCode> = main.code.iter().map(|i| i.op).collect();
    assert_eq!(
        ops,
        vec![
            OpCode::PushConst,
            OpCode::StoreLocal,
            OpCode::PushConst,
            OpCode::StoreLocal,
            OpCode::LoadLocal,
            OpCode::LoadLocal,
            OpCode::Add,
            OpCode::Return,
        ]
    );
    check_stack_discipline(&module);
}

#[test]
fn every_body_gets_implicit_return() {
    let module = compile("fn nothing() { }");
    let f = &module.functions[module.find_function("nothing").unwrap()];
    let ops: Vec<OpCode> = f.code.iter().map(|i| i.op).collect();
    assert_eq!(ops, vec![OpCode::PushConst, OpCode::Return]);
}

#[test]
fn module_init_is_always_present() {
    let module = compile("fn main() { return 0; }");
    assert!(module.find_function(MODULE_INIT).is_some());
}

#[test]
fn top_level_let_folds_constants_and_stores_name() {
    let module = compile("let answer = 42;\nlet greeting = \"hi\";\nfn main() { return answer; }");
    assert_eq!(
        module.find_global("answer").unwrap().initial_value,
        Value::Int(42)
    );
    assert!(matches!(
        module.find_global("greeting").unwrap().initial_value,
        Value::Str(_)
    ));

    let init = &module.functions[module.find_function(MODULE_INIT).unwrap()];
    assert!(init.code.iter().any(|i| i.op == OpCode::StoreName));
}

#[test]
fn top_level_symbol_folding_resolves_functions() {
    let module = compile("fn helper() { return 1; }\nlet f = helper;\nfn main() { return 0; }");
    assert_eq!(
        module.find_global("f").unwrap().initial_value,
        Value::Function(module.find_function("helper").unwrap() as i64)
    );
}

#[test]
fn known_function_calls_use_call_func() {
    let module = compile("fn helper() { return 1; } fn main() { return helper(); }");
    let main = &module.functions[module.find_function("main").unwrap()];
    let helper_index = module.find_function("helper").unwrap() as i32;
    assert!(main
        .code
        .iter()
        .any(|i| i.op == OpCode::CallFunc && i.a == helper_index));
}

#[test]
fn known_class_calls_use_new_instance() {
    let module = compile(
        "class P { fn __new__(self) { } } fn main() { let p = P(); return 0; }",
    );
    let main = &module.functions[module.find_function("main").unwrap()];
    assert!(main.code.iter().any(|i| i.op == OpCode::NewInstance));
}

#[test]
fn unknown_names_fall_back_to_host_calls() {
    let module = compile("fn main() { print(1); return 0; }");
    let main = &module.functions[module.find_function("main").unwrap()];
    let call = main
        .code
        .iter()
        .find(|i| i.op == OpCode::CallHost)
        .expect("host call");
    assert_eq!(module.strings[call.a as usize], "print");
    assert_eq!(call.b, 1);
}

#[test]
fn local_callables_go_through_call_value() {
    let module = compile("fn helper() { return 1; } fn main() { let f = helper; return f(); }");
    let main = &module.functions[module.find_function("main").unwrap()];
    assert!(main.code.iter().any(|i| i.op == OpCode::CallValue));
}

#[test]
fn index_reads_and_writes_desugar_to_methods() {
    let module = compile("fn main() { let xs = [1]; xs[0] = 2; return xs[0]; }");
    let main = &module.functions[module.find_function("main").unwrap()];
    let method_names: Vec<&str> = main
        .code
        .iter()
        .filter(|i| i.op == OpCode::CallMethod)
        .map(|i| module.strings[i.a as usize].as_str())
        .collect();
    assert_eq!(method_names, vec!["set", "get"]);
}

#[test]
fn methods_are_mangled_and_bound() {
    let module = compile(
        "class P { x = 0; fn __new__(self, v) { self.x = v; } fn double(self) { return self.x + self.x; } }\nfn main() { return 0; }",
    );
    assert!(module.find_function("P::__new__").is_some());
    assert!(module.find_function("P::double").is_some());
    let class = &module.classes[module.find_class("P").unwrap()];
    assert_eq!(class.methods.len(), 2);
    assert_eq!(class.attributes.len(), 1);
    check_stack_discipline(&module);
}

#[test]
fn class_attribute_defaults_are_folded() {
    let module = compile(
        "class C { n = 7; s = \"name\"; fn __new__(self) { } }\nfn main() { return 0; }",
    );
    let class = &module.classes[module.find_class("C").unwrap()];
    assert_eq!(class.attributes[0].default_value, Value::Int(7));
    assert!(matches!(class.attributes[1].default_value, Value::Str(_)));
}

#[test]
fn loops_patch_jumps_inside_function_bounds() {
    let module = compile(
        r#"
        fn main() {
            let s = 0;
            for (i in range(1, 10)) {
                if (i == 3) { continue; }
                if (i == 7) { break; }
                s = s + i;
            }
            while (s < 100) { s = s + 1; }
            for (x in [1, 2, 3]) { s = s + x; }
            let d = {1: 2};
            for (k, v in d) { s = s + k + v; }
            return s;
        }
        "#,
    );
    let main = &module.functions[module.find_function("main").unwrap()];
    for ins in &main.code {
        if matches!(ins.op, OpCode::Jump | OpCode::JumpIfFalse) {
            assert!(
                ins.a >= 0 && (ins.a as usize) <= main.code.len(),
                "unpatched or out-of-range jump: {:?}",
                ins
            );
        }
    }
    check_stack_discipline(&module);
}

#[test]
fn stack_discipline_holds_across_features() {
    let module = compile(
        r#"
        class A { v = 1; fn __new__(self) { } fn get(self) { return self.v; } }
        fn helper(a, b) { return a * b; }
        fn main() {
            let a = A();
            let d = {1: "x", 2: "y"};
            let xs = [1, 2, 3];
            let out = "";
            for (k, v in d) { out = out + str(k) + v; }
            if (a.get() < helper(2, 3)) { out = out + "small"; }
            else { out = out + "big"; }
            return out;
        }
        "#,
    );
    check_stack_discipline(&module);
}

#[test]
fn duplicate_let_is_rejected() {
    let err = compile_err("fn main() { let a = 1; let a = 2; }");
    assert!(matches!(err, CompileError::DuplicateLet { .. }));
}

#[test]
fn use_before_declare_is_rejected() {
    let err = compile_err("fn main() { let a = b; let b = 2; }");
    assert!(matches!(err, CompileError::UseBeforeDeclare { .. }));
}

#[test]
fn branch_declarations_join_flat_scope() {
    // Declared in a branch, used after it: allowed by the flat-scope rule.
    compile("fn main(x) { if (x) { let a = 1; } else { } return a; }");
    // Used before the branch that declares it: rejected.
    let err = compile_err("fn main(x) { let y = a; if (x) { let a = 1; } return y; }");
    assert!(matches!(err, CompileError::UseBeforeDeclare { .. }));
}

#[test]
fn duplicate_top_level_symbols_are_rejected() {
    let err = compile_err("fn a() { return 1; }\nlet a = 2;");
    assert!(matches!(err, CompileError::DuplicateTopLevelSymbol { .. }));

    let err = compile_err("fn f() { return 1; }\nfn f() { return 2; }");
    assert!(matches!(err, CompileError::DuplicateFunction { .. }));

    let err = compile_err(
        "class C { fn __new__(self) { } }\nclass C { fn __new__(self) { } }\nfn main() { return 0; }",
    );
    assert!(matches!(err, CompileError::DuplicateClass { .. }));
}

#[test]
fn class_without_constructor_is_rejected() {
    let err = compile_err("class C { x = 1; }\nfn main() { return 0; }");
    assert!(matches!(err, CompileError::MissingConstructor { .. }));
}

#[test]
fn constructor_must_take_self() {
    let err = compile_err("class C { fn __new__() { } }\nfn main() { return 0; }");
    assert!(matches!(err, CompileError::ConstructorWithoutSelf { .. }));
}

#[test]
fn unknown_base_class_is_rejected() {
    let err = compile_err("class C extends Missing { fn __new__(self) { } }\nfn main() { return 0; }");
    assert!(matches!(err, CompileError::UnknownBaseClass { .. }));
}

#[test]
fn invalid_field_initializer_is_rejected() {
    let err = compile_err("class C { x = 1 + 2; fn __new__(self) { } }\nfn main() { return 0; }");
    assert!(matches!(err, CompileError::InvalidFieldInitializer { .. }));
}

#[test]
fn break_and_continue_outside_loops_are_rejected() {
    assert!(matches!(
        compile_err("fn main() { break; }"),
        CompileError::BreakOutsideLoop { .. }
    ));
    assert!(matches!(
        compile_err("fn main() { continue; }"),
        CompileError::ContinueOutsideLoop { .. }
    ));
}

#[test]
fn coroutine_statements_are_gated() {
    assert!(matches!(
        compile_err("fn main() { let h = spawn work(); }"),
        CompileError::CoroutineDisabled { what: "spawn", .. }
    ));
    assert!(matches!(
        compile_err("fn main() { let h = 1; let r = await h; }"),
        CompileError::CoroutineDisabled { what: "await", .. }
    ));
    assert!(matches!(
        compile_err("fn main() { sleep 100; }"),
        CompileError::CoroutineDisabled { what: "sleep", .. }
    ));
    assert!(matches!(
        compile_err("fn main() { yield; }"),
        CompileError::CoroutineDisabled { what: "yield", .. }
    ));
}

#[test]
fn import_lines_are_rewritten_before_compilation() {
    // In-memory compiles rewrite imports without touching the filesystem.
    let result = compile_source("import util\nfn main() { return 0; }");
    // `util` becomes `let util = loadModule("util");` which is a valid
    // top-level let with a runtime initializer.
    let module = result.expect("compiles");
    assert!(module.find_global("util").is_some());
    let init = &module.functions[module.find_function(MODULE_INIT).unwrap()];
    assert!(init.code.iter().any(|i| i.op == OpCode::CallHost));
}

#[test]
fn compile_source_surfaces_lex_and_parse_errors() {
    assert!(matches!(
        compile_source("fn main() { let a = @; }"),
        Err(ScriptError::Lex(_))
    ));
    assert!(matches!(
        compile_source("fn main() { let = 1; }"),
        Err(ScriptError::Parse(_))
    ));
}

#[test]
fn function_scope_inference_walks_braces() {
    let source = "fn outer() {\n    let a = 1;\n}\nfn second() {\n    let b = 2;\n}\nlet c = 3;\n";
    assert_eq!(infer_function_at_line(source, 2), "outer");
    assert_eq!(infer_function_at_line(source, 5), "second");
    assert_eq!(infer_function_at_line(source, 7), "<module>");
}

#[test]
fn serialization_round_trips_compiled_modules() {
    let module = compile(
        r#"
        class P { x = 0; fn __new__(self, v) { self.x = v; } fn get(self) { return self.x; } }
        let version = 3;
        fn main() { let p = P(7); return p.get() + version; }
        "#,
    );
    let text = crate::bytecode::serialize::serialize_module_text(&module);
    let restored = crate::bytecode::serialize::deserialize_module_text(&text).unwrap();
    assert_eq!(restored, module);
}
