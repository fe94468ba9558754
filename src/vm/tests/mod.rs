use std::sync::Arc;

use crate::bytecode::{CompiledModule, FunctionBytecode, Instruction, OpCode, Value};
use crate::error::ScriptError;
use crate::host::HostRegistry;
use crate::runtime::loader::ModuleLoader;
use crate::runtime::tasks::TaskSystem;
use crate::runtime::Runtime;
use crate::vm::{RunState, RuntimeError, VirtualMachine};

fn run_source(source: &str) -> Result<Value, ScriptError> {
    let runtime = Runtime::new();
    runtime.load_source(source)?;
    runtime.call("main", &[])
}

fn run_rendered(source: &str) -> Result<String, ScriptError> {
    let runtime = Runtime::new();
    runtime.load_source(source)?;
    runtime.call_rendered("main", &[])
}

fn runtime_err(source: &str) -> RuntimeError {
    match run_source(source) {
        Err(ScriptError::Runtime(error)) => error,
        other => panic!("expected runtime error, got {:?}", other.map(|_| ())),
    }
}

fn vm_for(module: CompiledModule) -> VirtualMachine {
    VirtualMachine::new(
        Arc::new(module),
        Arc::new(HostRegistry::with_defaults()),
        Arc::new(TaskSystem::new(2)),
        Arc::new(ModuleLoader::new()),
    )
}

// ---- end-to-end scenarios ------------------------------------------------

#[test]
fn scenario_local_arithmetic() {
    let result = run_source("fn main() { let a = 1; let b = 2; return a + b; }").unwrap();
    assert_eq!(result, Value::Int(3));
}

#[test]
fn scenario_recursive_fibonacci() {
    let source = r#"
        fn fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); }
        fn main() { return fib(10); }
    "#;
    assert_eq!(run_source(source).unwrap(), Value::Int(55));
}

#[test]
fn scenario_class_constructor_and_method() {
    let source = r#"
        class P {
            x = 0;
            fn __new__(self, v) { self.x = v; }
            fn double(self) { return self.x + self.x; }
        }
        fn main() { let p = P(21); return p.double(); }
    "#;
    assert_eq!(run_source(source).unwrap(), Value::Int(42));
}

#[test]
fn scenario_method_override_in_subclass() {
    let source = r#"
        class A { fn __new__(self) { } fn who(self) { return "A"; } }
        class B extends A { fn __new__(self) { } fn who(self) { return "B"; } }
        fn main() { let b = B(); return b.who(); }
    "#;
    assert_eq!(run_rendered(source).unwrap(), "B");
}

#[test]
fn scenario_list_iteration() {
    let source = r#"
        fn main() { let xs = [10, 20, 30]; let s = 0; for (x in xs) { s = s + x; } return s; }
    "#;
    assert_eq!(run_source(source).unwrap(), Value::Int(60));
}

#[test]
fn scenario_dict_iteration_follows_insertion_order() {
    let source = r#"
        fn main() {
            let d = {1: "a", 2: "b"};
            let out = "";
            for (k, v in d) { out = out + str(k) + v; }
            return out;
        }
    "#;
    assert_eq!(run_rendered(source).unwrap(), "1a2b");
}

// ---- constructor protocol ------------------------------------------------

#[test]
fn constructor_return_value_is_discarded() {
    let source = r#"
        class P {
            x = 0;
            fn __new__(self, v) { self.x = v; return 999; }
        }
        fn main() { let p = P(21); return p.x; }
    "#;
    assert_eq!(run_source(source).unwrap(), Value::Int(21));
}

#[test]
fn base_class_defaults_seed_before_derived() {
    let source = r#"
        class A { x = 1; y = 2; fn __new__(self) { } }
        class B extends A { y = 7; fn __new__(self) { } }
        fn main() { let b = B(); return b.x * 10 + b.y; }
    "#;
    assert_eq!(run_source(source).unwrap(), Value::Int(17));
}

#[test]
fn inherited_methods_resolve_through_base_chain() {
    let source = r#"
        class A { fn __new__(self) { } fn ping(self) { return 5; } }
        class B extends A { fn __new__(self) { } }
        fn main() { let b = B(); return b.ping(); }
    "#;
    assert_eq!(run_source(source).unwrap(), Value::Int(5));
}

#[test]
fn class_as_first_class_value_constructs() {
    let source = r#"
        class P {
            x = 0;
            fn __new__(self, v) { self.x = v; }
            fn double(self) { return self.x + self.x; }
        }
        fn main() { let p = P; let q = p(21); return q.double(); }
    "#;
    assert_eq!(run_source(source).unwrap(), Value::Int(42));
}

#[test]
fn instance_field_holding_function_is_callable() {
    let source = r#"
        fn helper() { return 9; }
        class C { f = helper; fn __new__(self) { } }
        fn main() { let c = C(); return c.f(); }
    "#;
    assert_eq!(run_source(source).unwrap(), Value::Int(9));
}

// ---- strings -------------------------------------------------------------

#[test]
fn add_concatenates_when_either_side_is_not_int() {
    assert_eq!(
        run_rendered("fn main() { return \"n=\" + 42; }").unwrap(),
        "n=42"
    );
    assert_eq!(
        run_rendered("fn main() { return 1 + \"x\"; }").unwrap(),
        "1x"
    );
}

#[test]
fn string_method_surface() {
    assert_eq!(
        run_rendered("fn main() { return \"hello\".upper(); }").unwrap(),
        "HELLO"
    );
    assert_eq!(
        run_source("fn main() { return \"hello\".find(\"ll\"); }").unwrap(),
        Value::Int(2)
    );
    assert_eq!(
        run_source("fn main() { return \"hello\".find(\"zz\"); }").unwrap(),
        Value::Int(-1)
    );
    assert_eq!(
        run_source("fn main() { return \"hello\".length; }").unwrap(),
        Value::Int(5)
    );
    assert_eq!(
        run_rendered("fn main() { return \"  pad  \".strip(); }").unwrap(),
        "pad"
    );
    assert_eq!(
        run_rendered("fn main() { return \"a-b\".replace(\"-\", \"+\"); }").unwrap(),
        "a+b"
    );
    assert_eq!(
        run_source("fn main() { return \"abc\".startsWith(\"ab\"); }").unwrap(),
        Value::Int(1)
    );
    assert_eq!(
        run_rendered("fn main() { return \"abcdef\".slice(2, 4); }").unwrap(),
        "cd"
    );
    assert_eq!(
        run_rendered("fn main() { return \"abcdef\".at(3); }").unwrap(),
        "d"
    );
}

#[test]
fn split_returns_a_real_list() {
    let source = r#"
        fn main() {
            let parts = "a,b,c".split(",");
            return parts.size() * 100 + parts.get(1).length;
        }
    "#;
    assert_eq!(run_source(source).unwrap(), Value::Int(301));
}

#[test]
fn circular_structures_render_as_circular() {
    let source = r#"
        fn main() { let xs = []; xs.push(xs); return str(xs); }
    "#;
    assert_eq!(run_rendered(source).unwrap(), "[[Circular]]");
}

// ---- collections ----------------------------------------------------------

#[test]
fn list_boundaries() {
    assert_eq!(
        run_source("fn main() { let xs = [1, 2]; return xs.get(-1); }").unwrap(),
        Value::Nil
    );
    assert_eq!(
        run_source("fn main() { let xs = [1, 2]; return xs.get(5); }").unwrap(),
        Value::Nil
    );
    assert!(matches!(
        runtime_err("fn main() { let xs = [1]; xs.set(3, 0); return 0; }"),
        RuntimeError::OutOfRange(_)
    ));
    assert_eq!(
        run_source("fn main() { let xs = [7, 8]; return xs.remove(0) + xs.size(); }").unwrap(),
        Value::Int(8)
    );
    assert_eq!(
        run_source("fn main() { let xs = []; xs.push(4); return xs.length; }").unwrap(),
        Value::Int(1)
    );
}

#[test]
fn dict_boundaries_and_value_keys() {
    assert_eq!(
        run_source("fn main() { let d = {}; return d.get(9); }").unwrap(),
        Value::Nil
    );
    assert_eq!(
        run_source("fn main() { let d = {}; return d.del(9); }").unwrap(),
        Value::Nil
    );
    assert_eq!(
        run_source("fn main() { let d = {}; d.set(\"k\", 5); return d.get(\"k\"); }").unwrap(),
        Value::Int(5)
    );
    // Deletion preserves the order of remaining entries.
    let source = r#"
        fn main() {
            let d = {1: "a", 2: "b", 3: "c"};
            d.del(2);
            let out = "";
            for (k, v in d) { out = out + v; }
            return out;
        }
    "#;
    assert_eq!(run_rendered(source).unwrap(), "ac");
}

#[test]
fn index_syntax_reaches_collection_methods() {
    assert_eq!(
        run_source("fn main() { let xs = [1, 2, 3]; xs[1] = 20; return xs[1] + xs[2]; }").unwrap(),
        Value::Int(23)
    );
    assert_eq!(
        run_source("fn main() { let d = {4: 40}; return d[4]; }").unwrap(),
        Value::Int(40)
    );
}

// ---- globals and modules ---------------------------------------------------

#[test]
fn module_globals_are_shared_across_functions() {
    let source = r#"
        let total = 0;
        fn bump() { total = total + 1; return total; }
        fn main() { bump(); bump(); return total; }
    "#;
    assert_eq!(run_source(source).unwrap(), Value::Int(2));
}

#[test]
fn top_level_initializers_run_before_main() {
    let source = r#"
        let xs = [1, 2, 3];
        fn main() { return xs.size(); }
    "#;
    assert_eq!(run_source(source).unwrap(), Value::Int(3));
}

#[test]
fn imported_module_functions_and_globals() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("util.gs"),
        "let scale = 10;\nfn make(x) { return x * scale; }\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("main.gs"),
        "import util\nfn main() { return util.make(3) + util.scale; }\n",
    )
    .unwrap();

    let runtime = Runtime::new();
    runtime.add_search_path(dir.path());
    runtime.load_source_file(dir.path().join("main.gs")).unwrap();
    assert_eq!(runtime.call("main", &[]).unwrap(), Value::Int(40));
}

#[test]
fn module_attribute_access_triggers_init_first() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("cfg.gs"), "let version = 7;\n").unwrap();
    std::fs::write(
        dir.path().join("main.gs"),
        "import cfg\nfn main() { return cfg.version; }\n",
    )
    .unwrap();

    let runtime = Runtime::new();
    runtime.add_search_path(dir.path());
    runtime.load_source_file(dir.path().join("main.gs")).unwrap();
    assert_eq!(runtime.call("main", &[]).unwrap(), Value::Int(7));
}

#[test]
fn imported_classes_construct_across_modules() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("shapes.gs"),
        r#"
class Box {
    w = 0;
    fn __new__(self, w) { self.w = w; }
    fn area(self) { return self.w * self.w; }
}
"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("main.gs"),
        "from shapes import Box\nfn main() { let b = Box(6); return b.area(); }\n",
    )
    .unwrap();

    let runtime = Runtime::new();
    runtime.add_search_path(dir.path());
    runtime.load_source_file(dir.path().join("main.gs")).unwrap();
    assert_eq!(runtime.call("main", &[]).unwrap(), Value::Int(36));
}

#[test]
fn module_init_runs_once_per_context() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("counter.gs"),
        "let count = 0;\nfn bump() { count = count + 1; return count; }\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("main.gs"),
        "import counter\nfn main() { counter.bump(); counter.bump(); return counter.bump(); }\n",
    )
    .unwrap();

    let runtime = Runtime::new();
    runtime.add_search_path(dir.path());
    runtime.load_source_file(dir.path().join("main.gs")).unwrap();
    // A re-run of counter's init between calls would reset the global.
    assert_eq!(runtime.call("main", &[]).unwrap(), Value::Int(3));
}

#[test]
fn module_init_cycles_are_detected_at_runtime() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("a.gs"),
        "let bmod = loadModule(\"b\");\nlet x = bmod.fb();\nfn fa() { return 1; }\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("b.gs"),
        "let amod = loadModule(\"a\");\nlet y = amod.fa();\nfn fb() { return 2; }\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("main.gs"),
        "import a\nfn main() { return a.x; }\n",
    )
    .unwrap();

    let runtime = Runtime::new();
    runtime.add_search_path(dir.path());
    runtime.load_source_file(dir.path().join("main.gs")).unwrap();
    let error = runtime.call("main", &[]).unwrap_err();
    assert!(error.to_string().contains("cycle"));
}

// ---- host functions ---------------------------------------------------------

#[test]
fn host_type_and_str() {
    assert_eq!(run_rendered("fn main() { return type(5); }").unwrap(), "int");
    assert_eq!(
        run_rendered("fn main() { return type(\"x\"); }").unwrap(),
        "string"
    );
    assert_eq!(
        run_rendered("fn main() { return type([1]); }").unwrap(),
        "List"
    );
    assert_eq!(
        run_rendered("fn main() { return str([1, 2]); }").unwrap(),
        "[1, 2]"
    );
}

#[test]
fn unknown_host_function_is_reported_by_name() {
    let error = runtime_err("fn main() { return frobnicate(); }");
    assert_eq!(error.to_string(), "Host function not found: frobnicate");
}

#[test]
fn host_id_is_stable_within_a_run() {
    let source = r#"
        fn main() {
            let xs = [1];
            let a = id(xs);
            xs.push(2);
            let b = id(xs);
            return a == b;
        }
    "#;
    assert_eq!(run_source(source).unwrap(), Value::Int(1));
}

#[test]
fn instances_report_their_class_from_type() {
    let source = r#"
        class Widget { fn __new__(self) { } }
        fn main() { let w = Widget(); return type(w); }
    "#;
    assert_eq!(run_rendered(source).unwrap(), "Widget");
}

#[test]
fn os_module_reads_and_writes_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("note.txt");
    let source = format!(
        r#"
        fn main() {{
            os.write("{path}", "payload");
            return os.read("{path}");
        }}
        "#,
        path = path.display()
    );
    assert_eq!(run_rendered(&source).unwrap(), "payload");
}

#[test]
fn file_objects_support_the_handle_surface() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    let source = format!(
        r#"
        fn main() {{
            let f = os.open("{path}", "w");
            f.write("abcdef");
            f.close();
            let r = os.open("{path}", "r");
            r.seek(2, 0);
            let part = r.read(3);
            let size = r.size();
            r.close();
            return part + str(size);
        }}
        "#,
        path = path.display()
    );
    assert_eq!(run_rendered(&source).unwrap(), "cde6");
}

#[test]
fn path_objects_inspect_the_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("doc.txt");
    std::fs::write(&file, "x").unwrap();
    let source = format!(
        r#"
        fn main() {{
            let p = os.Path("{path}");
            let out = p.filename() + "|" + p.extension() + "|" + str(p.exists()) + "|" + str(p.isFile());
            return out;
        }}
        "#,
        path = file.display()
    );
    assert_eq!(run_rendered(&source).unwrap(), "doc.txt|.txt|1|1");
}

// ---- delete hooks -----------------------------------------------------------

#[test]
fn delete_hooks_run_after_completion() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("deleted.log");
    let source = format!(
        r#"
        class Res {{
            tag = "r";
            fn __new__(self, tag) {{ self.tag = tag; }}
            fn __delete__(self) {{ os.append("{path}", self.tag); }}
        }}
        fn main() {{ let a = Res("a"); let b = Res("b"); return 0; }}
        "#,
        path = marker.display()
    );
    assert_eq!(run_source(&source).unwrap(), Value::Int(0));
    let logged = std::fs::read_to_string(&marker).unwrap();
    let mut tags: Vec<char> = logged.chars().collect();
    tags.sort_unstable();
    assert_eq!(tags, vec!['a', 'b']);
}

#[test]
fn failing_delete_hook_does_not_stop_the_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("swept.log");
    let source = format!(
        r#"
        class Bad {{
            fn __new__(self) {{ }}
            fn __delete__(self) {{ let x = 1 / 0; }}
        }}
        class Good {{
            fn __new__(self) {{ }}
            fn __delete__(self) {{ os.append("{path}", "g"); }}
        }}
        fn main() {{ let b = Bad(); let g = Good(); return 5; }}
        "#,
        path = marker.display()
    );
    assert_eq!(run_source(&source).unwrap(), Value::Int(5));
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "g");
}

#[test]
fn delete_hooks_do_not_clobber_the_return_value() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ret.log");
    let source = format!(
        r#"
        class R {{
            fn __new__(self) {{ }}
            fn __delete__(self) {{ os.append("{path}", "x"); return 777; }}
        }}
        fn main() {{ let r = R(); return 13; }}
        "#,
        path = marker.display()
    );
    assert_eq!(run_source(&source).unwrap(), Value::Int(13));
}

// ---- errors ------------------------------------------------------------------

#[test]
fn division_by_zero_is_reported() {
    assert!(matches!(
        runtime_err("fn main() { return 1 / 0; }"),
        RuntimeError::DivisionByZero
    ));
}

#[test]
fn calling_a_non_callable_names_the_type() {
    let error = runtime_err("fn main() { let x = 5; return x(); }");
    assert!(matches!(error, RuntimeError::NotCallable(ref t) if t == "int"));
}

#[test]
fn unknown_method_names_the_type() {
    let error = runtime_err("fn main() { let xs = [1]; return xs.frobnicate(); }");
    assert!(
        matches!(error, RuntimeError::UnknownMethod { ref type_name, .. } if type_name == "List")
    );
}

#[test]
fn unknown_instance_attribute_is_reported() {
    let error = runtime_err(
        "class C { fn __new__(self) { } } fn main() { let c = C(); return c.missing; }",
    );
    assert!(matches!(error, RuntimeError::UnknownAttribute(_)));
}

#[test]
fn arity_mismatch_on_script_calls() {
    let error = runtime_err("fn f(a, b) { return a + b; } fn main() { return f(1); }");
    assert!(matches!(error, RuntimeError::FunctionArityMismatch(_)));
}

#[test]
fn missing_entry_point_is_reported() {
    let runtime = Runtime::new();
    runtime.load_source("fn helper() { return 1; }").unwrap();
    assert!(matches!(
        runtime.call("main", &[]),
        Err(ScriptError::Runtime(RuntimeError::FunctionNotFound(_)))
    ));
}

#[test]
fn ref_conditions_are_rejected() {
    let error = runtime_err("fn main() { let xs = [1]; if (xs) { return 1; } return 0; }");
    assert!(matches!(error, RuntimeError::BadCondition(_)));
}

#[test]
fn truthiness_of_ints_nil_and_strings() {
    let source = r#"
        fn pick(c, a, b) { if (c) { return a; } return b; }
        fn main() {
            let out = 0;
            out = out + pick(1, 1, 0);
            out = out * 10 + pick(0, 1, 0);
            out = out * 10 + pick("x", 1, 0);
            out = out * 10 + pick("", 1, 0);
            return out;
        }
    "#;
    assert_eq!(run_source(source).unwrap(), Value::Int(1010));
}

// ---- hand-assembled bytecode: gated opcodes ----------------------------------

fn function(name: &str, params: &[&str], code: Vec<Instruction>) -> FunctionBytecode {
    FunctionBytecode {
        name: name.to_string(),
        params: params.iter().map(|p| p.to_string()).collect(),
        local_count: params.len(),
        stack_slot_count: crate::bytecode::estimate_stack_slots(&code),
        code,
    }
}

#[test]
fn sleep_suspends_with_a_wake_time() {
    let mut module = CompiledModule::default();
    module.constants.push(Value::Int(1));
    module.functions.push(function(
        "main",
        &[],
        vec![
            Instruction::new(OpCode::Sleep, 5, 0),
            Instruction::new(OpCode::PushConst, 0, 0),
            Instruction::new(OpCode::Return, 0, 0),
        ],
    ));

    let vm = vm_for(module);
    let mut ctx = vm.begin_coroutine("main", &[]).unwrap();
    assert_eq!(vm.resume(&mut ctx, 100).unwrap(), RunState::Suspended);
    assert!(ctx.wake_time.is_some());
    std::thread::sleep(std::time::Duration::from_millis(10));
    assert_eq!(vm.resume(&mut ctx, 100).unwrap(), RunState::Completed);
    assert_eq!(ctx.return_value, Value::Int(1));
}

#[test]
fn resume_before_wake_time_stays_suspended() {
    let mut module = CompiledModule::default();
    module.constants.push(Value::Int(1));
    module.functions.push(function(
        "main",
        &[],
        vec![
            Instruction::new(OpCode::Sleep, 10_000, 0),
            Instruction::new(OpCode::PushConst, 0, 0),
            Instruction::new(OpCode::Return, 0, 0),
        ],
    ));

    let vm = vm_for(module);
    let mut ctx = vm.begin_coroutine("main", &[]).unwrap();
    assert_eq!(vm.resume(&mut ctx, 100).unwrap(), RunState::Suspended);
    assert_eq!(vm.resume(&mut ctx, 100).unwrap(), RunState::Suspended);
}

#[test]
fn yield_suspends_and_resumes_immediately() {
    let mut module = CompiledModule::default();
    module.constants.push(Value::Int(9));
    module.functions.push(function(
        "main",
        &[],
        vec![
            Instruction::new(OpCode::Yield, 0, 0),
            Instruction::new(OpCode::PushConst, 0, 0),
            Instruction::new(OpCode::Return, 0, 0),
        ],
    ));

    let vm = vm_for(module);
    let mut ctx = vm.begin_coroutine("main", &[]).unwrap();
    assert_eq!(vm.resume(&mut ctx, 100).unwrap(), RunState::Suspended);
    assert_eq!(vm.resume(&mut ctx, 100).unwrap(), RunState::Completed);
    assert_eq!(ctx.return_value, Value::Int(9));
}

#[test]
fn step_budget_limits_each_resume() {
    let mut module = CompiledModule::default();
    module.constants.push(Value::Int(0));
    // An empty infinite loop: Jump to self.
    module.functions.push(function(
        "main",
        &[],
        vec![Instruction::new(OpCode::Jump, 0, 0)],
    ));

    let vm = vm_for(module);
    let mut ctx = vm.begin_coroutine("main", &[]).unwrap();
    assert_eq!(vm.resume(&mut ctx, 50).unwrap(), RunState::Running);
    assert_eq!(vm.resume(&mut ctx, 50).unwrap(), RunState::Running);
}

#[test]
fn spawn_and_await_deliver_results_across_threads() {
    let mut module = CompiledModule::default();
    module.constants.push(Value::Int(6));
    module.constants.push(Value::Int(7));
    module.functions.push(function(
        "worker",
        &["a", "b"],
        vec![
            Instruction::new(OpCode::LoadLocal, 0, 0),
            Instruction::new(OpCode::LoadLocal, 1, 0),
            Instruction::new(OpCode::Mul, 0, 0),
            Instruction::new(OpCode::Return, 0, 0),
        ],
    ));
    module.functions.push(function(
        "main",
        &[],
        vec![
            Instruction::new(OpCode::PushConst, 0, 0),
            Instruction::new(OpCode::PushConst, 1, 0),
            Instruction::new(OpCode::SpawnFunc, 0, 2),
            Instruction::new(OpCode::Await, 0, 0),
            Instruction::new(OpCode::Return, 0, 0),
        ],
    ));

    let vm = vm_for(module);
    assert_eq!(vm.run_function("main", &[]).unwrap(), Value::Int(42));
}

#[test]
fn spawned_task_errors_surface_on_await() {
    let mut module = CompiledModule::default();
    module.constants.push(Value::Int(1));
    module.constants.push(Value::Int(0));
    module.functions.push(function(
        "worker",
        &[],
        vec![
            Instruction::new(OpCode::PushConst, 0, 0),
            Instruction::new(OpCode::PushConst, 1, 0),
            Instruction::new(OpCode::Div, 0, 0),
            Instruction::new(OpCode::Return, 0, 0),
        ],
    ));
    module.functions.push(function(
        "main",
        &[],
        vec![
            Instruction::new(OpCode::SpawnFunc, 0, 0),
            Instruction::new(OpCode::Await, 0, 0),
            Instruction::new(OpCode::Return, 0, 0),
        ],
    ));

    let vm = vm_for(module);
    assert!(matches!(
        vm.run_function("main", &[]),
        Err(RuntimeError::DivisionByZero)
    ));
}

#[test]
fn awaiting_an_unknown_handle_fails() {
    let mut module = CompiledModule::default();
    module.constants.push(Value::Int(12345));
    module.functions.push(function(
        "main",
        &[],
        vec![
            Instruction::new(OpCode::PushConst, 0, 0),
            Instruction::new(OpCode::Await, 0, 0),
            Instruction::new(OpCode::Return, 0, 0),
        ],
    ));

    let vm = vm_for(module);
    assert!(matches!(
        vm.run_function("main", &[]),
        Err(RuntimeError::TaskHandleNotFound)
    ));
}

// ---- malformed bytecode -------------------------------------------------------

#[test]
fn jump_past_code_end_is_an_error() {
    let mut module = CompiledModule::default();
    module.functions.push(function(
        "main",
        &[],
        vec![Instruction::new(OpCode::Jump, 99, 0)],
    ));

    let vm = vm_for(module);
    assert!(matches!(
        vm.run_function("main", &[]),
        Err(RuntimeError::InstructionPointerOutOfRange)
    ));
}

#[test]
fn stack_underflow_is_an_error() {
    let mut module = CompiledModule::default();
    module.functions.push(function(
        "main",
        &[],
        vec![Instruction::new(OpCode::Pop, 0, 0)],
    ));

    let vm = vm_for(module);
    assert!(matches!(
        vm.run_function("main", &[]),
        Err(RuntimeError::StackUnderflow)
    ));
}

#[test]
fn wrong_tag_arithmetic_is_an_error() {
    let mut module = CompiledModule::default();
    module.constants.push(Value::Nil);
    module.constants.push(Value::Int(1));
    module.functions.push(function(
        "main",
        &[],
        vec![
            Instruction::new(OpCode::PushConst, 0, 0),
            Instruction::new(OpCode::PushConst, 1, 0),
            Instruction::new(OpCode::Sub, 0, 0),
            Instruction::new(OpCode::Return, 0, 0),
        ],
    ));

    let vm = vm_for(module);
    assert!(matches!(
        vm.run_function("main", &[]),
        Err(RuntimeError::WrongTag { .. })
    ));
}

#[test]
fn falling_off_the_end_of_code_is_an_error() {
    let mut module = CompiledModule::default();
    module.constants.push(Value::Int(1));
    module.functions.push(function(
        "main",
        &[],
        vec![Instruction::new(OpCode::PushConst, 0, 0)],
    ));

    let vm = vm_for(module);
    assert!(matches!(
        vm.run_function("main", &[]),
        Err(RuntimeError::InstructionPointerOutOfRange)
    ));
}

// ---- object identity ----------------------------------------------------------

#[test]
fn object_ids_are_unique_within_a_context() {
    let source = r#"
        fn main() {
            let a = [1];
            let b = [1];
            return id(a) == id(b);
        }
    "#;
    assert_eq!(run_source(source).unwrap(), Value::Int(0));
}

#[test]
fn reference_equality_is_identity() {
    let source = r#"
        fn main() {
            let a = [1];
            let b = a;
            let c = [1];
            return str(a == b) + str(a == c);
        }
    "#;
    assert_eq!(run_rendered(source).unwrap(), "10");
}

#[test]
fn equality_compares_strings_by_content() {
    let source = r#"
        fn main() { return str("ab" == "ab") + str("ab" == "cd") + str("ab" != "cd"); }
    "#;
    assert_eq!(run_rendered(source).unwrap(), "101");
}

#[test]
fn while_loops_with_break_and_continue() {
    let source = r#"
        fn main() {
            let s = 0;
            let i = 0;
            while (i < 100) {
                i = i + 1;
                if (i == 3) { continue; }
                if (i == 6) { break; }
                s = s + i;
            }
            return s;
        }
    "#;
    // 1 + 2 + 4 + 5
    assert_eq!(run_source(source).unwrap(), Value::Int(12));
}

#[test]
fn nested_loop_jumps_stay_scoped() {
    let source = r#"
        fn main() {
            let hits = 0;
            for (i in range(3)) {
                for (j in range(3)) {
                    if (j == 1) { continue; }
                    if (i == 2) { break; }
                    hits = hits + 1;
                }
            }
            return hits;
        }
    "#;
    // i in {0,1}: j hits 0 and 2 → 4; i == 2 breaks on j == 0.
    assert_eq!(run_source(source).unwrap(), Value::Int(4));
}
