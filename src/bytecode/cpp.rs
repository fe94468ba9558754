//! C++ source emitter
//!
//! Compatibility surface for embedders that ship modules ahead-of-time as
//! a generated translation unit. The output reconstructs a module at
//! startup; it is produced as text only and never compiled here.

use std::fmt::Write as _;

use super::{CompiledModule, OpCode, Value};

/// A module that cannot be rendered as C++ source.
#[derive(Debug, thiserror::Error)]
pub enum CppEmitError {
    #[error("AOT generation does not support runtime Ref values in constants")]
    RefConstant,
}

fn cpp_quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out.push('"');
    out
}

fn cpp_value(value: Value) -> Result<String, CppEmitError> {
    Ok(match value {
        Value::Nil => "gs::Value::Nil()".to_string(),
        Value::Int(v) => format!("gs::Value::Int({})", v),
        Value::Str(v) => format!("gs::Value::String({})", v),
        Value::Ref(_) => return Err(CppEmitError::RefConstant),
        Value::Function(v) => format!("gs::Value::Function({})", v),
        Value::Class(v) => format!("gs::Value::Class({})", v),
        Value::Module(v) => format!("gs::Value::Module({})", v),
    })
}

fn opcode_ident(op: OpCode) -> &'static str {
    match op {
        OpCode::PushConst => "PushConst",
        OpCode::LoadLocal => "LoadLocal",
        OpCode::StoreLocal => "StoreLocal",
        OpCode::LoadName => "LoadName",
        OpCode::StoreName => "StoreName",
        OpCode::Add => "Add",
        OpCode::Sub => "Sub",
        OpCode::Mul => "Mul",
        OpCode::Div => "Div",
        OpCode::LessThan => "LessThan",
        OpCode::GreaterThan => "GreaterThan",
        OpCode::Equal => "Equal",
        OpCode::NotEqual => "NotEqual",
        OpCode::LessEqual => "LessEqual",
        OpCode::GreaterEqual => "GreaterEqual",
        OpCode::Jump => "Jump",
        OpCode::JumpIfFalse => "JumpIfFalse",
        OpCode::CallHost => "CallHost",
        OpCode::CallFunc => "CallFunc",
        OpCode::NewInstance => "NewInstance",
        OpCode::LoadAttr => "LoadAttr",
        OpCode::StoreAttr => "StoreAttr",
        OpCode::CallMethod => "CallMethod",
        OpCode::CallValue => "CallValue",
        OpCode::SpawnFunc => "SpawnFunc",
        OpCode::Await => "Await",
        OpCode::MakeList => "MakeList",
        OpCode::MakeDict => "MakeDict",
        OpCode::Sleep => "Sleep",
        OpCode::Yield => "Yield",
        OpCode::Return => "Return",
        OpCode::Pop => "Pop",
    }
}

/// Emit a C++ function `symbol()` that rebuilds `module`.
pub fn generate_cpp_module(module: &CompiledModule, symbol: &str) -> Result<String, CppEmitError> {
    let mut out = String::new();
    out.push_str("#include \"gs/bytecode.hpp\"\n\n");
    let _ = writeln!(out, "gs::Module {}() {{", symbol);
    out.push_str("    gs::Module m;\n");

    for constant in &module.constants {
        let _ = writeln!(out, "    m.constants.push_back({});", cpp_value(*constant)?);
    }
    for s in &module.strings {
        let _ = writeln!(out, "    m.strings.push_back({});", cpp_quote(s));
    }

    for function in &module.functions {
        out.push_str("    {\n");
        out.push_str("        gs::FunctionBytecode f;\n");
        let _ = writeln!(out, "        f.name = {};", cpp_quote(&function.name));
        for param in &function.params {
            let _ = writeln!(out, "        f.params.push_back({});", cpp_quote(param));
        }
        let _ = writeln!(out, "        f.localCount = {};", function.local_count);
        for ins in &function.code {
            let _ = writeln!(
                out,
                "        f.code.push_back(gs::Instruction{{gs::OpCode::{}, {}, {}}});",
                opcode_ident(ins.op),
                ins.a,
                ins.b
            );
        }
        out.push_str("        m.functions.push_back(std::move(f));\n");
        out.push_str("    }\n");
    }

    for class in &module.classes {
        out.push_str("    {\n");
        out.push_str("        gs::ClassBytecode c;\n");
        let _ = writeln!(out, "        c.name = {};", cpp_quote(&class.name));
        let _ = writeln!(out, "        c.baseClassIndex = {};", class.base_class_index);
        for attr in &class.attributes {
            let _ = writeln!(
                out,
                "        c.attributes.push_back({{{}, {}}});",
                cpp_quote(&attr.name),
                cpp_value(attr.default_value)?
            );
        }
        for method in &class.methods {
            let _ = writeln!(
                out,
                "        c.methods.push_back({{{}, {}}});",
                cpp_quote(&method.name),
                method.function_index
            );
        }
        out.push_str("        m.classes.push_back(std::move(c));\n");
        out.push_str("    }\n");
    }

    for global in &module.globals {
        let _ = writeln!(
            out,
            "    m.globals.push_back({{{}, {}}});",
            cpp_quote(&global.name),
            cpp_value(global.initial_value)?
        );
    }

    out.push_str("    return m;\n");
    out.push_str("}\n");
    Ok(out)
}
