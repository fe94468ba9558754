//! Default global host functions
//!
//! The minimal surface every script can rely on: `print`, `printf`,
//! `str`, `type`, `id`, `loadModule`, plus the `system` module with its
//! `gc` hint.

use std::io::Write;

use crate::bytecode::Value;
use crate::types::module::materialize_export;
use crate::types::{ModuleObject, ObjectData};
use crate::vm::errors::RuntimeError;

use super::{HostCall, HostRegistry};

fn print_values(
    call: &mut HostCall<'_>,
    args: &[Value],
    with_prefix: bool,
    with_newline: bool,
    separator: &str,
) -> Result<(), RuntimeError> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if with_prefix {
        let _ = out.write_all(b"[script]");
    }
    for (i, arg) in args.iter().enumerate() {
        let rendered = call.value_str(*arg)?;
        if i == 0 {
            if with_prefix {
                let _ = out.write_all(b" ");
            }
        } else {
            let _ = out.write_all(separator.as_bytes());
        }
        let _ = out.write_all(rendered.as_bytes());
    }
    if with_newline {
        let _ = out.write_all(b"\n");
    }
    let _ = out.flush();
    Ok(())
}

/// `loadModule(name[, exports…])` — resolve, compile and cache a script
/// module. With one export name the export itself is returned; with more
/// the module object is returned with those exports pre-materialized.
fn load_module(call: &mut HostCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.is_empty() {
        return Err(RuntimeError::host("loadModule() requires a module name"));
    }
    let name = call.value_str(args[0])?;

    let module_value = match call.module_cache.get(&name) {
        Some(value) => *value,
        None => {
            let pin = call.loader.load(&name)?;
            let value = call
                .d
                .alloc(ObjectData::Module(ModuleObject::script(name.clone(), pin)));
            call.module_cache.insert(name.clone(), value);
            value
        }
    };

    if args.len() == 1 {
        return Ok(module_value);
    }

    let module_id = module_value
        .as_ref_id()
        .ok_or(RuntimeError::ObjectNotFound)?;
    let pin = match &call.d.object(module_id)?.data {
        ObjectData::Module(module) => module
            .module
            .clone()
            .ok_or_else(|| RuntimeError::host(format!("Module object is not loaded: {}", name)))?,
        _ => return Err(RuntimeError::ObjectNotFound),
    };

    let mut resolved = Vec::with_capacity(args.len() - 1);
    for export_arg in &args[1..] {
        let export_name = call.value_str(*export_arg)?;
        let Some(value) = materialize_export(&mut call.d, &pin, &export_name)? else {
            return Err(RuntimeError::host(format!(
                "Module {} has no export named {}",
                name, export_name
            )));
        };
        let value = call.d.normalize_value(&pin, value, true)?;
        resolved.push((export_name, value));
    }

    if let ObjectData::Module(module) = &mut call.d.object_mut(module_id)?.data {
        for (export_name, value) in &resolved {
            module.exports.insert(export_name.clone(), *value);
        }
    }

    // `from M import x` binds the export itself.
    if resolved.len() == 1 {
        return Ok(resolved[0].1);
    }
    Ok(module_value)
}

/// Bind the default global functions and the `system` module.
pub fn bind_global_functions(registry: &mut HostRegistry) {
    registry.bind("print", |call, args| {
        print_values(call, args, true, true, ", ")?;
        Ok(Value::Int(0))
    });

    registry.bind("printf", |call, args| {
        print_values(call, args, false, false, "")?;
        Ok(Value::Int(0))
    });

    registry.bind("str", |call, args| {
        if args.len() != 1 {
            return Err(RuntimeError::host("str() requires exactly one argument"));
        }
        let rendered = call.value_str(args[0])?;
        Ok(call.make_string(rendered))
    });

    registry.bind("type", |call, args| {
        if args.len() != 1 {
            return Err(RuntimeError::host("type() requires exactly one argument"));
        }
        let name = call.type_name(args[0]);
        Ok(call.make_string(name))
    });

    registry.bind("id", |call, args| {
        if args.len() != 1 {
            return Err(RuntimeError::host("id() requires exactly one argument"));
        }
        let id = call.object_id(args[0])?;
        if id > i64::MAX as u64 {
            return Err(RuntimeError::host("id() overflow"));
        }
        Ok(Value::Int(id as i64))
    });

    registry.bind("loadModule", load_module);

    registry.bind_module_function("system", "gc", |_call, args| {
        // Heaps live for the context lifetime; the hint is accepted and
        // ignored. Argument validation still applies.
        if args.len() > 1 {
            return Err(RuntimeError::host("system.gc() accepts zero or one argument"));
        }
        if let Some(generation) = args.first() {
            generation
                .as_int()
                .ok_or(RuntimeError::WrongTag { expected: "integer" })?;
        }
        Ok(Value::Int(0))
    });
}
