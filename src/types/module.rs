//! Module objects
//!
//! A loaded module seen from script code. Exports materialize lazily from
//! the pinned compiled module (globals, functions, classes) on first
//! member access; host-backed modules carry their exports eagerly and
//! have no pin.

use indexmap::IndexMap;
use once_cell::sync::Lazy;

use crate::bytecode::{ModulePin, Value};
use crate::vm::errors::RuntimeError;

use super::callable::{ClassObject, FunctionObject};
use super::{Dispatch, ObjectData, TypeSpec};

#[derive(Debug)]
pub struct ModuleObject {
    pub name: String,
    pub module: Option<ModulePin>,
    pub exports: IndexMap<String, Value>,
}

impl ModuleObject {
    pub fn script(name: impl Into<String>, module: ModulePin) -> Self {
        Self {
            name: name.into(),
            module: Some(module),
            exports: IndexMap::new(),
        }
    }

    pub fn host(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: None,
            exports: IndexMap::new(),
        }
    }
}

/// Build the export value for `name` from a pinned module: a global's
/// initial value, a first-class function, or a class object. The caller
/// normalizes and caches the result.
pub fn materialize_export(
    d: &mut Dispatch<'_>,
    pin: &ModulePin,
    name: &str,
) -> Result<Option<Value>, RuntimeError> {
    if let Some(global) = pin.find_global(name) {
        return Ok(Some(global.initial_value));
    }
    if let Some(index) = pin.find_function(name) {
        let value = d.alloc(ObjectData::Function(FunctionObject {
            function_index: index,
            module: pin.clone(),
        }));
        return Ok(Some(value));
    }
    if let Some(index) = pin.find_class(name) {
        let value = d.alloc(ObjectData::Class(ClassObject {
            class_name: name.to_string(),
            class_index: index,
            module: pin.clone(),
        }));
        return Ok(Some(value));
    }
    Ok(None)
}

fn str_module(d: &mut Dispatch<'_>, id: u64) -> Result<String, RuntimeError> {
    match &d.object(id)?.data {
        ObjectData::Module(module) => Ok(format!("Module({})#{}", module.name, id)),
        _ => Err(RuntimeError::WrongTag { expected: "module" }),
    }
}

static MODULE_TYPE: Lazy<TypeSpec> = Lazy::new(|| TypeSpec::new("Module", str_module));

pub fn module_type() -> &'static TypeSpec {
    &MODULE_TYPE
}
