//! Callable objects: script functions, lambdas, native functions and
//! class objects.
//!
//! Every script callable is pinned to the module that defines it, so the
//! bytecode outlives any reference the host or other modules hold.

use once_cell::sync::Lazy;

use crate::bytecode::ModulePin;
use crate::host::HostFunction;
use crate::vm::errors::RuntimeError;

use super::{Dispatch, ObjectData, TypeSpec};

/// A module function made first-class.
#[derive(Debug)]
pub struct FunctionObject {
    pub function_index: usize,
    pub module: ModulePin,
}

/// A function plus captured cells. Captures reference upvalue cells, not
/// plain values, so assignments through any holder stay shared.
#[derive(Debug)]
pub struct LambdaObject {
    pub function_index: usize,
    pub module: ModulePin,
    pub captures: Vec<crate::bytecode::Value>,
}

/// A host callback made first-class.
pub struct NativeFunctionObject {
    pub name: String,
    pub callback: HostFunction,
}

impl std::fmt::Debug for NativeFunctionObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunctionObject")
            .field("name", &self.name)
            .finish()
    }
}

/// A script class made first-class; calling it runs the constructor
/// protocol.
#[derive(Debug)]
pub struct ClassObject {
    pub class_name: String,
    pub class_index: usize,
    pub module: ModulePin,
}

fn str_function(_d: &mut Dispatch<'_>, _id: u64) -> Result<String, RuntimeError> {
    Ok("[Function]".to_string())
}

fn str_lambda(_d: &mut Dispatch<'_>, _id: u64) -> Result<String, RuntimeError> {
    Ok("[Lambda]".to_string())
}

fn str_native(d: &mut Dispatch<'_>, id: u64) -> Result<String, RuntimeError> {
    match &d.object(id)?.data {
        ObjectData::Native(native) => Ok(format!("[NativeFunction {}]", native.name)),
        _ => Err(RuntimeError::WrongTag {
            expected: "native function",
        }),
    }
}

fn str_class(d: &mut Dispatch<'_>, id: u64) -> Result<String, RuntimeError> {
    match &d.object(id)?.data {
        ObjectData::Class(class) => Ok(format!("[Class {}]", class.class_name)),
        _ => Err(RuntimeError::WrongTag { expected: "class" }),
    }
}

static FUNCTION_TYPE: Lazy<TypeSpec> = Lazy::new(|| TypeSpec::new("Function", str_function));
static LAMBDA_TYPE: Lazy<TypeSpec> = Lazy::new(|| TypeSpec::new("Lambda", str_lambda));
static NATIVE_FUNCTION_TYPE: Lazy<TypeSpec> =
    Lazy::new(|| TypeSpec::new("NativeFunction", str_native));
static CLASS_TYPE: Lazy<TypeSpec> = Lazy::new(|| TypeSpec::new("Class", str_class));

pub fn function_type() -> &'static TypeSpec {
    &FUNCTION_TYPE
}

pub fn lambda_type() -> &'static TypeSpec {
    &LAMBDA_TYPE
}

pub fn native_function_type() -> &'static TypeSpec {
    &NATIVE_FUNCTION_TYPE
}

pub fn class_type() -> &'static TypeSpec {
    &CLASS_TYPE
}
