//! Tuple objects
//!
//! Fixed-length sequence. Writes are allowed only within bounds.

use once_cell::sync::Lazy;

use crate::bytecode::Value;
use crate::vm::errors::RuntimeError;

use super::{Dispatch, ObjectData, TypeSpec};

#[derive(Debug, Default)]
pub struct TupleObject {
    pub items: Vec<Value>,
}

impl TupleObject {
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }
}

fn require_tuple<'a>(d: &'a Dispatch<'_>, id: u64) -> Result<&'a TupleObject, RuntimeError> {
    match &d.object(id)?.data {
        ObjectData::Tuple(tuple) => Ok(tuple),
        _ => Err(RuntimeError::WrongTag { expected: "tuple" }),
    }
}

fn int_arg(args: &[Value]) -> Result<i64, RuntimeError> {
    args[0]
        .as_int()
        .ok_or(RuntimeError::WrongTag { expected: "integer" })
}

fn method_get(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    let index = int_arg(args)?;
    let tuple = require_tuple(d, id)?;
    if index < 0 || index as usize >= tuple.items.len() {
        return Ok(Value::Nil);
    }
    Ok(tuple.items[index as usize])
}

fn method_set(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    let index = int_arg(args)?;
    let tuple = match &mut d.object_mut(id)?.data {
        ObjectData::Tuple(tuple) => tuple,
        _ => return Err(RuntimeError::WrongTag { expected: "tuple" }),
    };
    if index < 0 || index as usize >= tuple.items.len() {
        return Err(RuntimeError::OutOfRange(
            "Tuple.set index out of range".into(),
        ));
    }
    tuple.items[index as usize] = args[1];
    Ok(args[1])
}

fn method_size(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Int(require_tuple(d, id)?.items.len() as i64))
}

fn member_length(d: &mut Dispatch<'_>, id: u64) -> Result<Value, RuntimeError> {
    Ok(Value::Int(require_tuple(d, id)?.items.len() as i64))
}

fn str_tuple(d: &mut Dispatch<'_>, id: u64) -> Result<String, RuntimeError> {
    let items = require_tuple(d, id)?.items.clone();
    let mut out = String::from("(");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&d.value_str(*item)?);
    }
    out.push(')');
    Ok(out)
}

static TUPLE_TYPE: Lazy<TypeSpec> = Lazy::new(|| {
    let mut spec = TypeSpec::new("Tuple", str_tuple);
    spec.register_method("get", 1, method_get);
    spec.register_method("set", 2, method_set);
    spec.register_method("size", 0, method_size);
    spec.register_member("length", member_length, None);
    spec
});

pub fn tuple_type() -> &'static TypeSpec {
    &TUPLE_TYPE
}
