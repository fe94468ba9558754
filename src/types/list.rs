//! List objects
//!
//! Ordered, growable sequence of values. `get`/`remove` outside the
//! bounds answer Nil; `set` outside the bounds is an error.

use once_cell::sync::Lazy;

use crate::bytecode::Value;
use crate::vm::errors::RuntimeError;

use super::{Dispatch, ObjectData, TypeSpec};

#[derive(Debug, Default)]
pub struct ListObject {
    pub items: Vec<Value>,
}

impl ListObject {
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }
}

fn require_list<'a>(d: &'a Dispatch<'_>, id: u64) -> Result<&'a ListObject, RuntimeError> {
    match &d.object(id)?.data {
        ObjectData::List(list) => Ok(list),
        _ => Err(RuntimeError::WrongTag { expected: "list" }),
    }
}

fn require_list_mut<'a>(
    d: &'a mut Dispatch<'_>,
    id: u64,
) -> Result<&'a mut ListObject, RuntimeError> {
    match &mut d.object_mut(id)?.data {
        ObjectData::List(list) => Ok(list),
        _ => Err(RuntimeError::WrongTag { expected: "list" }),
    }
}

fn int_arg(args: &[Value], index: usize) -> Result<i64, RuntimeError> {
    args[index]
        .as_int()
        .ok_or(RuntimeError::WrongTag { expected: "integer" })
}

fn method_push(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    let list = require_list_mut(d, id)?;
    list.items.push(args[0]);
    Ok(Value::Int(list.items.len() as i64))
}

fn method_get(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    let index = int_arg(args, 0)?;
    let list = require_list(d, id)?;
    if index < 0 || index as usize >= list.items.len() {
        return Ok(Value::Nil);
    }
    Ok(list.items[index as usize])
}

fn method_set(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    let index = int_arg(args, 0)?;
    let list = require_list_mut(d, id)?;
    if index < 0 || index as usize >= list.items.len() {
        return Err(RuntimeError::OutOfRange("List.set index out of range".into()));
    }
    list.items[index as usize] = args[1];
    Ok(args[1])
}

fn method_remove(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    let index = int_arg(args, 0)?;
    let list = require_list_mut(d, id)?;
    if index < 0 || index as usize >= list.items.len() {
        return Ok(Value::Nil);
    }
    Ok(list.items.remove(index as usize))
}

fn method_size(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Int(require_list(d, id)?.items.len() as i64))
}

fn member_length(d: &mut Dispatch<'_>, id: u64) -> Result<Value, RuntimeError> {
    Ok(Value::Int(require_list(d, id)?.items.len() as i64))
}

fn str_list(d: &mut Dispatch<'_>, id: u64) -> Result<String, RuntimeError> {
    let items = require_list(d, id)?.items.clone();
    let mut out = String::from("[");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&d.value_str(*item)?);
    }
    out.push(']');
    Ok(out)
}

static LIST_TYPE: Lazy<TypeSpec> = Lazy::new(|| {
    let mut spec = TypeSpec::new("List", str_list);
    spec.register_method("push", 1, method_push);
    spec.register_method("get", 1, method_get);
    spec.register_method("set", 2, method_set);
    spec.register_method("remove", 1, method_remove);
    spec.register_method("size", 0, method_size);
    spec.register_member("length", member_length, None);
    spec
});

pub fn list_type() -> &'static TypeSpec {
    &LIST_TYPE
}
