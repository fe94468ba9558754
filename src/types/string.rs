//! String method surface
//!
//! Strings live in the context string pool rather than on the heap, so
//! their dispatch is keyed on the pool value instead of an object id.
//! All methods are immutable and produce fresh runtime strings;
//! predicates answer Int 0/1.

use crate::bytecode::Value;
use crate::vm::errors::RuntimeError;

use super::Dispatch;

pub const TYPE_NAME: &str = "String";

fn arity_error(method: &str) -> RuntimeError {
    RuntimeError::ArityMismatch {
        type_name: TYPE_NAME.to_string(),
        method: method.to_string(),
    }
}

fn check_arity(method: &str, args: &[Value], expected: usize) -> Result<(), RuntimeError> {
    if args.len() != expected {
        return Err(arity_error(method));
    }
    Ok(())
}

fn int_arg(value: Value) -> Result<i64, RuntimeError> {
    value
        .as_int()
        .ok_or(RuntimeError::WrongTag { expected: "integer" })
}

fn bool_value(flag: bool) -> Value {
    Value::Int(if flag { 1 } else { 0 })
}

fn split_parts(text: &str, delimiter: &str) -> Vec<String> {
    if delimiter.is_empty() {
        return vec![text.to_string()];
    }
    text.split(delimiter).map(str::to_string).collect()
}

/// Invoke a String method on a pool-backed value.
pub fn call_method(
    d: &mut Dispatch<'_>,
    receiver: Value,
    method: &str,
    args: &[Value],
) -> Result<Value, RuntimeError> {
    let text = d.pool_str(receiver)?.to_string();

    match method {
        "__str__" => {
            check_arity(method, args, 0)?;
            Ok(d.make_string(text))
        }
        "size" | "length" => {
            check_arity(method, args, 0)?;
            Ok(Value::Int(text.len() as i64))
        }
        "contains" => {
            check_arity(method, args, 1)?;
            let needle = d.string_content(args[0])?;
            Ok(bool_value(text.contains(&needle)))
        }
        "find" => {
            check_arity(method, args, 1)?;
            let needle = d.string_content(args[0])?;
            Ok(match text.find(&needle) {
                Some(index) => Value::Int(index as i64),
                None => Value::Int(-1),
            })
        }
        "substr" => {
            check_arity(method, args, 2)?;
            let start = int_arg(args[0])?.max(0) as usize;
            let length = int_arg(args[1])?.max(0) as usize;
            if start >= text.len() {
                return Ok(d.make_string(""));
            }
            let end = (start + length).min(text.len());
            let piece = String::from_utf8_lossy(&text.as_bytes()[start..end]).into_owned();
            Ok(d.make_string(piece))
        }
        "slice" => {
            check_arity(method, args, 2)?;
            let start = (int_arg(args[0])?.max(0) as usize).min(text.len());
            let end = (int_arg(args[1])?.max(0) as usize).min(text.len());
            if end <= start {
                return Ok(d.make_string(""));
            }
            let piece = String::from_utf8_lossy(&text.as_bytes()[start..end]).into_owned();
            Ok(d.make_string(piece))
        }
        "split" => {
            check_arity(method, args, 1)?;
            let delimiter = d.string_content(args[0])?;
            let parts = split_parts(&text, &delimiter);
            let items: Vec<Value> = parts.into_iter().map(|part| d.make_string(part)).collect();
            Ok(d.alloc(super::ObjectData::List(super::ListObject::new(items))))
        }
        "replace" => {
            check_arity(method, args, 2)?;
            let from = d.string_content(args[0])?;
            let to = d.string_content(args[1])?;
            if from.is_empty() {
                return Ok(d.make_string(text));
            }
            Ok(d.make_string(text.replace(&from, &to)))
        }
        "upper" => {
            check_arity(method, args, 0)?;
            Ok(d.make_string(text.to_uppercase()))
        }
        "lower" => {
            check_arity(method, args, 0)?;
            Ok(d.make_string(text.to_lowercase()))
        }
        "strip" => {
            check_arity(method, args, 0)?;
            Ok(d.make_string(text.trim()))
        }
        "startsWith" => {
            check_arity(method, args, 1)?;
            let prefix = d.string_content(args[0])?;
            Ok(bool_value(text.starts_with(&prefix)))
        }
        "endsWith" => {
            check_arity(method, args, 1)?;
            let suffix = d.string_content(args[0])?;
            Ok(bool_value(text.ends_with(&suffix)))
        }
        "at" => {
            check_arity(method, args, 1)?;
            let index = int_arg(args[0])?;
            if index < 0 || index as usize >= text.len() {
                return Err(RuntimeError::OutOfRange(
                    "String index out of range".into(),
                ));
            }
            let byte = text.as_bytes()[index as usize];
            Ok(d.make_string((byte as char).to_string()))
        }
        _ => Err(RuntimeError::UnknownMethod {
            type_name: TYPE_NAME.to_string(),
            method: method.to_string(),
        }),
    }
}

/// Member access on a String value; `length` is the read-only surface.
pub fn get_member(d: &mut Dispatch<'_>, receiver: Value, member: &str) -> Result<Value, RuntimeError> {
    let text = d.pool_str(receiver)?;
    match member {
        "length" => Ok(Value::Int(text.len() as i64)),
        _ => Err(RuntimeError::UnknownMember {
            type_name: TYPE_NAME.to_string(),
            member: member.to_string(),
        }),
    }
}

pub fn set_member(_d: &mut Dispatch<'_>, _receiver: Value, member: &str) -> RuntimeError {
    RuntimeError::ReadOnlyMember {
        type_name: TYPE_NAME.to_string(),
        member: member.to_string(),
    }
}
