//! Dict objects
//!
//! Value-keyed mapping with insertion-order traversal. Keys compare by
//! payload (strings by content, references by object identity); `key_at`
//! and `value_at` walk insertion order, and `del` preserves the order of
//! the remaining entries.

use indexmap::IndexMap;
use once_cell::sync::Lazy;

use crate::bytecode::Value;
use crate::vm::errors::RuntimeError;

use super::{Dispatch, ObjectData, TypeSpec};

/// Hashable identity of a dict key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    Nil,
    Int(i64),
    Str(String),
    Ref(u64),
    Function(i64),
    Class(i64),
    Module(i64),
}

impl DictKey {
    /// Derive the key identity of a value. Strings key by content, so the
    /// pool is consulted through the dispatch handle.
    pub fn from_value(d: &Dispatch<'_>, value: Value) -> Result<DictKey, RuntimeError> {
        Ok(match value {
            Value::Nil => DictKey::Nil,
            Value::Int(v) => DictKey::Int(v),
            Value::Str(_) => DictKey::Str(d.pool_str(value)?.to_string()),
            Value::Ref(id) => DictKey::Ref(id),
            Value::Function(v) => DictKey::Function(v),
            Value::Class(v) => DictKey::Class(v),
            Value::Module(v) => DictKey::Module(v),
        })
    }
}

/// Stored entry: the original key value (for `key_at`) plus the mapped
/// value.
#[derive(Debug, Clone, Copy)]
pub struct DictEntry {
    pub key: Value,
    pub value: Value,
}

#[derive(Debug, Default)]
pub struct DictObject {
    pub entries: IndexMap<DictKey, DictEntry>,
}

impl DictObject {
    pub fn new(entries: IndexMap<DictKey, DictEntry>) -> Self {
        Self { entries }
    }
}

fn require_dict<'a>(d: &'a Dispatch<'_>, id: u64) -> Result<&'a DictObject, RuntimeError> {
    match &d.object(id)?.data {
        ObjectData::Dict(dict) => Ok(dict),
        _ => Err(RuntimeError::WrongTag { expected: "dict" }),
    }
}

fn require_dict_mut<'a>(
    d: &'a mut Dispatch<'_>,
    id: u64,
) -> Result<&'a mut DictObject, RuntimeError> {
    match &mut d.object_mut(id)?.data {
        ObjectData::Dict(dict) => Ok(dict),
        _ => Err(RuntimeError::WrongTag { expected: "dict" }),
    }
}

fn method_set(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    let key = DictKey::from_value(d, args[0])?;
    let dict = require_dict_mut(d, id)?;
    dict.entries.insert(
        key,
        DictEntry {
            key: args[0],
            value: args[1],
        },
    );
    Ok(args[1])
}

fn method_get(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    let key = DictKey::from_value(d, args[0])?;
    let dict = require_dict(d, id)?;
    Ok(dict
        .entries
        .get(&key)
        .map(|entry| entry.value)
        .unwrap_or(Value::Nil))
}

fn method_del(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    let key = DictKey::from_value(d, args[0])?;
    let dict = require_dict_mut(d, id)?;
    Ok(dict
        .entries
        .shift_remove(&key)
        .map(|entry| entry.value)
        .unwrap_or(Value::Nil))
}

fn method_size(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Int(require_dict(d, id)?.entries.len() as i64))
}

fn index_arg(args: &[Value]) -> Result<i64, RuntimeError> {
    args[0]
        .as_int()
        .ok_or(RuntimeError::WrongTag { expected: "integer" })
}

fn method_key_at(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    let index = index_arg(args)?;
    let dict = require_dict(d, id)?;
    if index < 0 || index as usize >= dict.entries.len() {
        return Ok(Value::Nil);
    }
    Ok(dict.entries[index as usize].key)
}

fn method_value_at(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    let index = index_arg(args)?;
    let dict = require_dict(d, id)?;
    if index < 0 || index as usize >= dict.entries.len() {
        return Ok(Value::Nil);
    }
    Ok(dict.entries[index as usize].value)
}

fn member_length(d: &mut Dispatch<'_>, id: u64) -> Result<Value, RuntimeError> {
    Ok(Value::Int(require_dict(d, id)?.entries.len() as i64))
}

fn str_dict(d: &mut Dispatch<'_>, id: u64) -> Result<String, RuntimeError> {
    let entries: Vec<DictEntry> = require_dict(d, id)?.entries.values().copied().collect();
    let mut out = String::from("{");
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&d.value_str(entry.key)?);
        out.push_str(": ");
        out.push_str(&d.value_str(entry.value)?);
    }
    out.push('}');
    Ok(out)
}

static DICT_TYPE: Lazy<TypeSpec> = Lazy::new(|| {
    let mut spec = TypeSpec::new("Dict", str_dict);
    spec.register_method("set", 2, method_set);
    spec.register_method("get", 1, method_get);
    spec.register_method("del", 1, method_del);
    spec.register_method("size", 0, method_size);
    spec.register_method("key_at", 1, method_key_at);
    spec.register_method("value_at", 1, method_value_at);
    spec.register_member("length", member_length, None);
    spec
});

pub fn dict_type() -> &'static TypeSpec {
    &DICT_TYPE
}
