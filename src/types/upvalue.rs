//! Upvalue cells
//!
//! Shared boxed storage for closure-captured locals. A captured outer
//! local becomes a cell; lambdas hold references to cells, which
//! decouples closure semantics from the stack slot lifetime.

use once_cell::sync::Lazy;

use crate::bytecode::Value;
use crate::vm::errors::RuntimeError;

use super::{Dispatch, ObjectData, TypeSpec};

#[derive(Debug, Default)]
pub struct UpvalueCell {
    pub value: Value,
}

fn str_cell(d: &mut Dispatch<'_>, id: u64) -> Result<String, RuntimeError> {
    let value = match &d.object(id)?.data {
        ObjectData::Upvalue(cell) => cell.value,
        _ => return Ok("[UpvalueCell]".to_string()),
    };
    Ok(format!("[UpvalueCell {}]", d.value_str(value)?))
}

static UPVALUE_CELL_TYPE: Lazy<TypeSpec> = Lazy::new(|| TypeSpec::new("UpvalueCell", str_cell));

pub fn upvalue_cell_type() -> &'static TypeSpec {
    &UPVALUE_CELL_TYPE
}
