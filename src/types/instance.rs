//! Script instances
//!
//! Every user-defined class shares one dispatcher; instances are
//! distinguished by their class index and module pin. Field reads and
//! writes go through the instance's own map — only `__str__` lands here.

use indexmap::IndexMap;
use once_cell::sync::Lazy;

use crate::bytecode::{ModulePin, Value};
use crate::vm::errors::RuntimeError;

use super::{Dispatch, ObjectData, TypeSpec};

#[derive(Debug)]
pub struct InstanceObject {
    pub class_index: usize,
    pub class_name: String,
    pub module: ModulePin,
    pub fields: IndexMap<String, Value>,
}

fn str_instance(d: &mut Dispatch<'_>, id: u64) -> Result<String, RuntimeError> {
    match &d.object(id)?.data {
        ObjectData::Instance(instance) => Ok(format!("{}#{}", instance.class_name, id)),
        _ => Err(RuntimeError::WrongTag { expected: "instance" }),
    }
}

static INSTANCE_TYPE: Lazy<TypeSpec> = Lazy::new(|| TypeSpec::new("Instance", str_instance));

pub fn instance_type() -> &'static TypeSpec {
    &INSTANCE_TYPE
}
