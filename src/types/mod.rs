//! Type system
//!
//! Uniform dispatch for every heap object. Each built-in type owns an
//! attribute table mapping names to methods (with declared arity) or
//! members (getter plus optional setter); [`TypeSpec::call_method`],
//! [`TypeSpec::get_member`] and [`TypeSpec::set_member`] resolve against
//! that table and fail with a name error otherwise.
//!
//! Built-in methods never see the execution context directly. They
//! receive a [`Dispatch`] handle that can allocate runtime strings,
//! recursively stringify values (with `[Circular]` protection) and reach
//! the object heap.

pub mod callable;
pub mod dict;
pub mod file;
pub mod instance;
pub mod list;
pub mod module;
pub mod path;
pub mod string;
pub mod tuple;
pub mod upvalue;


use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

use crate::bytecode::{ModulePin, Value};
use crate::vm::errors::RuntimeError;

pub use callable::{ClassObject, FunctionObject, LambdaObject, NativeFunctionObject};
pub use dict::{DictEntry, DictKey, DictObject};
pub use file::FileObject;
pub use instance::InstanceObject;
pub use list::ListObject;
pub use module::ModuleObject;
pub use path::PathObject;
pub use tuple::TupleObject;
pub use upvalue::UpvalueCell;

/// Process-wide object id source. Ids are non-zero and stable for the
/// lifetime of the context that admitted the object.
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Payload of a heap object.
#[derive(Debug)]
pub enum ObjectData {
    List(ListObject),
    Dict(DictObject),
    Tuple(TupleObject),
    Function(FunctionObject),
    Lambda(LambdaObject),
    Native(NativeFunctionObject),
    Module(ModuleObject),
    Instance(InstanceObject),
    Class(ClassObject),
    Upvalue(UpvalueCell),
    File(FileObject),
    Path(PathObject),
}

/// A heap-resident entity with its unique id.
#[derive(Debug)]
pub struct HeapObject {
    pub id: u64,
    pub data: ObjectData,
}

/// The type dispatcher an object answers to.
pub fn type_spec_of(data: &ObjectData) -> &'static TypeSpec {
    match data {
        ObjectData::List(_) => list::list_type(),
        ObjectData::Dict(_) => dict::dict_type(),
        ObjectData::Tuple(_) => tuple::tuple_type(),
        ObjectData::Function(_) => callable::function_type(),
        ObjectData::Lambda(_) => callable::lambda_type(),
        ObjectData::Native(_) => callable::native_function_type(),
        ObjectData::Module(_) => module::module_type(),
        ObjectData::Instance(_) => instance::instance_type(),
        ObjectData::Class(_) => callable::class_type(),
        ObjectData::Upvalue(_) => upvalue::upvalue_cell_type(),
        ObjectData::File(_) => file::file_type(),
        ObjectData::Path(_) => path::path_type(),
    }
}

pub type MethodFn = fn(&mut Dispatch<'_>, u64, &[Value]) -> Result<Value, RuntimeError>;
pub type GetterFn = fn(&mut Dispatch<'_>, u64) -> Result<Value, RuntimeError>;
pub type SetterFn = fn(&mut Dispatch<'_>, u64, Value) -> Result<Value, RuntimeError>;
pub type StrFn = fn(&mut Dispatch<'_>, u64) -> Result<String, RuntimeError>;

/// One attribute: a method with declared arity, or a member with a getter
/// and an optional setter. `arity: None` marks a variadic method that
/// validates its own arguments.
pub struct AttributeEntry {
    pub arity: Option<usize>,
    pub method: Option<MethodFn>,
    pub getter: Option<GetterFn>,
    pub setter: Option<SetterFn>,
}

/// Attribute table plus stringification hook of one built-in type.
pub struct TypeSpec {
    pub name: &'static str,
    str_fn: StrFn,
    attributes: IndexMap<&'static str, AttributeEntry>,
}

fn method_dunder_str(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    let text = d.object_str(id)?;
    Ok(d.make_string(text))
}

impl TypeSpec {
    pub fn new(name: &'static str, str_fn: StrFn) -> Self {
        let mut spec = Self {
            name,
            str_fn,
            attributes: IndexMap::new(),
        };
        spec.register_method("__str__", 0, method_dunder_str);
        spec
    }

    pub fn register_method(&mut self, name: &'static str, arity: usize, method: MethodFn) {
        self.attributes.insert(
            name,
            AttributeEntry {
                arity: Some(arity),
                method: Some(method),
                getter: None,
                setter: None,
            },
        );
    }

    pub fn register_variadic_method(&mut self, name: &'static str, method: MethodFn) {
        self.attributes.insert(
            name,
            AttributeEntry {
                arity: None,
                method: Some(method),
                getter: None,
                setter: None,
            },
        );
    }

    pub fn register_member(
        &mut self,
        name: &'static str,
        getter: GetterFn,
        setter: Option<SetterFn>,
    ) {
        self.attributes.insert(
            name,
            AttributeEntry {
                arity: None,
                method: None,
                getter: Some(getter),
                setter,
            },
        );
    }

    pub fn call_method(
        &self,
        d: &mut Dispatch<'_>,
        id: u64,
        method: &str,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let unknown = || RuntimeError::UnknownMethod {
            type_name: self.name.to_string(),
            method: method.to_string(),
        };
        let entry = self.attributes.get(method).ok_or_else(unknown)?;
        let invoke = entry.method.ok_or_else(unknown)?;
        if let Some(arity) = entry.arity {
            if args.len() != arity {
                return Err(RuntimeError::ArityMismatch {
                    type_name: self.name.to_string(),
                    method: method.to_string(),
                });
            }
        }
        invoke(d, id, args)
    }

    pub fn get_member(&self, d: &mut Dispatch<'_>, id: u64, member: &str) -> Result<Value, RuntimeError> {
        match self.attributes.get(member).and_then(|e| e.getter) {
            Some(getter) => getter(d, id),
            None => Err(RuntimeError::UnknownMember {
                type_name: self.name.to_string(),
                member: member.to_string(),
            }),
        }
    }

    pub fn set_member(
        &self,
        d: &mut Dispatch<'_>,
        id: u64,
        member: &str,
        value: Value,
    ) -> Result<Value, RuntimeError> {
        match self.attributes.get(member).and_then(|e| e.setter) {
            Some(setter) => setter(d, id, value),
            None => Err(RuntimeError::ReadOnlyMember {
                type_name: self.name.to_string(),
                member: member.to_string(),
            }),
        }
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.attributes
            .get(method)
            .map(|e| e.method.is_some())
            .unwrap_or(false)
    }
}

/// Mutable view over the pieces of an execution context that built-in
/// methods need: the object heap, the runtime string pool and the
/// stringification recursion guard.
pub struct Dispatch<'a> {
    pub heap: &'a mut HashMap<u64, HeapObject>,
    pub strings: &'a mut Vec<String>,
    pub visiting: &'a mut HashSet<u64>,
}

impl<'a> Dispatch<'a> {
    /// Admit an object to the heap and hand back its reference.
    pub fn alloc(&mut self, data: ObjectData) -> Value {
        let id = next_object_id();
        self.heap.insert(id, HeapObject { id, data });
        Value::Ref(id)
    }

    /// Intern a runtime string and return its pool-indexed value.
    pub fn make_string(&mut self, text: impl Into<String>) -> Value {
        self.strings.push(text.into());
        Value::Str((self.strings.len() - 1) as i64)
    }

    pub fn object(&self, id: u64) -> Result<&HeapObject, RuntimeError> {
        self.heap.get(&id).ok_or(RuntimeError::ObjectNotFound)
    }

    pub fn object_mut(&mut self, id: u64) -> Result<&mut HeapObject, RuntimeError> {
        self.heap.get_mut(&id).ok_or(RuntimeError::ObjectNotFound)
    }

    /// Resolve a `Str`-tagged value against the runtime pool.
    pub fn pool_str(&self, value: Value) -> Result<&str, RuntimeError> {
        let index = value
            .as_str_index()
            .ok_or(RuntimeError::WrongTag { expected: "string" })?;
        self.strings
            .get(index as usize)
            .map(String::as_str)
            .ok_or(RuntimeError::StringIndexOutOfRange)
    }

    /// String content of a value: pool text for strings, the rendered
    /// form for everything else.
    pub fn string_content(&mut self, value: Value) -> Result<String, RuntimeError> {
        match value {
            Value::Str(_) => Ok(self.pool_str(value)?.to_string()),
            other => self.value_str(other),
        }
    }

    /// Human-readable rendering of any value. Heap objects delegate to
    /// their type's `__str__`; re-entering an object mid-render yields
    /// the literal `[Circular]`.
    pub fn value_str(&mut self, value: Value) -> Result<String, RuntimeError> {
        match value {
            Value::Nil => Ok("nil".to_string()),
            Value::Int(v) => Ok(v.to_string()),
            Value::Str(_) => Ok(self.pool_str(value)?.to_string()),
            Value::Function(_) => Ok("[Function]".to_string()),
            Value::Class(_) => Ok("[Class]".to_string()),
            Value::Module(_) => Ok("[Module]".to_string()),
            Value::Ref(id) => {
                if self.visiting.contains(&id) {
                    return Ok("[Circular]".to_string());
                }
                self.visiting.insert(id);
                let result = self.object_str(id);
                self.visiting.remove(&id);
                result
            }
        }
    }

    /// Render a heap object through its type hook.
    pub fn object_str(&mut self, id: u64) -> Result<String, RuntimeError> {
        let spec = type_spec_of(&self.object(id)?.data);
        (spec.str_fn)(self, id)
    }

    /// Collapse compile-time tags into heap objects bound to `pin`.
    ///
    /// Function/Class/Module values leaving a constant pool (or a stored
    /// slot that still carries the compile-time tag) become first-class
    /// heap objects here, so downstream code only ever handles `Ref`.
    /// With `normalize_strings`, string constants migrate from the
    /// module's compile-time pool into the runtime pool.
    pub fn normalize_value(
        &mut self,
        pin: &ModulePin,
        value: Value,
        normalize_strings: bool,
    ) -> Result<Value, RuntimeError> {
        match value {
            Value::Function(index) => {
                if index < 0 || index as usize >= pin.functions.len() {
                    return Err(RuntimeError::FunctionIndexOutOfRange);
                }
                Ok(self.alloc(ObjectData::Function(FunctionObject {
                    function_index: index as usize,
                    module: pin.clone(),
                })))
            }
            Value::Class(index) => {
                let class = pin
                    .classes
                    .get(index.max(0) as usize)
                    .filter(|_| index >= 0)
                    .ok_or(RuntimeError::ClassIndexOutOfRange)?;
                Ok(self.alloc(ObjectData::Class(ClassObject {
                    class_name: class.name.clone(),
                    class_index: index as usize,
                    module: pin.clone(),
                })))
            }
            Value::Module(name_index) => {
                let name = pin
                    .strings
                    .get(name_index.max(0) as usize)
                    .filter(|_| name_index >= 0)
                    .ok_or(RuntimeError::StringIndexOutOfRange)?
                    .clone();
                Ok(self.alloc(ObjectData::Module(ModuleObject::script(name, pin.clone()))))
            }
            Value::Str(index) if normalize_strings => {
                let content = pin
                    .strings
                    .get(index.max(0) as usize)
                    .filter(|_| index >= 0)
                    .ok_or(RuntimeError::StringIndexOutOfRange)?
                    .clone();
                Ok(self.make_string(content))
            }
            other => Ok(other),
        }
    }

    /// Type name of a value; script instances report their class name.
    pub fn type_name(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Str(_) => "string".to_string(),
            Value::Function(_) => "function".to_string(),
            Value::Class(_) => "class".to_string(),
            Value::Module(_) => "module".to_string(),
            Value::Ref(id) => match self.heap.get(&id) {
                Some(object) => match &object.data {
                    ObjectData::Instance(instance) => instance.class_name.clone(),
                    data => type_spec_of(data).name.to_string(),
                },
                None => "ref".to_string(),
            },
        }
    }
}
