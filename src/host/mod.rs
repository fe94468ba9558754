//! Host registry
//!
//! Named global functions plus named host modules that contain functions.
//! Script code reaches them two ways: directly by name through the
//! `CallHost` opcode, or as first-class values — `LoadName` on an
//! unresolved name asks [`HostRegistry::resolve`] to materialize a
//! NativeFunction or Module object on demand.
//!
//! Host callbacks receive a [`HostCall`]: object/string services plus the
//! module loader, never the raw execution context. Callbacks must not
//! retain object references beyond the call; values are copy-safe and can
//! be re-resolved through the handle.

pub mod globals;
pub mod os;

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::bytecode::Value;
use crate::runtime::loader::ModuleLoader;
use crate::types::{Dispatch, ModuleObject, NativeFunctionObject, ObjectData};
use crate::vm::errors::RuntimeError;

/// A host callback.
pub type HostFunction =
    Arc<dyn Fn(&mut HostCall<'_>, &[Value]) -> Result<Value, RuntimeError> + Send + Sync>;

/// Per-invocation handle host callbacks operate through.
pub struct HostCall<'a> {
    pub d: Dispatch<'a>,
    pub loader: &'a ModuleLoader,
    /// Per-context cache of module objects created by `loadModule`.
    pub module_cache: &'a mut HashMap<String, Value>,
}

impl<'a> HostCall<'a> {
    pub fn value_str(&mut self, value: Value) -> Result<String, RuntimeError> {
        self.d.value_str(value)
    }

    pub fn make_string(&mut self, text: impl Into<String>) -> Value {
        self.d.make_string(text)
    }

    pub fn type_name(&self, value: Value) -> String {
        self.d.type_name(value)
    }

    pub fn object_id(&self, value: Value) -> Result<u64, RuntimeError> {
        let id = value.as_ref_id().ok_or(RuntimeError::WrongTag {
            expected: "object reference",
        })?;
        self.d.object(id)?;
        Ok(id)
    }
}

enum BuiltinEntry {
    Function(HostFunction),
    Module(IndexMap<String, HostFunction>),
}

/// Registry of host functions and host modules.
#[derive(Default)]
pub struct HostRegistry {
    builtins: IndexMap<String, BuiltinEntry>,
}

impl HostRegistry {
    /// An empty registry. Most embedders want [`HostRegistry::with_defaults`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the global functions (`print`, `printf`,
    /// `str`, `type`, `id`, `loadModule`) and the `os`/`system` modules.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        globals::bind_global_functions(&mut registry);
        os::register_os_module(&mut registry);
        registry
    }

    /// Bind a global host function.
    pub fn bind<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: Fn(&mut HostCall<'_>, &[Value]) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    {
        self.builtins
            .insert(name.into(), BuiltinEntry::Function(Arc::new(callback)));
    }

    /// Declare a host module (idempotent).
    pub fn define_module(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !matches!(self.builtins.get(&name), Some(BuiltinEntry::Module(_))) {
            self.builtins
                .insert(name, BuiltinEntry::Module(IndexMap::new()));
        }
    }

    /// Bind a function inside a host module.
    pub fn bind_module_function<F>(
        &mut self,
        module: impl Into<String>,
        export: impl Into<String>,
        callback: F,
    ) where
        F: Fn(&mut HostCall<'_>, &[Value]) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    {
        let module = module.into();
        self.define_module(module.clone());
        if let Some(BuiltinEntry::Module(exports)) = self.builtins.get_mut(&module) {
            exports.insert(export.into(), Arc::new(callback));
        }
    }

    pub fn has(&self, name: &str) -> bool {
        matches!(self.builtins.get(name), Some(BuiltinEntry::Function(_)))
    }

    pub fn has_module(&self, name: &str) -> bool {
        matches!(self.builtins.get(name), Some(BuiltinEntry::Module(_)))
    }

    /// Call a global host function by name.
    pub fn invoke(
        &self,
        name: &str,
        call: &mut HostCall<'_>,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        match self.builtins.get(name) {
            Some(BuiltinEntry::Function(callback)) => callback(call, args),
            Some(BuiltinEntry::Module(_)) => {
                Err(RuntimeError::host(format!("Builtin is not a function: {}", name)))
            }
            None => Err(RuntimeError::host(format!("Host function not found: {}", name))),
        }
    }

    /// Materialize a builtin as a first-class value: functions become
    /// NativeFunction objects, modules become Module objects with their
    /// exports resolved eagerly. Resolution happens on demand — nothing
    /// is created until a script observes the name.
    pub fn resolve(&self, name: &str, d: &mut Dispatch<'_>) -> Option<Value> {
        match self.builtins.get(name)? {
            BuiltinEntry::Function(callback) => {
                Some(d.alloc(ObjectData::Native(NativeFunctionObject {
                    name: name.to_string(),
                    callback: callback.clone(),
                })))
            }
            BuiltinEntry::Module(exports) => {
                let mut module = ModuleObject::host(name);
                let name_value = d.make_string(name);
                module.exports.insert("__name__".to_string(), name_value);
                let entries: Vec<(String, HostFunction)> = exports
                    .iter()
                    .map(|(export, callback)| (export.clone(), callback.clone()))
                    .collect();
                for (export, callback) in entries {
                    let value = d.alloc(ObjectData::Native(NativeFunctionObject {
                        name: export.clone(),
                        callback,
                    }));
                    module.exports.insert(export, value);
                }
                Some(d.alloc(ObjectData::Module(module)))
            }
        }
    }
}
