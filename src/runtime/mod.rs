//! Runtime façade
//!
//! Owns the compiled module slot (swapped atomically on reload), the host
//! registry, the module loader and the shared task system. `call` takes a
//! snapshot of the current module, so hot reload never yanks bytecode out
//! from under a running VM — frames keep their own pin.

pub mod loader;
pub mod tasks;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bytecode::serialize::{deserialize_module_text, serialize_module_text};
use crate::bytecode::{CompiledModule, ModulePin, Value};
use crate::compiler::{compile_source, compile_source_file};
use crate::error::ScriptError;
use crate::host::HostRegistry;
use crate::vm::VirtualMachine;

use loader::ModuleLoader;
use tasks::{default_worker_count, TaskSystem};

/// Embedding entry point: load a module, call entry points, reload.
pub struct Runtime {
    module: Mutex<ModulePin>,
    hosts: Arc<HostRegistry>,
    tasks: Arc<TaskSystem>,
    loader: Arc<ModuleLoader>,
    last_error: Mutex<Option<String>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Runtime with the default host surface (`print`, `str`, `os`, …).
    pub fn new() -> Self {
        Self::with_host_registry(HostRegistry::with_defaults())
    }

    /// Runtime with a caller-assembled host registry. Bind custom host
    /// functions on the registry before handing it over.
    pub fn with_host_registry(hosts: HostRegistry) -> Self {
        Self {
            module: Mutex::new(Arc::new(CompiledModule::default())),
            hosts: Arc::new(hosts),
            tasks: Arc::new(TaskSystem::new(default_worker_count())),
            loader: Arc::new(ModuleLoader::new()),
            last_error: Mutex::new(None),
        }
    }

    pub fn add_search_path(&self, path: impl Into<PathBuf>) {
        self.loader.add_search_path(path);
    }

    /// Most recent error message, kept for UI retrieval.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn record_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }

    fn install(&self, module: CompiledModule) {
        let mut slot = self.module.lock();
        *slot = Arc::new(module);
    }

    /// Current module snapshot.
    pub fn module(&self) -> ModulePin {
        self.module.lock().clone()
    }

    /// Compile a source file and swap it in. On failure the previous
    /// module stays installed.
    pub fn load_source_file(&self, path: impl AsRef<Path>) -> Result<(), ScriptError> {
        let path = path.as_ref();
        let mut search_paths = self.loader.search_paths();
        if let Some(parent) = path.parent() {
            search_paths.push(parent.to_path_buf());
        }

        match compile_source_file(path, &search_paths) {
            Ok(module) => {
                info!(path = %path.display(), "module loaded");
                self.install(module);
                Ok(())
            }
            Err(error) => {
                self.record_error(error.to_string());
                Err(error)
            }
        }
    }

    /// Compile in-memory source and swap it in.
    pub fn load_source(&self, source: &str) -> Result<(), ScriptError> {
        match compile_source(source) {
            Ok(module) => {
                self.install(module);
                Ok(())
            }
            Err(error) => {
                self.record_error(error.to_string());
                Err(error)
            }
        }
    }

    /// Load a serialized bytecode text file.
    pub fn load_bytecode_file(&self, path: impl AsRef<Path>) -> Result<(), ScriptError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScriptError::io(path.display().to_string(), e))?;
        match deserialize_module_text(&text) {
            Ok(module) => {
                info!(path = %path.display(), "bytecode loaded");
                self.install(module);
                Ok(())
            }
            Err(error) => {
                let error = ScriptError::from(error);
                self.record_error(error.to_string());
                Err(error)
            }
        }
    }

    /// Recompile and atomically replace the module. Already-running VMs
    /// keep their snapshot.
    pub fn hot_reload_source(&self, path: impl AsRef<Path>) -> Result<(), ScriptError> {
        debug!(path = %path.as_ref().display(), "hot reload");
        self.load_source_file(path)
    }

    /// Serialize the current module to a bytecode text file.
    pub fn save_bytecode(&self, path: impl AsRef<Path>) -> Result<(), ScriptError> {
        let path = path.as_ref();
        let snapshot = self.module();
        std::fs::write(path, serialize_module_text(&snapshot))
            .map_err(|e| ScriptError::io(path.display().to_string(), e))
    }

    fn vm(&self) -> VirtualMachine {
        VirtualMachine::new(
            self.module(),
            self.hosts.clone(),
            self.tasks.clone(),
            self.loader.clone(),
        )
    }

    /// Invoke a named entry point against the current module snapshot.
    pub fn call(&self, function: &str, args: &[Value]) -> Result<Value, ScriptError> {
        match self.vm().run_function(function, args) {
            Ok(value) => Ok(value),
            Err(error) => {
                self.record_error(format!("{} [function: {}]", error, function));
                Err(ScriptError::Runtime(error))
            }
        }
    }

    /// Invoke a named entry point and render its result as a host string.
    /// String results come back as their text; objects render through
    /// their `__str__` hooks.
    pub fn call_rendered(&self, function: &str, args: &[Value]) -> Result<String, ScriptError> {
        match self.vm().run_function_rendered(function, args) {
            Ok(text) => Ok(text),
            Err(error) => {
                self.record_error(format!("{} [function: {}]", error, function));
                Err(ScriptError::Runtime(error))
            }
        }
    }
}
