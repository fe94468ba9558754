//! gscript — an embeddable, dynamically-typed scripting language
//!
//! Source compiles to stack bytecode which a frame-oriented VM executes;
//! hosts expose functions and modules through a registry, reload scripts
//! at runtime and run concurrent script tasks over a shared scheduler.
//!
//! # Example
//!
//! ```no_run
//! use gscript::{Runtime, Value};
//!
//! fn main() -> anyhow::Result<()> {
//!     let runtime = Runtime::new();
//!     runtime.load_source("fn main() { return 40 + 2; }")?;
//!     let result = runtime.call("main", &[])?;
//!     assert_eq!(result, Value::Int(42));
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod frontend;
pub mod host;
pub mod runtime;
pub mod types;
pub mod util;
pub mod vm;

// Re-exports
pub use anyhow::{Context, Result};

pub use bytecode::serialize::{deserialize_module_text, serialize_module_text};
pub use bytecode::{CompiledModule, Instruction, ModulePin, OpCode, Value};
pub use compiler::{compile_source, compile_source_file};
pub use error::ScriptError;
pub use host::{HostCall, HostRegistry};
pub use runtime::Runtime;
pub use vm::{ExecutionContext, RunState, RuntimeError, VirtualMachine};

use std::path::Path;
use tracing::{debug, info};

/// Language version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Language name
pub const NAME: &str = "gscript";

/// Compile and run in-memory source, invoking `main`.
pub fn run(source: &str) -> Result<Value> {
    debug!("running inline source");
    let runtime = Runtime::new();
    runtime.load_source(source)?;
    Ok(runtime.call("main", &[])?)
}

/// Compile and run a script file, invoking `main`.
pub fn run_file(path: &Path) -> Result<Value> {
    debug!(path = %path.display(), "running file");
    let runtime = Runtime::new();
    runtime
        .load_source_file(path)
        .with_context(|| format!("Failed to load script: {}", path.display()))?;
    Ok(runtime.call("main", &[])?)
}

/// Compile a source file to bytecode text.
pub fn build_bytecode(source_path: &Path, output_path: &Path) -> Result<()> {
    debug!(source = %source_path.display(), output = %output_path.display(), "building bytecode");
    let module = compile_source_file(source_path, &[])
        .with_context(|| format!("Failed to compile: {}", source_path.display()))?;
    let text = serialize_module_text(&module);
    std::fs::write(output_path, text)
        .with_context(|| format!("Failed to write bytecode: {}", output_path.display()))?;
    Ok(())
}

/// Load a bytecode text file and invoke `main`.
pub fn run_bytecode_file(path: &Path) -> Result<Value> {
    let runtime = Runtime::new();
    runtime
        .load_bytecode_file(path)
        .with_context(|| format!("Failed to load bytecode: {}", path.display()))?;
    Ok(runtime.call("main", &[])?)
}

/// Print a compiled module's sections for debugging.
pub fn dump_bytecode(path: &Path) -> Result<()> {
    let module = compile_source_file(path, &[])
        .with_context(|| format!("Failed to compile: {}", path.display()))?;

    info!("Bytecode dump: {}", path.display());
    info!("Constants: {}", module.constants.len());
    for (index, constant) in module.constants.iter().enumerate() {
        info!("[{:04}] {:?}", index, constant);
    }

    info!("Strings: {}", module.strings.len());
    for (index, text) in module.strings.iter().enumerate() {
        info!("[{:04}] {:?}", index, text);
    }

    info!("Functions: {}", module.functions.len());
    for (index, function) in module.functions.iter().enumerate() {
        info!(
            "Function #{}: {} params={} locals={} stack={}",
            index,
            function.name,
            function.params.len(),
            function.local_count,
            function.stack_slot_count
        );
        for (ip, ins) in function.code.iter().enumerate() {
            info!("  [{:04}] {} {} {}", ip, ins.op, ins.a, ins.b);
        }
    }

    info!("Classes: {}", module.classes.len());
    for class in &module.classes {
        info!(
            "Class {} base={} attrs={} methods={}",
            class.name,
            class.base_class_index,
            class.attributes.len(),
            class.methods.len()
        );
    }

    info!("Globals: {}", module.globals.len());
    for global in &module.globals {
        info!("  {} = {:?}", global.name, global.initial_value);
    }

    Ok(())
}
