//! Execution contexts and frames
//!
//! An [`ExecutionContext`] is the complete state of one coroutine: frame
//! stack, runtime string pool, object heap, module-init bookkeeping and
//! scheduler state. One context is owned by exactly one coroutine; the VM
//! creates one per top-level call and destroys it after the delete-hook
//! sweep.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::bytecode::{ModulePin, Value};
use crate::types::{Dispatch, HeapObject};

/// Scheduler-visible state of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Suspended,
    Completed,
}

/// One activation of a function call.
#[derive(Debug)]
pub struct Frame {
    pub function_index: usize,
    pub ip: usize,
    pub module: ModulePin,
    pub locals: Vec<Value>,
    /// Capture cells for lambda activations.
    pub captures: Vec<Value>,
    pub stack: Vec<Value>,
    /// Constructor protocol: on `Return`, discard the returned value and
    /// deliver `constructor_instance` instead.
    pub replace_return_with_instance: bool,
    pub constructor_instance: Value,
    /// The frame's return value is dropped instead of being pushed onto
    /// the caller (module init and delete-hook frames).
    pub discard_return: bool,
    /// Marks a `__module_init__` activation; completion flips the pin
    /// from in-progress to initialized.
    pub module_init: bool,
}

/// Per-coroutine interpreter state.
pub struct ExecutionContext {
    pub frames: Vec<Frame>,
    /// Runtime string pool, seeded from the entry module's strings and
    /// appended to by runtime string construction.
    pub string_pool: Vec<String>,
    pub heap: HashMap<u64, HeapObject>,
    /// Module-level runtime globals, keyed by pin identity.
    pub module_globals: HashMap<usize, HashMap<String, Value>>,
    /// Pins whose `__module_init__` has completed.
    pub initialized_modules: HashSet<usize>,
    /// Pins whose `__module_init__` is on the frame stack.
    pub init_in_progress: HashSet<usize>,
    /// Module objects created by `loadModule`, by module name.
    pub module_cache: HashMap<String, Value>,
    pub return_value: Value,
    pub delete_hooks_ran: bool,
    pub state: RunState,
    /// Earliest wake-up for a suspended coroutine.
    pub wake_time: Option<Instant>,
    /// Object ids currently being stringified (`[Circular]` guard).
    pub visiting: HashSet<u64>,
}

impl ExecutionContext {
    pub fn new(entry_module: &ModulePin) -> Self {
        Self {
            frames: Vec::new(),
            string_pool: entry_module.strings.clone(),
            heap: HashMap::new(),
            module_globals: HashMap::new(),
            initialized_modules: HashSet::new(),
            init_in_progress: HashSet::new(),
            module_cache: HashMap::new(),
            return_value: Value::Nil,
            delete_hooks_ran: false,
            state: RunState::Running,
            wake_time: None,
            visiting: HashSet::new(),
        }
    }

    /// Borrow the heap/string/visiting triple for type dispatch.
    pub fn dispatch(&mut self) -> Dispatch<'_> {
        Dispatch {
            heap: &mut self.heap,
            strings: &mut self.string_pool,
            visiting: &mut self.visiting,
        }
    }
}
