//! Runtime errors
//!
//! Everything the interpreter, the type dispatchers and host callbacks can
//! raise at execution time. Errors abort the current coroutine; spawned
//! coroutines surface theirs on `Await`.

/// Runtime error
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("Stack underflow")]
    StackUnderflow,
    #[error("Not enough arguments on stack")]
    NotEnoughArguments,
    #[error("Value is not {expected}")]
    WrongTag { expected: &'static str },
    #[error("String index out of range")]
    StringIndexOutOfRange,
    #[error("Constant index out of range")]
    ConstantIndexOutOfRange,
    #[error("Local slot out of range")]
    LocalIndexOutOfRange,
    #[error("Instruction pointer out of range")]
    InstructionPointerOutOfRange,
    #[error("Integer division by zero")]
    DivisionByZero,
    #[error("Unknown name: {0}")]
    UnknownName(String),
    #[error("Unknown class attribute: {0}")]
    UnknownAttribute(String),
    #[error("Unknown {type_name} method: {method}")]
    UnknownMethod { type_name: String, method: String },
    #[error("Unknown {type_name} member: {member}")]
    UnknownMember { type_name: String, member: String },
    #[error("Unknown or read-only {type_name} member: {member}")]
    ReadOnlyMember { type_name: String, member: String },
    #[error("{type_name}.{method} argument count mismatch")]
    ArityMismatch { type_name: String, method: String },
    #[error("Function argument count mismatch: {0}")]
    FunctionArityMismatch(String),
    #[error("Script function not found: {0}")]
    FunctionNotFound(String),
    #[error("Class index out of range")]
    ClassIndexOutOfRange,
    #[error("Function index out of range")]
    FunctionIndexOutOfRange,
    #[error("Class is missing required constructor __new__: {0}")]
    MissingConstructor(String),
    #[error("Attempted to call a non-callable value of type {0}")]
    NotCallable(String),
    #[error("Object reference not found")]
    ObjectNotFound,
    #[error("Method target is not an object reference")]
    NotAnObject,
    #[error("{0}")]
    OutOfRange(String),
    #[error("Task handle not found")]
    TaskHandleNotFound,
    #[error("Module initialization cycle detected: {0}")]
    ModuleInitCycle(String),
    #[error("Condition value cannot be tested for truth: {0}")]
    BadCondition(String),
    #[error("{0}")]
    Host(String),
}

impl RuntimeError {
    pub fn host(message: impl Into<String>) -> Self {
        RuntimeError::Host(message.into())
    }
}
