//! Crate-wide error aggregation
//!
//! Every pipeline stage has its own typed error; [`ScriptError`] is the
//! single channel they propagate through at the public API boundary.

use crate::bytecode::cpp::CppEmitError;
use crate::bytecode::serialize::FormatError;
use crate::compiler::CompileError;
use crate::frontend::{ImportError, LexError, ParseError};
use crate::vm::RuntimeError;

/// Any failure the language pipeline can produce.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("{0}")]
    Lex(#[from] LexError),
    #[error("{0}")]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Import(#[from] ImportError),
    #[error("{0}")]
    Compile(#[from] CompileError),
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
    #[error("{0}")]
    BytecodeFormat(#[from] FormatError),
    #[error("{0}")]
    CppEmit(#[from] CppEmitError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ScriptError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        ScriptError::Io {
            path: path.into(),
            source,
        }
    }
}
