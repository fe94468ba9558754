//! File objects
//!
//! Opened through the host `os.open`. A closed file keeps its path but
//! drops the handle; every operation on it reports an error except
//! `isOpen` and `close`.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use once_cell::sync::Lazy;

use crate::bytecode::Value;
use crate::vm::errors::RuntimeError;

use super::{Dispatch, ObjectData, TypeSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
    ReadWrite,
}

impl FileMode {
    pub fn parse(mode: &str) -> Result<FileMode, RuntimeError> {
        match mode {
            "r" | "read" => Ok(FileMode::Read),
            "w" | "write" => Ok(FileMode::Write),
            "a" | "append" => Ok(FileMode::Append),
            "rw" | "readwrite" => Ok(FileMode::ReadWrite),
            other => Err(RuntimeError::host(format!("Invalid file mode: {}", other))),
        }
    }
}

#[derive(Debug)]
pub struct FileObject {
    pub path: String,
    pub mode: FileMode,
    handle: Option<std::fs::File>,
}

impl FileObject {
    pub fn open(path: &str, mode: FileMode) -> Result<FileObject, RuntimeError> {
        let mut options = OpenOptions::new();
        match mode {
            FileMode::Read => options.read(true),
            FileMode::Write => options.write(true).create(true).truncate(true),
            FileMode::Append => options.append(true).create(true),
            FileMode::ReadWrite => options.read(true).write(true).create(true),
        };
        let handle = options
            .open(path)
            .map_err(|e| RuntimeError::host(format!("Failed to open file: {}: {}", path, e)))?;
        Ok(FileObject {
            path: path.to_string(),
            mode,
            handle: Some(handle),
        })
    }

    fn file(&mut self) -> Result<&mut std::fs::File, RuntimeError> {
        self.handle
            .as_mut()
            .ok_or_else(|| RuntimeError::host("File is not open"))
    }
}

fn require_file_mut<'a>(
    d: &'a mut Dispatch<'_>,
    id: u64,
) -> Result<&'a mut FileObject, RuntimeError> {
    match &mut d.object_mut(id)?.data {
        ObjectData::File(file) => Ok(file),
        _ => Err(RuntimeError::WrongTag { expected: "file" }),
    }
}

fn io_error(err: std::io::Error) -> RuntimeError {
    RuntimeError::host(format!("File operation failed: {}", err))
}

/// `read()` reads to the end; `read(n)` reads up to n bytes.
fn method_read(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() > 1 {
        return Err(RuntimeError::ArityMismatch {
            type_name: "File".to_string(),
            method: "read".to_string(),
        });
    }
    let count = match args.first() {
        Some(v) => Some(
            v.as_int()
                .ok_or(RuntimeError::WrongTag { expected: "integer" })?,
        ),
        None => None,
    };

    let file = require_file_mut(d, id)?;
    let handle = file.file()?;
    let content = match count {
        None => {
            let mut buffer = Vec::new();
            handle.read_to_end(&mut buffer).map_err(io_error)?;
            buffer
        }
        Some(n) => {
            let mut buffer = vec![0u8; n.max(0) as usize];
            let read = handle.read(&mut buffer).map_err(io_error)?;
            buffer.truncate(read);
            buffer
        }
    };
    let text = String::from_utf8_lossy(&content).into_owned();
    Ok(d.make_string(text))
}

fn method_read_line(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    let file = require_file_mut(d, id)?;
    let handle = file.file()?;

    // Byte-at-a-time keeps the handle's position exact without buffering.
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match handle.read(&mut byte).map_err(io_error)? {
            0 => break,
            _ => {
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
            }
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    let text = String::from_utf8_lossy(&line).into_owned();
    Ok(d.make_string(text))
}

fn method_write(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    let data = d.string_content(args[0])?;
    let file = require_file_mut(d, id)?;
    file.file()?.write_all(data.as_bytes()).map_err(io_error)?;
    Ok(Value::Int(data.len() as i64))
}

fn method_flush(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    let file = require_file_mut(d, id)?;
    file.file()?.flush().map_err(io_error)?;
    Ok(Value::Int(0))
}

fn method_seek(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    let offset = args[0]
        .as_int()
        .ok_or(RuntimeError::WrongTag { expected: "integer" })?;
    let whence = args[1]
        .as_int()
        .ok_or(RuntimeError::WrongTag { expected: "integer" })?;
    let target = match whence {
        0 => SeekFrom::Start(offset.max(0) as u64),
        1 => SeekFrom::Current(offset),
        2 => SeekFrom::End(offset),
        _ => return Err(RuntimeError::host("Invalid seek whence value")),
    };
    let file = require_file_mut(d, id)?;
    let position = file.file()?.seek(target).map_err(io_error)?;
    Ok(Value::Int(position as i64))
}

fn method_tell(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    let file = require_file_mut(d, id)?;
    let position = file.file()?.stream_position().map_err(io_error)?;
    Ok(Value::Int(position as i64))
}

fn method_size(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    let file = require_file_mut(d, id)?;
    let metadata = file.file()?.metadata().map_err(io_error)?;
    Ok(Value::Int(metadata.len() as i64))
}

fn method_is_open(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    let file = require_file_mut(d, id)?;
    Ok(Value::Int(if file.handle.is_some() { 1 } else { 0 }))
}

fn method_close(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    let file = require_file_mut(d, id)?;
    file.handle = None;
    Ok(Value::Int(0))
}

fn member_path(d: &mut Dispatch<'_>, id: u64) -> Result<Value, RuntimeError> {
    let path = require_file_mut(d, id)?.path.clone();
    Ok(d.make_string(path))
}

fn str_file(d: &mut Dispatch<'_>, id: u64) -> Result<String, RuntimeError> {
    match &d.object(id)?.data {
        ObjectData::File(file) => Ok(format!("File({})#{}", file.path, id)),
        _ => Err(RuntimeError::WrongTag { expected: "file" }),
    }
}

static FILE_TYPE: Lazy<TypeSpec> = Lazy::new(|| {
    let mut spec = TypeSpec::new("File", str_file);
    spec.register_variadic_method("read", method_read);
    spec.register_method("readLine", 0, method_read_line);
    spec.register_method("write", 1, method_write);
    spec.register_method("flush", 0, method_flush);
    spec.register_method("seek", 2, method_seek);
    spec.register_method("tell", 0, method_tell);
    spec.register_method("size", 0, method_size);
    spec.register_method("isOpen", 0, method_is_open);
    spec.register_method("close", 0, method_close);
    spec.register_member("path", member_path, None);
    spec
});

pub fn file_type() -> &'static TypeSpec {
    &FILE_TYPE
}
