//! `os` host module
//!
//! Filesystem access for scripts: file handles (`open` → File), one-shot
//! `read`/`write`/`append`, and path helpers that accept either strings
//! or Path objects.

use std::path::{Path, PathBuf};

use crate::bytecode::Value;
use crate::types::file::{FileMode, FileObject};
use crate::types::{ObjectData, PathObject};
use crate::vm::errors::RuntimeError;

use super::{HostCall, HostRegistry};

/// String form of a path argument; Path objects pass through unchanged.
fn path_arg(call: &mut HostCall<'_>, value: Value) -> Result<String, RuntimeError> {
    if let Some(id) = value.as_ref_id() {
        if let ObjectData::Path(path) = &call.d.object(id)?.data {
            return Ok(path.path.to_string_lossy().into_owned());
        }
    }
    call.value_str(value)
}

fn require_args(name: &str, args: &[Value], minimum: usize) -> Result<(), RuntimeError> {
    if args.len() < minimum {
        return Err(RuntimeError::host(format!(
            "{}() requires at least {} argument{}",
            name,
            minimum,
            if minimum == 1 { "" } else { "s" }
        )));
    }
    Ok(())
}

pub fn register_os_module(registry: &mut HostRegistry) {
    registry.define_module("os");

    registry.bind_module_function("os", "open", |call, args| {
        require_args("open", args, 1)?;
        let path = path_arg(call, args[0])?;
        let mode = match args.get(1) {
            Some(value) => call.value_str(*value)?,
            None => "r".to_string(),
        };
        let file = FileObject::open(&path, FileMode::parse(&mode)?)?;
        Ok(call.d.alloc(ObjectData::File(file)))
    });

    registry.bind_module_function("os", "read", |call, args| {
        require_args("read", args, 1)?;
        let path = path_arg(call, args[0])?;
        let content = std::fs::read(&path)
            .map_err(|e| RuntimeError::host(format!("Failed to open file: {}: {}", path, e)))?;
        let text = String::from_utf8_lossy(&content).into_owned();
        Ok(call.make_string(text))
    });

    registry.bind_module_function("os", "write", |call, args| {
        require_args("write", args, 2)?;
        let path = path_arg(call, args[0])?;
        let content = call.d.string_content(args[1])?;
        std::fs::write(&path, content.as_bytes()).map_err(|e| {
            RuntimeError::host(format!("Failed to open file for writing: {}: {}", path, e))
        })?;
        Ok(Value::Int(content.len() as i64))
    });

    registry.bind_module_function("os", "append", |call, args| {
        require_args("append", args, 2)?;
        let path = path_arg(call, args[0])?;
        let content = call.d.string_content(args[1])?;
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| {
                RuntimeError::host(format!("Failed to open file for appending: {}: {}", path, e))
            })?;
        file.write_all(content.as_bytes())
            .map_err(|e| RuntimeError::host(format!("File operation failed: {}", e)))?;
        Ok(Value::Int(content.len() as i64))
    });

    registry.bind_module_function("os", "Path", |call, args| {
        require_args("Path", args, 1)?;
        let path = call.value_str(args[0])?;
        Ok(call.d.alloc(ObjectData::Path(PathObject::new(path))))
    });

    registry.bind_module_function("os", "join", |call, args| {
        require_args("join", args, 1)?;
        let mut joined = PathBuf::from(path_arg(call, args[0])?);
        for arg in &args[1..] {
            joined.push(path_arg(call, *arg)?);
        }
        Ok(call.make_string(joined.to_string_lossy().into_owned()))
    });

    registry.bind_module_function("os", "abspath", |call, args| {
        require_args("abspath", args, 1)?;
        let path = PathBuf::from(path_arg(call, args[0])?);
        let absolute = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()
                .map_err(|e| RuntimeError::host(format!("Failed to get absolute path: {}", e)))?
                .join(path)
        };
        Ok(call.make_string(absolute.to_string_lossy().into_owned()))
    });

    registry.bind_module_function("os", "normalize", |call, args| {
        require_args("normalize", args, 1)?;
        let text = path_arg(call, args[0])?;
        let mut out = PathBuf::new();
        for component in Path::new(&text).components() {
            match component {
                std::path::Component::CurDir => {}
                std::path::Component::ParentDir => {
                    if !out.pop() {
                        out.push("..");
                    }
                }
                other => out.push(other.as_os_str()),
            }
        }
        Ok(call.make_string(out.to_string_lossy().into_owned()))
    });

    registry.bind_module_function("os", "dirname", |call, args| {
        require_args("dirname", args, 1)?;
        let text = path_arg(call, args[0])?;
        let parent = Path::new(&text)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(call.make_string(parent))
    });

    registry.bind_module_function("os", "basename", |call, args| {
        require_args("basename", args, 1)?;
        let text = path_arg(call, args[0])?;
        let name = Path::new(&text)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(call.make_string(name))
    });

    registry.bind_module_function("os", "extension", |call, args| {
        require_args("extension", args, 1)?;
        let text = path_arg(call, args[0])?;
        let ext = Path::new(&text)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        Ok(call.make_string(ext))
    });

    registry.bind_module_function("os", "exists", |call, args| {
        require_args("exists", args, 1)?;
        let path = path_arg(call, args[0])?;
        Ok(Value::Int(if Path::new(&path).exists() { 1 } else { 0 }))
    });

    registry.bind_module_function("os", "isFile", |call, args| {
        require_args("isFile", args, 1)?;
        let path = path_arg(call, args[0])?;
        Ok(Value::Int(if Path::new(&path).is_file() { 1 } else { 0 }))
    });

    registry.bind_module_function("os", "isDirectory", |call, args| {
        require_args("isDirectory", args, 1)?;
        let path = path_arg(call, args[0])?;
        Ok(Value::Int(if Path::new(&path).is_dir() { 1 } else { 0 }))
    });

    registry.bind_module_function("os", "fileSize", |call, args| {
        require_args("fileSize", args, 1)?;
        let path = path_arg(call, args[0])?;
        let size = std::fs::metadata(&path).map(|m| m.len() as i64).unwrap_or(-1);
        Ok(Value::Int(size))
    });

    registry.bind_module_function("os", "listdir", |call, args| {
        require_args("listdir", args, 1)?;
        let path = path_arg(call, args[0])?;
        let entries = std::fs::read_dir(&path)
            .map_err(|e| RuntimeError::host(format!("Failed to list directory: {}: {}", path, e)))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| RuntimeError::host(format!("Failed to list directory: {}", e)))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        let items: Vec<Value> = names.into_iter().map(|n| call.make_string(n)).collect();
        Ok(call
            .d
            .alloc(ObjectData::List(crate::types::ListObject::new(items))))
    });

    registry.bind_module_function("os", "remove", |call, args| {
        require_args("remove", args, 1)?;
        let path = path_arg(call, args[0])?;
        let target = Path::new(&path);
        let result = if target.is_dir() {
            std::fs::remove_dir_all(target)
        } else {
            std::fs::remove_file(target)
        };
        result.map_err(|e| RuntimeError::host(format!("Failed to remove: {}: {}", path, e)))?;
        Ok(Value::Int(0))
    });

    registry.bind_module_function("os", "rename", |call, args| {
        require_args("rename", args, 2)?;
        let from = path_arg(call, args[0])?;
        let to = path_arg(call, args[1])?;
        std::fs::rename(&from, &to)
            .map_err(|e| RuntimeError::host(format!("Failed to rename: {}: {}", from, e)))?;
        Ok(Value::Int(0))
    });

    registry.bind_module_function("os", "mkdir", |call, args| {
        require_args("mkdir", args, 1)?;
        let path = path_arg(call, args[0])?;
        std::fs::create_dir_all(&path)
            .map_err(|e| RuntimeError::host(format!("Failed to create directory: {}: {}", path, e)))?;
        Ok(Value::Int(0))
    });

    registry.bind_module_function("os", "getcwd", |call, args| {
        if !args.is_empty() {
            return Err(RuntimeError::host("getcwd() takes no arguments"));
        }
        let cwd = std::env::current_dir()
            .map_err(|e| RuntimeError::host(format!("Failed to get working directory: {}", e)))?;
        Ok(call.make_string(cwd.to_string_lossy().into_owned()))
    });

    registry.bind_module_function("os", "sep", |call, args| {
        if !args.is_empty() {
            return Err(RuntimeError::host("sep() takes no arguments"));
        }
        Ok(call.make_string(std::path::MAIN_SEPARATOR.to_string()))
    });
}
