//! Path objects
//!
//! A filesystem path with inspection helpers. Size and mtime queries on
//! missing files answer -1 rather than failing.

use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use once_cell::sync::Lazy;

use crate::bytecode::Value;
use crate::vm::errors::RuntimeError;

use super::{Dispatch, ObjectData, TypeSpec};

#[derive(Debug, Clone)]
pub struct PathObject {
    pub path: PathBuf,
}

impl PathObject {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

fn require_path<'a>(d: &'a Dispatch<'_>, id: u64) -> Result<&'a PathObject, RuntimeError> {
    match &d.object(id)?.data {
        ObjectData::Path(path) => Ok(path),
        _ => Err(RuntimeError::WrongTag { expected: "path" }),
    }
}

fn bool_value(flag: bool) -> Value {
    Value::Int(if flag { 1 } else { 0 })
}

fn method_extension(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    let path = require_path(d, id)?.path.clone();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    Ok(d.make_string(ext))
}

fn method_filename(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    let path = require_path(d, id)?.path.clone();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(d.make_string(name))
}

fn method_stem(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    let path = require_path(d, id)?.path.clone();
    let stem = path
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(d.make_string(stem))
}

fn method_parent(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    let path = require_path(d, id)?.path.clone();
    let parent = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(d.make_string(parent))
}

/// Lexical normalization: `.` segments drop, `..` pops where possible.
fn normalize_lexically(path: &std::path::Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
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
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

fn method_normalize(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    let path = require_path(d, id)?.path.clone();
    let normalized = normalize_lexically(&path).to_string_lossy().into_owned();
    Ok(d.make_string(normalized))
}

fn method_join(d: &mut Dispatch<'_>, id: u64, args: &[Value]) -> Result<Value, RuntimeError> {
    let other = d.string_content(args[0])?;
    let path = require_path(d, id)?.path.clone();
    Ok(d.alloc(ObjectData::Path(PathObject::new(path.join(other)))))
}

fn method_exists(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(bool_value(require_path(d, id)?.path.exists()))
}

fn method_is_file(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(bool_value(require_path(d, id)?.path.is_file()))
}

fn method_is_directory(
    d: &mut Dispatch<'_>,
    id: u64,
    _args: &[Value],
) -> Result<Value, RuntimeError> {
    Ok(bool_value(require_path(d, id)?.path.is_dir()))
}

fn method_file_size(d: &mut Dispatch<'_>, id: u64, _args: &[Value]) -> Result<Value, RuntimeError> {
    let size = require_path(d, id)?
        .path
        .metadata()
        .map(|m| m.len() as i64)
        .unwrap_or(-1);
    Ok(Value::Int(size))
}

fn method_last_modified(
    d: &mut Dispatch<'_>,
    id: u64,
    _args: &[Value],
) -> Result<Value, RuntimeError> {
    let modified = require_path(d, id)?
        .path
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(-1);
    Ok(Value::Int(modified))
}

fn member_path(d: &mut Dispatch<'_>, id: u64) -> Result<Value, RuntimeError> {
    let text = require_path(d, id)?.path.to_string_lossy().into_owned();
    Ok(d.make_string(text))
}

fn str_path(d: &mut Dispatch<'_>, id: u64) -> Result<String, RuntimeError> {
    Ok(require_path(d, id)?.path.to_string_lossy().into_owned())
}

static PATH_TYPE: Lazy<TypeSpec> = Lazy::new(|| {
    let mut spec = TypeSpec::new("Path", str_path);
    spec.register_method("extension", 0, method_extension);
    spec.register_method("filename", 0, method_filename);
    spec.register_method("stem", 0, method_stem);
    spec.register_method("parent", 0, method_parent);
    spec.register_method("normalize", 0, method_normalize);
    spec.register_method("join", 1, method_join);
    spec.register_method("exists", 0, method_exists);
    spec.register_method("isFile", 0, method_is_file);
    spec.register_method("isDirectory", 0, method_is_directory);
    spec.register_method("fileSize", 0, method_file_size);
    spec.register_method("lastModified", 0, method_last_modified);
    spec.register_member("path", member_path, None);
    spec
});

pub fn path_type() -> &'static TypeSpec {
    &PATH_TYPE
}
