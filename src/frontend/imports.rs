//! Import preprocessor
//!
//! Runs before tokenization. Lines of the form `import M [as N]` and
//! `from M import …` are rewritten into explicit `loadModule` bindings:
//!
//! - `import M [as N]` → `let N = loadModule("M");` — the alias defaults
//!   to the last dotted/slashed segment of `M`.
//! - `from M import x [as N]` → `let N = loadModule("M", "x");`
//! - `from M import x, y, z as N` → `let N = loadModule("M", "x", "y", "z");`
//!   (the alias is mandatory for multi-symbol imports)
//! - `from M import * as N` → `let N = loadModule("M");` (alias mandatory)
//!
//! Dotted module specs are normalized to path form and resolved against
//! the importing file's directory followed by the search paths. Resolved
//! files are preprocessed recursively so unresolved imports and import
//! cycles surface at compile time; results are memoized per canonical
//! path.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Import preprocessing error
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("{path}:{line}: error: Unresolved import: {spec} [function: <module>]")]
    Unresolved {
        path: String,
        line: usize,
        spec: String,
    },
    #[error("error: Cyclic import detected: {path} [function: <module>]")]
    Cycle { path: String },
    #[error("{path}:{line}: error: {message} [function: <module>]")]
    Malformed {
        path: String,
        line: usize,
        message: String,
    },
    #[error("error: Failed to read script file: {path} [function: <module>]")]
    Unreadable { path: String },
}

static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^import\s+([A-Za-z_][A-Za-z0-9_./]*)\s*(?:as\s+([A-Za-z_][A-Za-z0-9_]*))?$")
        .expect("import regex")
});

static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

/// One recognized import line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportStatement {
    pub module_spec: String,
    pub import_names: Vec<String>,
    pub alias: Option<String>,
    pub is_from: bool,
    pub is_wildcard: bool,
}

/// Default alias for `import M`: the last dotted or slashed segment.
pub fn default_module_alias(module_spec: &str) -> &str {
    let split = module_spec
        .rfind(['/', '\\', '.'])
        .map(|i| i + 1)
        .unwrap_or(0);
    if split >= module_spec.len() {
        module_spec
    } else {
        &module_spec[split..]
    }
}

/// Dotted specs become path form (`a.b.c` → `a/b/c`); specs that already
/// contain a separator are kept as written.
pub fn normalize_module_spec(spec: &str) -> String {
    if spec.contains('/') || spec.contains('\\') {
        spec.to_string()
    } else {
        spec.replace('.', "/")
    }
}

/// Recognize an import line. `Ok(None)` means the line is not an import.
pub fn parse_import_line(
    raw_line: &str,
    path: &str,
    line_no: usize,
) -> Result<Option<ImportStatement>, ImportError> {
    let mut line = raw_line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
        return Ok(None);
    }
    if let Some(stripped) = line.strip_suffix(';') {
        line = stripped.trim_end();
    }

    if let Some(caps) = IMPORT_RE.captures(line) {
        return Ok(Some(ImportStatement {
            module_spec: caps[1].to_string(),
            import_names: Vec::new(),
            alias: caps.get(2).map(|m| m.as_str().to_string()),
            is_from: false,
            is_wildcard: true,
        }));
    }

    let Some(rest) = line.strip_prefix("from ") else {
        return Ok(None);
    };
    let Some(import_at) = rest.find(" import ") else {
        return Ok(None);
    };

    let module_spec = rest[..import_at].trim().to_string();
    if module_spec.is_empty() {
        return Ok(None);
    }

    let mut import_spec = rest[import_at + 8..].trim().to_string();
    let mut alias = None;
    if let Some(as_at) = import_spec.rfind(" as ") {
        let candidate = import_spec[as_at + 4..].trim().to_string();
        if candidate.is_empty() || !IDENT_RE.is_match(&candidate) {
            return Err(ImportError::Malformed {
                path: path.to_string(),
                line: line_no,
                message: format!("Invalid import alias in line: {}", raw_line.trim()),
            });
        }
        alias = Some(candidate);
        import_spec = import_spec[..as_at].trim().to_string();
    }

    if import_spec == "*" {
        return Ok(Some(ImportStatement {
            module_spec,
            import_names: Vec::new(),
            alias,
            is_from: true,
            is_wildcard: true,
        }));
    }

    let mut import_names = Vec::new();
    for segment in import_spec.split(',') {
        let name = segment.trim();
        if name.is_empty() || !IDENT_RE.is_match(name) {
            return Err(ImportError::Malformed {
                path: path.to_string(),
                line: line_no,
                message: format!("Invalid import symbol in line: {}", raw_line.trim()),
            });
        }
        import_names.push(name.to_string());
    }
    if import_names.is_empty() {
        return Err(ImportError::Malformed {
            path: path.to_string(),
            line: line_no,
            message: "from-import requires at least one symbol".to_string(),
        });
    }

    Ok(Some(ImportStatement {
        module_spec,
        import_names,
        alias,
        is_from: true,
        is_wildcard: false,
    }))
}

/// Resolve a module spec relative to the importing file, then against the
/// search paths. Returns the canonical path of the first hit.
pub fn resolve_import_path(
    module_spec: &str,
    current_file: &Path,
    search_paths: &[PathBuf],
) -> Option<PathBuf> {
    let normalized = normalize_module_spec(module_spec);
    let mut candidates = vec![normalized.clone()];
    if !normalized.ends_with(".gs") {
        candidates.push(format!("{}.gs", normalized));
    }

    let current_dir = current_file.parent().map(Path::to_path_buf);
    for candidate in &candidates {
        let candidate_path = Path::new(candidate);
        if candidate_path.is_absolute() && candidate_path.exists() {
            return canonical(candidate_path);
        }

        if let Some(dir) = &current_dir {
            let local = dir.join(candidate_path);
            if local.exists() {
                return canonical(&local);
            }
        }

        for base in search_paths {
            let searched = base.join(candidate_path);
            if searched.exists() {
                return canonical(&searched);
            }
        }
    }

    None
}

fn canonical(path: &Path) -> Option<PathBuf> {
    path.canonicalize().ok().or_else(|| Some(path.to_path_buf()))
}

fn rewrite_import(
    stmt: &ImportStatement,
    path: &str,
    line_no: usize,
) -> Result<String, ImportError> {
    if !stmt.is_from {
        let alias = stmt
            .alias
            .clone()
            .unwrap_or_else(|| default_module_alias(&stmt.module_spec).to_string());
        return Ok(format!(
            "let {} = loadModule(\"{}\");",
            alias, stmt.module_spec
        ));
    }

    if stmt.is_wildcard {
        let Some(alias) = &stmt.alias else {
            return Err(ImportError::Malformed {
                path: path.to_string(),
                line: line_no,
                message: format!(
                    "from {} import * requires alias in strict module mode",
                    stmt.module_spec
                ),
            });
        };
        return Ok(format!(
            "let {} = loadModule(\"{}\");",
            alias, stmt.module_spec
        ));
    }

    if stmt.import_names.len() > 1 {
        let Some(alias) = &stmt.alias else {
            return Err(ImportError::Malformed {
                path: path.to_string(),
                line: line_no,
                message: format!(
                    "from {} import a,b requires alias in strict module mode",
                    stmt.module_spec
                ),
            });
        };
        let exports = stmt
            .import_names
            .iter()
            .map(|name| format!(", \"{}\"", name))
            .collect::<String>();
        return Ok(format!(
            "let {} = loadModule(\"{}\"{});",
            alias, stmt.module_spec, exports
        ));
    }

    let imported = &stmt.import_names[0];
    let local = stmt.alias.as_deref().unwrap_or(imported);
    Ok(format!(
        "let {} = loadModule(\"{}\", \"{}\");",
        local, stmt.module_spec, imported
    ))
}

/// Memoized per-file preprocessing state.
#[derive(Default)]
pub struct ImportCache {
    processed: HashMap<PathBuf, String>,
    visiting: HashSet<PathBuf>,
}

/// Preprocess one file: rewrite its import lines and recursively validate
/// every imported file. Returns the rewritten source of `path`.
pub fn preprocess_file(
    path: &Path,
    search_paths: &[PathBuf],
    cache: &mut ImportCache,
) -> Result<String, ImportError> {
    let canonical_path = canonical(path).unwrap_or_else(|| path.to_path_buf());
    if let Some(done) = cache.processed.get(&canonical_path) {
        return Ok(done.clone());
    }
    if cache.visiting.contains(&canonical_path) {
        return Err(ImportError::Cycle {
            path: canonical_path.display().to_string(),
        });
    }

    let source =
        std::fs::read_to_string(&canonical_path).map_err(|_| ImportError::Unreadable {
            path: canonical_path.display().to_string(),
        })?;
    let display_path = canonical_path.display().to_string();

    cache.visiting.insert(canonical_path.clone());
    let result = preprocess_source_inner(&source, &canonical_path, &display_path, search_paths, cache);
    cache.visiting.remove(&canonical_path);

    let rewritten = result?;
    cache
        .processed
        .insert(canonical_path, rewritten.clone());
    Ok(rewritten)
}

fn preprocess_source_inner(
    source: &str,
    current_file: &Path,
    display_path: &str,
    search_paths: &[PathBuf],
    cache: &mut ImportCache,
) -> Result<String, ImportError> {
    let mut out = String::with_capacity(source.len());
    for (index, line) in source.lines().enumerate() {
        let line_no = index + 1;
        let Some(stmt) = parse_import_line(line, display_path, line_no)? else {
            out.push_str(line);
            out.push('\n');
            continue;
        };

        let Some(resolved) = resolve_import_path(&stmt.module_spec, current_file, search_paths)
        else {
            return Err(ImportError::Unresolved {
                path: display_path.to_string(),
                line: line_no,
                spec: stmt.module_spec,
            });
        };
        debug!(spec = %stmt.module_spec, resolved = %resolved.display(), "import resolved");
        preprocess_file(&resolved, search_paths, cache)?;

        out.push_str(&rewrite_import(&stmt, display_path, line_no)?);
        out.push('\n');
    }
    Ok(out)
}

/// Preprocess in-memory source that is not backed by a file. Imports are
/// rewritten without path validation; used for string entry points.
pub fn preprocess_source(source: &str) -> Result<String, ImportError> {
    let mut out = String::with_capacity(source.len());
    for (index, line) in source.lines().enumerate() {
        let line_no = index + 1;
        match parse_import_line(line, "<input>", line_no)? {
            Some(stmt) => {
                out.push_str(&rewrite_import(&stmt, "<input>", line_no)?);
                out.push('\n');
            }
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    Ok(out)
}
