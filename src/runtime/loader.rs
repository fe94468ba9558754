//! Module loader
//!
//! Resolves `loadModule` specs to script files, compiles them and caches
//! the compiled modules by canonical path. Shared across VMs (and across
//! spawned coroutines), so the cache is lock-protected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::bytecode::ModulePin;
use crate::compiler::compile_source_file;
use crate::vm::errors::RuntimeError;

/// Search-path driven loader with a compile cache.
#[derive(Default)]
pub struct ModuleLoader {
    search_paths: Mutex<Vec<PathBuf>>,
    cache: Mutex<HashMap<PathBuf, ModulePin>>,
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_search_path(&self, path: impl Into<PathBuf>) {
        self.search_paths.lock().push(path.into());
    }

    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.search_paths.lock().clone()
    }

    /// Resolve a module spec (dotted or path form) against the working
    /// directory, its `scripts` subdirectory and the search paths.
    pub fn resolve(&self, spec: &str) -> Option<PathBuf> {
        let normalized = crate::frontend::imports::normalize_module_spec(spec);
        let mut candidates = vec![normalized.clone()];
        if !normalized.ends_with(".gs") {
            candidates.push(format!("{}.gs", normalized));
        }

        let mut roots = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            roots.push(cwd.clone());
            roots.push(cwd.join("scripts"));
        }
        roots.extend(self.search_paths.lock().iter().cloned());

        for candidate in &candidates {
            let candidate_path = Path::new(candidate);
            if candidate_path.is_absolute() && candidate_path.exists() {
                return Some(candidate_path.to_path_buf());
            }
            for root in &roots {
                let joined = root.join(candidate_path);
                if joined.exists() {
                    return Some(joined);
                }
            }
        }
        None
    }

    /// Load (and cache) the compiled module behind a spec.
    pub fn load(&self, spec: &str) -> Result<ModulePin, RuntimeError> {
        let Some(path) = self.resolve(spec) else {
            return Err(RuntimeError::host(format!("Module not found: {}", spec)));
        };
        let canonical = path.canonicalize().unwrap_or(path);

        if let Some(cached) = self.cache.lock().get(&canonical) {
            return Ok(cached.clone());
        }

        debug!(spec, path = %canonical.display(), "compiling module");
        let search_paths = self.search_paths.lock().clone();
        let compiled = compile_source_file(&canonical, &search_paths)
            .map_err(|e| RuntimeError::host(e.to_string()))?;
        let pin: ModulePin = std::sync::Arc::new(compiled);
        self.cache.lock().insert(canonical, pin.clone());
        Ok(pin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_and_caches_modules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("util.gs"),
            "fn helper() { return 7; }\n",
        )
        .unwrap();

        let loader = ModuleLoader::new();
        loader.add_search_path(dir.path());
        let first = loader.load("util").unwrap();
        let second = loader.load("util").unwrap();
        assert!(std::sync::Arc::ptr_eq(&first, &second));
        assert!(first.find_function("helper").is_some());
    }

    #[test]
    fn missing_module_reports_spec() {
        let loader = ModuleLoader::new();
        let err = loader.load("no_such_module").unwrap_err();
        assert!(err.to_string().contains("no_such_module"));
    }

    #[test]
    fn dotted_specs_resolve_as_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
        std::fs::write(
            dir.path().join("pkg/tool.gs"),
            "fn t() { return 1; }\n",
        )
        .unwrap();

        let loader = ModuleLoader::new();
        loader.add_search_path(dir.path());
        assert!(loader.load("pkg.tool").is_ok());
    }
}
