// Module resolution: which path an import string resolves to, and in what
// order.
//
// File IO stays an external collaborator behind `SourceProvider`; actual
// reads are a host concern. Everything about *which* path wins, *caching*
// by canonical path, and *cycle detection* is core logic and lives here.

use crate::diagnostics::{import_error, Diagnostic};
use crate::token::Span;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub trait SourceProvider {
    fn read(&self, canonical_path: &Path) -> Option<String>;
}

pub struct ModuleLoader<'a> {
    provider: &'a dyn SourceProvider,
    stdlib_dir: Option<PathBuf>,
    search_path: Vec<PathBuf>,
    cache: RefCell<HashMap<PathBuf, Rc<str>>>,
    in_progress: RefCell<HashSet<PathBuf>>,
}

use std::rc::Rc;

impl<'a> ModuleLoader<'a> {
    pub fn new(provider: &'a dyn SourceProvider, stdlib_dir: Option<PathBuf>, thorn_path: Option<&str>) -> ModuleLoader<'a> {
        let search_path = thorn_path
            .map(|raw| split_search_path(raw))
            .unwrap_or_default();
        ModuleLoader {
            provider,
            stdlib_dir,
            search_path,
            cache: RefCell::new(HashMap::new()),
            in_progress: RefCell::new(HashSet::new()),
        }
    }

    // Resolution order:
    //  1. relative to the importing file's directory
    //  2. the stdlib directory alongside the binary
    //  3. the colon/semicolon-separated THORN_PATH search list
    pub fn resolve(&self, path: &str, importing_file: &Path, span: Span) -> Result<PathBuf, Diagnostic> {
        let mut candidates = Vec::new();
        if let Some(dir) = importing_file.parent() {
            candidates.push(dir.join(path));
        } else {
            candidates.push(PathBuf::from(path));
        }
        if let Some(stdlib) = &self.stdlib_dir {
            candidates.push(stdlib.join(path));
        }
        for dir in &self.search_path {
            candidates.push(dir.join(path));
        }
        for candidate in &candidates {
            if self.provider.read(candidate).is_some() {
                return Ok(canonicalize_best_effort(candidate));
            }
        }
        Err(import_error(format!("module '{}' not found", path), span))
    }

    // Loads and caches module source by canonical path, detecting import
    // cycles via an in-progress set.
    pub fn load(&self, canonical_path: &Path, span: Span) -> Result<Rc<str>, Diagnostic> {
        if let Some(cached) = self.cache.borrow().get(canonical_path) {
            return Ok(cached.clone());
        }
        if self.in_progress.borrow().contains(canonical_path) {
            return Err(import_error(
                format!("circular import of '{}'", canonical_path.display()),
                span,
            ));
        }
        self.in_progress.borrow_mut().insert(canonical_path.to_path_buf());
        let source = self
            .provider
            .read(canonical_path)
            .ok_or_else(|| import_error(format!("module '{}' not found", canonical_path.display()), span))?;
        let rc: Rc<str> = Rc::from(source.into_boxed_str());
        self.cache.borrow_mut().insert(canonical_path.to_path_buf(), rc.clone());
        self.in_progress.borrow_mut().remove(canonical_path);
        Ok(rc)
    }

    pub fn finish_loading(&self, canonical_path: &Path) {
        self.in_progress.borrow_mut().remove(canonical_path);
    }
}

fn canonicalize_best_effort(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn split_search_path(raw: &str) -> Vec<PathBuf> {
    raw.split(|c| c == ':' || c == ';').filter(|s| !s.is_empty()).map(PathBuf::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    struct FakeFs(Map<PathBuf, String>);

    impl SourceProvider for FakeFs {
        fn read(&self, path: &Path) -> Option<String> {
            self.0.get(path).cloned()
        }
    }

    #[test]
    fn test_relative_resolution_wins_first() {
        let mut files = Map::new();
        files.insert(PathBuf::from("/proj/util.thorn"), "export $ f(){}".to_string());
        let fs = FakeFs(files);
        let loader = ModuleLoader::new(&fs, None, None);
        let resolved = loader.resolve("util.thorn", Path::new("/proj/main.thorn"), Span::new(1, 1)).unwrap();
        assert_eq!(resolved, PathBuf::from("/proj/util.thorn"));
    }

    #[test]
    fn test_missing_module_is_import_error() {
        let fs = FakeFs(Map::new());
        let loader = ModuleLoader::new(&fs, None, None);
        let err = loader.resolve("missing.thorn", Path::new("/proj/main.thorn"), Span::new(1, 1)).unwrap_err();
        assert_eq!(err.kind, crate::diagnostics::ErrorKind::Import);
    }

    #[test]
    fn test_circular_import_detected() {
        let mut files = Map::new();
        files.insert(PathBuf::from("/a.thorn"), "x".to_string());
        let fs = FakeFs(files);
        let loader = ModuleLoader::new(&fs, None, None);
        let path = PathBuf::from("/a.thorn");
        loader.load(&path, Span::new(1, 1)).unwrap();
        // Simulate re-entrancy while the first load is still in progress.
        loader.in_progress.borrow_mut().insert(path.clone());
        let err = loader.load(&path, Span::new(1, 1));
        // cache already has it from the first (finished) load, so this
        // path actually hits the cache fast-path; force the cycle check
        // directly instead.
        assert!(err.is_ok());
        loader.cache.borrow_mut().remove(&path);
        let err = loader.load(&path, Span::new(1, 1)).unwrap_err();
        assert_eq!(err.kind, crate::diagnostics::ErrorKind::Import);
    }
}
