// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{CfiRules, SymbolFile, SymbolInfo};
use crate::reader::MinidumpModule;
use crate::SymbolError;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Finds the symbol file of a module.
pub trait SymbolSupplier: Send + Sync {
    /// Loads and parses the symbols of `module`.
    fn locate_symbols(&self, module: &MinidumpModule) -> Result<SymbolFile, SymbolError>;
}

/// Relative path of a module's symbol file inside a symbol store:
/// `<debug file>/<debug id>/<debug file without .pdb>.sym`.
fn relative_symbol_path(module: &MinidumpModule) -> Option<PathBuf> {
    if module.debug_file.is_empty() || module.debug_identifier.is_empty() {
        return None;
    }
    let stem = module
        .debug_file
        .strip_suffix(".pdb")
        .unwrap_or(&module.debug_file);
    let mut path = PathBuf::from(&module.debug_file);
    path.push(&module.debug_identifier);
    path.push(format!("{stem}.sym"));
    Some(path)
}

/// Looks for symbol files in a list of symbol store directories.
#[derive(Clone, Debug, Default)]
pub struct SimpleSymbolSupplier {
    paths: Vec<PathBuf>,
}

impl SimpleSymbolSupplier {
    /// Searches `paths` in order.
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl SymbolSupplier for SimpleSymbolSupplier {
    fn locate_symbols(&self, module: &MinidumpModule) -> Result<SymbolFile, SymbolError> {
        let relative = relative_symbol_path(module).ok_or(SymbolError::NotFound)?;
        for root in &self.paths {
            let path = root.join(&relative);
            if !path.is_file() {
                continue;
            }
            tracing::debug!("Reading {}", path.display());
            let data = std::fs::read(&path)?;
            return SymbolFile::from_bytes(&data);
        }
        Err(SymbolError::NotFound)
    }
}

/// Serves symbol files held in memory, keyed by module path or file name.
#[derive(Clone, Debug, Default)]
pub struct StringSymbolSupplier {
    modules: HashMap<String, String>,
}

impl StringSymbolSupplier {
    /// Creates a supplier from module name and symbol text pairs.
    pub fn new(modules: HashMap<String, String>) -> Self {
        Self { modules }
    }
}

impl SymbolSupplier for StringSymbolSupplier {
    fn locate_symbols(&self, module: &MinidumpModule) -> Result<SymbolFile, SymbolError> {
        let text = self
            .modules
            .get(&module.name)
            .or_else(|| self.modules.get(module.file_name()))
            .or_else(|| self.modules.get(&module.debug_file))
            .ok_or(SymbolError::NotFound)?;
        SymbolFile::from_bytes(text.as_bytes())
    }
}

/// Whether symbols could be loaded for a module
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolStatus {
    /// Symbols were found and parsed
    Loaded,
    /// No symbol file exists for the module
    Missing,
    /// The symbol file could not be read or parsed
    Corrupt,
}

#[derive(Clone)]
enum CachedSymbols {
    Loaded(Arc<SymbolFile>),
    Missing,
    Corrupt,
}

/// Resolves addresses of modules, loading each symbol file once.
///
/// Loaded tables are never modified and are shared by every lookup, so one
/// symbolizer can serve concurrent stack walks.
pub struct Symbolizer {
    supplier: Box<dyn SymbolSupplier>,
    cache: RwLock<HashMap<(String, String, String), CachedSymbols>>,
}

impl Symbolizer {
    /// Creates a symbolizer with an empty cache.
    pub fn new(supplier: impl SymbolSupplier + 'static) -> Self {
        Self {
            supplier: Box::new(supplier),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// A symbolizer searching symbol store directories.
    pub fn from_paths<P: AsRef<Path>>(paths: &[P]) -> Self {
        Self::new(SimpleSymbolSupplier::new(
            paths.iter().map(|p| p.as_ref().to_path_buf()).collect(),
        ))
    }

    fn key(module: &MinidumpModule) -> (String, String, String) {
        (
            module.name.clone(),
            module.debug_file.clone(),
            module.debug_identifier.clone(),
        )
    }

    fn load(&self, module: &MinidumpModule) -> CachedSymbols {
        let key = Self::key(module);
        if let Some(cached) = self.cache.read().get(&key) {
            return cached.clone();
        }

        let loaded = match self.supplier.locate_symbols(module) {
            Ok(symbols) => {
                tracing::info!("Loaded symbols for {}", module.name);
                CachedSymbols::Loaded(Arc::new(symbols))
            }
            Err(SymbolError::NotFound) => {
                tracing::debug!("No symbols for {} {}", module.name, module.debug_identifier);
                CachedSymbols::Missing
            }
            Err(e) => {
                tracing::warn!("Symbols of {} are unusable: {e}", module.name);
                CachedSymbols::Corrupt
            }
        };
        // Another thread may have loaded the same module meanwhile, keep the
        // first result.
        self.cache.write().entry(key).or_insert(loaded).clone()
    }

    /// Parsed symbols of `module`, `None` when missing or corrupt.
    pub fn symbols(&self, module: &MinidumpModule) -> Option<Arc<SymbolFile>> {
        match self.load(module) {
            CachedSymbols::Loaded(symbols) => Some(symbols),
            _ => None,
        }
    }

    /// Loads the symbols of `module` if needed and reports the outcome.
    pub fn status(&self, module: &MinidumpModule) -> SymbolStatus {
        match self.load(module) {
            CachedSymbols::Loaded(_) => SymbolStatus::Loaded,
            CachedSymbols::Missing => SymbolStatus::Missing,
            CachedSymbols::Corrupt => SymbolStatus::Corrupt,
        }
    }

    /// Resolves the absolute `address` inside `module`.
    pub fn resolve(&self, module: &MinidumpModule, address: u64) -> Option<SymbolInfo> {
        let offset = address.checked_sub(module.base_address)?;
        self.symbols(module)?.lookup(offset)
    }

    /// Unwind rules for the absolute `address` inside `module`.
    pub fn get_cfi_for_address(&self, module: &MinidumpModule, address: u64) -> Option<CfiRules> {
        let offset = address.checked_sub(module.base_address)?;
        self.symbols(module)?.cfi_at(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn module(name: &str) -> MinidumpModule {
        MinidumpModule {
            base_address: 0x40_0000,
            size: 0x1_0000,
            name: name.to_string(),
            debug_file: name.rsplit('/').next().unwrap_or(name).to_string(),
            debug_identifier: "0123456789ABCDEF0123456789ABCDEF0".to_string(),
            ..Default::default()
        }
    }

    struct Counting(AtomicUsize);

    impl SymbolSupplier for Counting {
        fn locate_symbols(&self, module: &MinidumpModule) -> Result<SymbolFile, SymbolError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            match module.file_name() {
                "good" => SymbolFile::from_bytes(b"FUNC 10 10 0 f\n"),
                "bad" => SymbolFile::from_bytes(b"FUNC q\n"),
                _ => Err(SymbolError::NotFound),
            }
        }
    }

    #[test]
    fn results_are_cached_including_failures() {
        let symbolizer = Symbolizer::new(Counting(AtomicUsize::new(0)));
        let good = module("/bin/good");
        assert_eq!(
            symbolizer.resolve(&good, 0x40_0014).unwrap().frames[0].function,
            "f"
        );
        assert!(symbolizer.resolve(&good, 0x3f_0000).is_none());
        assert_eq!(symbolizer.status(&module("/bin/bad")), SymbolStatus::Corrupt);
        assert_eq!(symbolizer.status(&module("/bin/none")), SymbolStatus::Missing);
        assert_eq!(symbolizer.status(&module("/bin/none")), SymbolStatus::Missing);
        assert_eq!(symbolizer.status(&good), SymbolStatus::Loaded);
        assert_eq!(symbolizer.cache.read().len(), 3);
    }

    #[test]
    fn symbol_store_layout() {
        let dir = tempfile::tempdir().unwrap();
        let module = module("/usr/lib/libtest.so");
        let sym_dir = dir
            .path()
            .join("libtest.so")
            .join("0123456789ABCDEF0123456789ABCDEF0");
        std::fs::create_dir_all(&sym_dir).unwrap();
        std::fs::write(sym_dir.join("libtest.so.sym"), "PUBLIC 100 0 exported\n").unwrap();

        let symbolizer = Symbolizer::from_paths(&[dir.path().join("missing"), dir.path().to_path_buf()]);
        let info = symbolizer.resolve(&module, 0x40_0180).unwrap();
        assert_eq!(info.frames[0].function, "exported");
    }

    #[test]
    fn pdb_names_lose_their_extension() {
        let mut m = module("c:\\app.exe");
        m.debug_file = "app.pdb".to_string();
        let path = relative_symbol_path(&m).unwrap();
        assert!(path.ends_with("app.pdb/0123456789ABCDEF0123456789ABCDEF0/app.sym"));
    }
}
