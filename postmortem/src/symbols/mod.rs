// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Symbol tables in the portable text format and the lookups the stack
//! walker needs from them.

mod cfi;
mod parser;
mod supplier;

pub use cfi::{evaluate, CfiRules};
pub use supplier::{
    SimpleSymbolSupplier, StringSymbolSupplier, SymbolStatus, SymbolSupplier, Symbolizer,
};

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// The `MODULE` record of a symbol file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleRecord {
    /// Operating system, such as `Linux`
    pub os: String,
    /// CPU architecture, such as `x86_64`
    pub arch: String,
    /// Debug identifier of the module
    pub id: String,
    /// Debug file name
    pub name: String,
}

/// One row of a function's line table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineRecord {
    /// Module-relative address
    pub address: u64,
    /// Bytes covered
    pub size: u64,
    /// One-based source line
    pub line: u32,
    /// Index into the `FILE` records
    pub file: u32,
}

/// An inlined call inside a function
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inlinee {
    /// Nesting depth, zero when inlined directly into the function
    pub depth: u32,
    /// Line of the call site
    pub call_line: u32,
    /// File of the call site
    pub call_file: u32,
    /// Index into the `INLINE_ORIGIN` records
    pub origin: u32,
    /// Module-relative `(address, size)` ranges of the inlined code
    pub ranges: Vec<(u64, u64)>,
}

impl Inlinee {
    fn contains(&self, address: u64) -> bool {
        self.ranges
            .iter()
            .any(|(start, size)| address >= *start && address - start < *size)
    }
}

/// A `FUNC` record with its lines and inlinees
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    /// Module-relative start address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// Bytes of parameters on the stack
    pub parameter_size: u32,
    /// Symbol name
    pub name: String,
    /// Line table, sorted by address
    pub lines: Vec<LineRecord>,
    /// Inlined calls
    pub inlinees: Vec<Inlinee>,
}

impl Function {
    fn contains(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.size
    }

    fn line_at(&self, address: u64) -> Option<&LineRecord> {
        let index = self.lines.partition_point(|l| l.address <= address);
        let line = self.lines.get(index.checked_sub(1)?)?;
        (address - line.address < line.size.max(1)).then_some(line)
    }
}

/// A `PUBLIC` record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicSymbol {
    /// Module-relative address
    pub address: u64,
    /// Bytes of parameters on the stack
    pub parameter_size: u32,
    /// Symbol name
    pub name: String,
}

/// A `STACK CFI INIT` record with the `STACK CFI` rows that follow it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CfiEntry {
    /// Module-relative start address
    pub address: u64,
    /// Bytes covered
    pub size: u64,
    /// Rules in effect at `address`
    pub init: Vec<(String, String)>,
    /// Rule changes, each effective from its address on
    pub deltas: Vec<(u64, Vec<(String, String)>)>,
}

/// One function of an inline chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SymbolFrame {
    /// Function name
    pub function: String,
    /// Source file executing in this function
    pub source_file: Option<String>,
    /// Source line executing in this function
    pub source_line: Option<u32>,
}

/// Result of a symbol lookup
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SymbolInfo {
    /// Module-relative address of the outermost function
    pub function_base: u64,
    /// Bytes of parameters of the outermost function
    pub parameter_size: u32,
    /// Functions executing at the address, innermost first; the last one is
    /// the function the code physically belongs to
    pub frames: Vec<SymbolFrame>,
}

impl SymbolInfo {
    /// The function the code physically belongs to
    pub fn outermost(&self) -> Option<&SymbolFrame> {
        self.frames.last()
    }

    /// The innermost inlined function, or the outermost one
    pub fn innermost(&self) -> Option<&SymbolFrame> {
        self.frames.first()
    }
}

/// The parsed symbol table of one module.
///
/// Immutable once parsed; lookups take module-relative addresses.
#[derive(Clone, Debug, Default)]
pub struct SymbolFile {
    /// `MODULE` record, when present
    pub module: Option<ModuleRecord>,
    /// `INFO CODE_ID` value, when present
    pub code_id: Option<String>,
    /// `FILE` records
    pub files: HashMap<u32, String>,
    /// `INLINE_ORIGIN` records
    pub inline_origins: HashMap<u32, String>,
    /// `FUNC` records by address
    pub functions: BTreeMap<u64, Function>,
    /// `PUBLIC` records by address
    pub publics: BTreeMap<u64, PublicSymbol>,
    /// `STACK CFI` records by address
    pub cfi: BTreeMap<u64, CfiEntry>,
}

impl SymbolFile {
    /// Parses a symbol file.
    pub fn from_bytes(data: &[u8]) -> Result<Self, crate::SymbolError> {
        parser::parse(data)
    }

    /// Function covering `address`.
    pub fn function_at(&self, address: u64) -> Option<&Function> {
        self.functions
            .range(..=address)
            .next_back()
            .map(|(_, f)| f)
            .filter(|f| f.contains(address))
    }

    /// Public symbol covering `address`: the closest one at or below it,
    /// unless a function starts between the two.
    pub fn public_at(&self, address: u64) -> Option<&PublicSymbol> {
        let (public_address, public) = self.publics.range(..=address).next_back()?;
        match self.functions.range(..=address).next_back() {
            Some((function_address, _)) if function_address >= public_address => None,
            _ => Some(public),
        }
    }

    /// Whether `address` is the start or inside of a known function or
    /// public symbol
    pub fn covers(&self, address: u64) -> bool {
        self.function_at(address).is_some() || self.public_at(address).is_some()
    }

    fn file_name(&self, index: u32) -> Option<String> {
        self.files.get(&index).cloned()
    }

    /// Resolves `address` to the chain of functions executing there.
    pub fn lookup(&self, address: u64) -> Option<SymbolInfo> {
        let Some(function) = self.function_at(address) else {
            let public = self.public_at(address)?;
            return Some(SymbolInfo {
                function_base: public.address,
                parameter_size: public.parameter_size,
                frames: vec![SymbolFrame {
                    function: public.name.clone(),
                    source_file: None,
                    source_line: None,
                }],
            });
        };

        let mut chain: Vec<&Inlinee> = function
            .inlinees
            .iter()
            .filter(|i| i.contains(address))
            .collect();
        chain.sort_by_key(|i| i.depth);

        // Each function executes the call site of the next deeper inlinee,
        // the deepest one executes the line record.
        let line = function.line_at(address);
        let mut names = vec![function.name.clone()];
        let mut locations = Vec::with_capacity(chain.len() + 1);
        for inlinee in &chain {
            names.push(
                self.inline_origins
                    .get(&inlinee.origin)
                    .cloned()
                    .unwrap_or_else(|| "<name omitted>".to_string()),
            );
            locations.push((self.file_name(inlinee.call_file), Some(inlinee.call_line)));
        }
        locations.push(match line {
            Some(line) => (self.file_name(line.file), Some(line.line)),
            None => (None, None),
        });

        let frames = names
            .into_iter()
            .zip(locations)
            .rev()
            .map(|(function, (source_file, source_line))| SymbolFrame {
                function,
                source_file,
                source_line,
            })
            .collect();
        Some(SymbolInfo {
            function_base: function.address,
            parameter_size: function.parameter_size,
            frames,
        })
    }

    /// Unwind rules in effect at `address`, `None` without CFI.
    pub fn cfi_at(&self, address: u64) -> Option<CfiRules> {
        let (_, entry) = self.cfi.range(..=address).next_back()?;
        if address - entry.address >= entry.size {
            return None;
        }
        let mut rules = CfiRules::default();
        for (register, expression) in &entry.init {
            rules.set(register, expression);
        }
        for (delta_address, delta) in &entry.deltas {
            if *delta_address > address {
                break;
            }
            for (register, expression) in delta {
                rules.set(register, expression);
            }
        }
        Some(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYMBOLS: &str = "\
MODULE Linux x86_64 0123456789ABCDEF0123456789ABCDEF0 libtest.so
INFO CODE_ID 67452301AB89EFCD
FILE 0 /src/main.c
FILE 1 /src/inline.h
INLINE_ORIGIN 0 inner_helper
INLINE_ORIGIN 1 outer_helper
FUNC 1000 100 0 main
1000 10 10 0
1010 30 11 0
1040 c0 14 0
INLINE 0 11 0 1 1010 30
INLINE 1 20 1 0 1020 10
FUNC 1200 20 8 other
PUBLIC 1100 0 public_only
STACK CFI INIT 1000 100 .cfa: $rsp 8 + .ra: .cfa -8 + ^
STACK CFI 1001 .cfa: $rsp 16 + $rbp: .cfa -16 + ^
STACK CFI 1004 .cfa: $rbp 16 +
STACK WIN 4 1000 100 0 0 0 0 0 0 1 $eip
";

    fn symbols() -> SymbolFile {
        SymbolFile::from_bytes(SYMBOLS.as_bytes()).unwrap()
    }

    #[test]
    fn inline_chain_is_innermost_first() {
        let info = symbols().lookup(0x1024).unwrap();
        let frames: Vec<(&str, Option<&str>, Option<u32>)> = info
            .frames
            .iter()
            .map(|f| (f.function.as_str(), f.source_file.as_deref(), f.source_line))
            .collect();
        assert_eq!(
            frames,
            [
                ("inner_helper", Some("/src/main.c"), Some(11)),
                ("outer_helper", Some("/src/inline.h"), Some(20)),
                ("main", Some("/src/main.c"), Some(11)),
            ]
        );
        assert_eq!(info.function_base, 0x1000);
    }

    #[test]
    fn plain_function_lines() {
        let info = symbols().lookup(0x1050).unwrap();
        assert_eq!(info.frames.len(), 1);
        assert_eq!(info.frames[0].function, "main");
        assert_eq!(info.frames[0].source_line, Some(14));
    }

    #[test]
    fn publics_fill_gaps_between_functions() {
        let symbols = symbols();
        let info = symbols.lookup(0x1150).unwrap();
        assert_eq!(info.frames[0].function, "public_only");
        assert_eq!(info.frames[0].source_line, None);
        // A function starting after the public hides it.
        assert_eq!(symbols.lookup(0x1230), None);
        assert!(!symbols.covers(0x1230));
        assert_eq!(symbols.lookup(0x1210).unwrap().frames[0].function, "other");
        assert_eq!(symbols.lookup(0x500), None);
    }

    #[test]
    fn cfi_rows_apply_up_to_the_address() {
        let symbols = symbols();
        let rules = symbols.cfi_at(0x1000).unwrap();
        assert_eq!(rules.get(".cfa"), Some("$rsp 8 +"));
        assert_eq!(rules.get("$rbp"), None);

        let rules = symbols.cfi_at(0x1002).unwrap();
        assert_eq!(rules.get(".cfa"), Some("$rsp 16 +"));
        assert_eq!(rules.get("$rbp"), Some(".cfa -16 + ^"));

        let rules = symbols.cfi_at(0x10ff).unwrap();
        assert_eq!(rules.get(".cfa"), Some("$rbp 16 +"));
        assert_eq!(rules.get(".ra"), Some(".cfa -8 + ^"));

        assert!(symbols.cfi_at(0x1100).is_none());
        assert!(symbols.cfi_at(0xfff).is_none());
    }
}
