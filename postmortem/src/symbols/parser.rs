// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{CfiEntry, Function, Inlinee, LineRecord, ModuleRecord, PublicSymbol, SymbolFile};
use crate::SymbolError;

type ParseResult<T> = Result<T, &'static str>;

fn hex(token: &str) -> ParseResult<u64> {
    u64::from_str_radix(token, 16).map_err(|_| "invalid hexadecimal number")
}

fn dec(token: &str) -> ParseResult<u32> {
    token.parse().map_err(|_| "invalid decimal number")
}

/// Splits off `n` whitespace separated fields, returning the rest of the
/// line trimmed.
fn fields(line: &str, n: usize) -> ParseResult<(Vec<&str>, &str)> {
    let mut out = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    for _ in 0..n {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        if end == 0 {
            return Err("missing field");
        }
        out.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Ok((out, rest.trim_end()))
}

/// Strips the optional `m` marker of functions folded by the linker.
fn strip_multiple(rest: &str) -> &str {
    match rest.strip_prefix("m ") {
        Some(stripped) => stripped.trim_start(),
        None => rest,
    }
}

fn symbol_name(name: &str) -> String {
    if name.is_empty() {
        "<name omitted>".to_string()
    } else {
        name.to_string()
    }
}

/// Parses `reg: expr reg: expr ...` into register and expression pairs.
pub(super) fn parse_rules(text: &str) -> ParseResult<Vec<(String, String)>> {
    let mut rules: Vec<(String, String)> = Vec::new();
    for token in text.split_whitespace() {
        match token.strip_suffix(':') {
            Some(register) if !register.is_empty() => {
                rules.push((register.to_string(), String::new()));
            }
            _ => {
                let (_, expression) = rules.last_mut().ok_or("expression without a register")?;
                if !expression.is_empty() {
                    expression.push(' ');
                }
                expression.push_str(token);
            }
        }
    }
    if rules.is_empty() || rules.iter().any(|(_, e)| e.is_empty()) {
        return Err("empty unwind rule");
    }
    Ok(rules)
}

#[derive(Default)]
struct Parser {
    symbols: SymbolFile,
    function: Option<u64>,
    cfi: Option<u64>,
}

impl Parser {
    fn current_function(&mut self) -> ParseResult<&mut Function> {
        self.function
            .and_then(|address| self.symbols.functions.get_mut(&address))
            .ok_or("record outside of a function")
    }

    fn line(&mut self, line: &str) -> ParseResult<()> {
        if let Some(rest) = line.strip_prefix("MODULE ") {
            let (f, name) = fields(rest, 3)?;
            self.symbols.module = Some(ModuleRecord {
                os: f[0].to_string(),
                arch: f[1].to_string(),
                id: f[2].to_string(),
                name: name.to_string(),
            });
        } else if let Some(rest) = line.strip_prefix("INFO ") {
            if let Some(code_id) = rest.strip_prefix("CODE_ID ") {
                let (f, _) = fields(code_id, 1)?;
                self.symbols.code_id = Some(f[0].to_string());
            }
        } else if let Some(rest) = line.strip_prefix("FILE ") {
            let (f, name) = fields(rest, 1)?;
            self.symbols.files.insert(dec(f[0])?, name.to_string());
        } else if let Some(rest) = line.strip_prefix("INLINE_ORIGIN ") {
            let (f, name) = fields(rest, 1)?;
            self.symbols
                .inline_origins
                .insert(dec(f[0])?, symbol_name(name));
        } else if let Some(rest) = line.strip_prefix("FUNC ") {
            let (f, name) = fields(strip_multiple(rest), 3)?;
            let address = hex(f[0])?;
            let function = Function {
                address,
                size: hex(f[1])?,
                parameter_size: u32::try_from(hex(f[2])?).map_err(|_| "parameter size")?,
                name: symbol_name(name),
                lines: Vec::new(),
                inlinees: Vec::new(),
            };
            self.symbols.functions.entry(address).or_insert(function);
            self.function = Some(address);
        } else if let Some(rest) = line.strip_prefix("INLINE ") {
            let (f, ranges) = fields(rest, 4)?;
            let tokens: Vec<&str> = ranges.split_whitespace().collect();
            if tokens.is_empty() || tokens.len() % 2 != 0 {
                return Err("inline ranges come in address and size pairs");
            }
            let ranges = tokens
                .chunks_exact(2)
                .map(|pair| Ok((hex(pair[0])?, hex(pair[1])?)))
                .collect::<ParseResult<Vec<_>>>()?;
            let inlinee = Inlinee {
                depth: dec(f[0])?,
                call_line: dec(f[1])?,
                call_file: dec(f[2])?,
                origin: dec(f[3])?,
                ranges,
            };
            self.current_function()?.inlinees.push(inlinee);
        } else if let Some(rest) = line.strip_prefix("PUBLIC ") {
            let (f, name) = fields(strip_multiple(rest), 2)?;
            let address = hex(f[0])?;
            self.symbols.publics.entry(address).or_insert(PublicSymbol {
                address,
                parameter_size: u32::try_from(hex(f[1])?).map_err(|_| "parameter size")?,
                name: symbol_name(name),
            });
            self.function = None;
        } else if let Some(rest) = line.strip_prefix("STACK CFI INIT ") {
            let (f, rules) = fields(rest, 2)?;
            let address = hex(f[0])?;
            let entry = CfiEntry {
                address,
                size: hex(f[1])?,
                init: parse_rules(rules)?,
                deltas: Vec::new(),
            };
            self.symbols.cfi.entry(address).or_insert(entry);
            self.cfi = Some(address);
        } else if let Some(rest) = line.strip_prefix("STACK CFI ") {
            let (f, rules) = fields(rest, 1)?;
            let address = hex(f[0])?;
            let rules = parse_rules(rules)?;
            let entry = self
                .cfi
                .and_then(|init| self.symbols.cfi.get_mut(&init))
                .ok_or("unwind rule row without an INIT record")?;
            entry.deltas.push((address, rules));
        } else if line.starts_with("STACK ") {
            // Windows frame data is not used for ELF modules.
        } else if line.starts_with(|c: char| c.is_ascii_hexdigit()) {
            let (f, _) = fields(line, 4)?;
            let record = LineRecord {
                address: hex(f[0])?,
                size: hex(f[1])?,
                line: dec(f[2])?,
                file: dec(f[3])?,
            };
            self.current_function()?.lines.push(record);
        } else {
            tracing::debug!("Skipping unknown record {line}");
        }
        Ok(())
    }
}

pub(super) fn parse(data: &[u8]) -> Result<SymbolFile, SymbolError> {
    let mut parser = Parser::default();
    for (index, raw) in data.split(|b| *b == b'\n').enumerate() {
        let line = std::str::from_utf8(raw).map_err(|_| SymbolError::ParseError {
            line: index + 1,
            reason: "invalid UTF-8",
        })?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        parser
            .line(line)
            .map_err(|reason| SymbolError::ParseError {
                line: index + 1,
                reason,
            })?;
    }

    let mut symbols = parser.symbols;
    for function in symbols.functions.values_mut() {
        function.lines.sort_by_key(|l| l.address);
    }
    for entry in symbols.cfi.values_mut() {
        entry.deltas.sort_by_key(|(address, _)| *address);
    }
    tracing::debug!(
        "Parsed {} functions, {} public symbols, {} CFI entries",
        symbols.functions.len(),
        symbols.publics.len(),
        symbols.cfi.len()
    );
    Ok(symbols)
}
