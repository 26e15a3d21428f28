// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reconstructs call stacks from a thread's registers and stack memory.
//!
//! Each step tries, in order: the CFI rules of the current function, the
//! frame pointer convention of the architecture, the link register (context
//! frame only), and finally scanning the stack for a return address. The
//! first caller that makes progress up the stack wins.

mod amd64;
mod arm;
mod arm64;
mod mips;
mod ppc;
mod sparc;
mod x86;

use crate::context::CpuContext;
use crate::format::CpuArch;
use crate::reader::{MemoryRegion, MinidumpModule, ModuleList};
use crate::symbols::{evaluate, CfiRules, SymbolInfo, Symbolizer};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// How a frame was recovered, from least to most reliable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameTrust {
    /// Unknown origin
    None,
    /// Found by scanning the stack for a return address
    Scan,
    /// Found by scanning, and the caller has CFI to continue with
    CfiScan,
    /// Derived from the frame pointer chain
    FramePointer,
    /// Derived from CFI rules
    Cfi,
    /// Registers captured from the thread itself
    Context,
}

impl FrameTrust {
    /// Description used in reports
    pub fn description(self) -> &'static str {
        match self {
            FrameTrust::None => "unknown",
            FrameTrust::Scan => "stack scanning",
            FrameTrust::CfiScan => "call frame info with scanning",
            FrameTrust::FramePointer => "previous frame's frame pointer",
            FrameTrust::Cfi => "call frame info",
            FrameTrust::Context => "given as instruction pointer in context",
        }
    }
}

/// One frame of a call stack
#[derive(Clone, Debug)]
pub struct StackFrame {
    /// Registers of the frame; only the stack and instruction pointers and
    /// callee-saved registers are meaningful above the context frame
    pub context: CpuContext,
    /// How the frame was found
    pub trust: FrameTrust,
    /// Module holding the instruction
    pub module: Option<MinidumpModule>,
    /// Symbols at the instruction, innermost inlined function first
    pub symbol: Option<SymbolInfo>,
}

impl StackFrame {
    fn new(context: CpuContext, trust: FrameTrust) -> Self {
        Self {
            context,
            trust,
            module: None,
            symbol: None,
        }
    }

    /// Instruction pointer of the frame
    pub fn instruction(&self) -> u64 {
        self.context.instruction_pointer()
    }

    /// Address used for symbol and CFI lookups.
    ///
    /// Callers point after their call instruction, which may already belong
    /// to the next line or function.
    pub fn lookup_address(&self) -> u64 {
        match self.trust {
            FrameTrust::Context => self.instruction(),
            _ => self.instruction().saturating_sub(1),
        }
    }

    /// Name of the outermost function, when symbols are known
    pub fn function_name(&self) -> Option<&str> {
        self.symbol
            .as_ref()
            .and_then(SymbolInfo::outermost)
            .map(|f| f.function.as_str())
    }
}

impl Serialize for StackFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("StackFrame", 5)?;
        state.serialize_field("instruction", &self.instruction())?;
        state.serialize_field("trust", &self.trust)?;
        state.serialize_field("module", &self.module.as_ref().map(|m| m.file_name()))?;
        state.serialize_field(
            "module_offset",
            &self
                .module
                .as_ref()
                .map(|m| self.instruction().wrapping_sub(m.base_address)),
        )?;
        state.serialize_field("symbol", &self.symbol)?;
        state.end()
    }
}

/// Why a walk ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkStatus {
    /// No further caller could be found
    Complete,
    /// The frame limit was reached
    FrameLimit,
    /// The only callers found did not move up the stack
    NonAdvancing,
    /// The thread has no registers
    MissingContext,
    /// No unwinder exists for the architecture
    UnsupportedArch,
}

/// Frames of one thread, innermost first
#[derive(Clone, Debug, Serialize)]
pub struct CallStack {
    /// Frames, the context frame first
    pub frames: Vec<StackFrame>,
    /// Why the walk ended
    pub status: WalkStatus,
}

/// Limits of a stack walk.
#[derive(Clone, Debug)]
pub struct WalkerOptions {
    /// Stop after this many frames
    pub max_frames: usize,
    /// Words scanned looking for a return address
    pub max_scan_words: usize,
    /// Words scanned above the context frame, where the return address may
    /// be further away
    pub max_context_scan_words: usize,
    /// Allow recovering frames by stack scanning
    pub allow_scan: bool,
}

impl Default for WalkerOptions {
    fn default() -> Self {
        Self {
            max_frames: 1024,
            max_scan_words: 40,
            max_context_scan_words: 40 * 4,
            allow_scan: true,
        }
    }
}

/// Stack contents of the thread being walked
pub(crate) struct StackMemory<'a> {
    region: Option<&'a MemoryRegion<'a>>,
    width: usize,
}

impl<'a> StackMemory<'a> {
    pub fn new(region: Option<&'a MemoryRegion<'a>>, width: usize) -> Self {
        Self { region, width }
    }

    /// Reads a pointer-sized word.
    pub fn word(&self, address: u64) -> Option<u64> {
        self.region?.read_word(address, self.width)
    }
}

/// Architecture-specific unwinding rules.
pub(crate) trait Unwinder: Sync {
    /// Caller recovered through the frame pointer convention.
    fn frame_pointer_caller(&self, callee: &CpuContext, stack: &StackMemory<'_>)
        -> Option<CpuContext>;

    /// Caller whose return address was found on the stack at `slot`.
    fn scanned_caller(
        &self,
        callee: &CpuContext,
        slot: u64,
        return_address: u64,
        _stack: &StackMemory<'_>,
    ) -> Option<CpuContext> {
        let mut caller = callee.clone();
        caller.set_instruction_pointer(return_address);
        caller.set_stack_pointer(slot.checked_add(callee.pointer_width() as u64)?);
        Some(caller)
    }

    /// Register holding the return address in leaf functions
    fn link_register(&self) -> Option<&'static str> {
        None
    }
}

fn unwinder(arch: CpuArch) -> Option<&'static dyn Unwinder> {
    Some(match arch {
        CpuArch::X86 => &x86::X86Unwinder,
        CpuArch::Amd64 => &amd64::Amd64Unwinder,
        CpuArch::Arm => &arm::ArmUnwinder,
        CpuArch::Arm64 => &arm64::Arm64Unwinder,
        CpuArch::Mips | CpuArch::Mips64 => &mips::MipsUnwinder,
        CpuArch::Ppc | CpuArch::Ppc64 => &ppc::PpcUnwinder,
        CpuArch::Sparc => &sparc::SparcUnwinder,
        CpuArch::Unknown(_) => return None,
    })
}

/// Follows a conventional `[fp] = caller fp, [fp + width] = return address`
/// frame chain.
pub(crate) fn frame_chain_caller(
    callee: &CpuContext,
    stack: &StackMemory<'_>,
    fp_register: &str,
) -> Option<CpuContext> {
    let width = callee.pointer_width() as u64;
    let fp = callee.get_register(fp_register)?;
    if fp == 0 || fp % width != 0 || fp < callee.stack_pointer() {
        return None;
    }
    let caller_fp = stack.word(fp)?;
    let return_address = stack.word(fp.checked_add(width)?)?;
    let caller_sp = fp.checked_add(2 * width)?;

    let mut caller = callee.clone();
    caller.set_register(fp_register, caller_fp)?;
    caller.set_stack_pointer(caller_sp);
    caller.set_instruction_pointer(return_address);
    Some(caller)
}

/// Applies CFI rules to the callee's registers.
fn cfi_caller(callee: &CpuContext, rules: &CfiRules, stack: &StackMemory<'_>) -> Option<CpuContext> {
    let memory = |address: u64| stack.word(address);
    let registers = |name: &str| callee.get_register(name);
    let cfa = evaluate(rules.get(".cfa")?, &registers, &memory)?;
    let with_cfa = |name: &str| match name {
        ".cfa" => Some(cfa),
        _ => callee.get_register(name),
    };
    let return_address = evaluate(rules.get(".ra")?, &with_cfa, &memory)?;

    let mut caller = callee.clone();
    for (register, expression) in rules.iter() {
        if register.starts_with('.') {
            continue;
        }
        match evaluate(expression, &with_cfa, &memory) {
            Some(value) => {
                caller.set_register(register, value);
            }
            None => tracing::debug!("Cannot recover {register} with \"{expression}\""),
        }
    }
    caller.set_stack_pointer(cfa);
    caller.set_instruction_pointer(return_address);
    Some(caller)
}

/// Outcome of checking a candidate caller
enum Candidate {
    Accept,
    /// The walk reached code outside every module or address zero
    End,
    /// The caller does not move up the stack
    NonAdvancing,
}

fn check_caller(
    callee: &StackFrame,
    caller: &CpuContext,
    modules: &ModuleList,
) -> Candidate {
    let pc = caller.instruction_pointer();
    if pc == 0 || modules.module_at_address(pc).is_none() {
        return Candidate::End;
    }
    let (caller_sp, callee_sp) = (caller.stack_pointer(), callee.context.stack_pointer());
    let first = callee.trust == FrameTrust::Context;
    if caller_sp < callee_sp || (caller_sp == callee_sp && !first) {
        return Candidate::NonAdvancing;
    }
    if caller_sp == callee_sp && pc == callee.instruction() {
        return Candidate::NonAdvancing;
    }
    Candidate::Accept
}

/// Whether `address` looks like a return address into known code.
fn plausible_return_address(address: u64, modules: &ModuleList, symbolizer: &Symbolizer) -> bool {
    let Some(module) = modules.module_at_address(address) else {
        return false;
    };
    if address <= module.base_address {
        return false;
    }
    match symbolizer.symbols(module) {
        Some(symbols) => symbols.covers(address - 1 - module.base_address),
        None => true,
    }
}

struct Walker<'a> {
    unwinder: &'static dyn Unwinder,
    stack: StackMemory<'a>,
    modules: &'a ModuleList,
    symbolizer: &'a Symbolizer,
    options: &'a WalkerOptions,
}

impl Walker<'_> {
    fn resolve(&self, frame: &mut StackFrame) {
        let address = frame.lookup_address();
        if let Some(module) = self.modules.module_at_address(address) {
            frame.symbol = self.symbolizer.resolve(module, address);
            frame.module = Some(module.clone());
        }
    }

    fn scan(&self, callee: &StackFrame) -> Option<(CpuContext, FrameTrust)> {
        let width = callee.context.pointer_width() as u64;
        let words = match callee.trust {
            FrameTrust::Context => self.options.max_context_scan_words,
            _ => self.options.max_scan_words,
        };
        let sp = callee.context.stack_pointer();
        for i in 0..words as u64 {
            let slot = sp.checked_add(i * width)?;
            let value = self.stack.word(slot)?;
            if !plausible_return_address(value, self.modules, self.symbolizer) {
                continue;
            }
            let Some(caller) = self
                .unwinder
                .scanned_caller(&callee.context, slot, value, &self.stack)
            else {
                continue;
            };
            let has_cfi = self
                .modules
                .module_at_address(value - 1)
                .and_then(|m| self.symbolizer.get_cfi_for_address(m, value - 1))
                .is_some();
            let trust = if has_cfi {
                FrameTrust::CfiScan
            } else {
                FrameTrust::Scan
            };
            return Some((caller, trust));
        }
        None
    }

    /// Finds the caller of `callee`, trying each method in order of trust.
    fn caller(&self, callee: &StackFrame) -> Result<StackFrame, WalkStatus> {
        let mut status = WalkStatus::Complete;
        let mut consider = |candidate: Option<CpuContext>, trust: FrameTrust| {
            let context = candidate?;
            match check_caller(callee, &context, self.modules) {
                Candidate::Accept => Some(StackFrame::new(context, trust)),
                Candidate::End => None,
                Candidate::NonAdvancing => {
                    status = WalkStatus::NonAdvancing;
                    None
                }
            }
        };

        let address = callee.lookup_address();
        let cfi = self
            .modules
            .module_at_address(address)
            .and_then(|module| self.symbolizer.get_cfi_for_address(module, address))
            .and_then(|rules| cfi_caller(&callee.context, &rules, &self.stack));
        if let Some(frame) = consider(cfi, FrameTrust::Cfi) {
            return Ok(frame);
        }

        let fp = self
            .unwinder
            .frame_pointer_caller(&callee.context, &self.stack);
        if let Some(frame) = consider(fp, FrameTrust::FramePointer) {
            return Ok(frame);
        }

        if callee.trust == FrameTrust::Context {
            let lr = self.unwinder.link_register().and_then(|lr| {
                let mut caller = callee.context.clone();
                caller.set_instruction_pointer(callee.context.get_register(lr)?);
                Some(caller)
            });
            if let Some(frame) = consider(lr, FrameTrust::Scan) {
                return Ok(frame);
            }
        }

        if self.options.allow_scan {
            if let Some((context, trust)) = self.scan(callee) {
                if let Some(frame) = consider(Some(context), trust) {
                    return Ok(frame);
                }
            }
        }
        Err(status)
    }
}

/// Walks the stack of one thread.
///
/// Always terminates: every accepted caller moves the stack pointer up and
/// the number of frames is bounded by `options.max_frames`.
pub fn walk_stack(
    context: &CpuContext,
    stack: Option<&MemoryRegion<'_>>,
    modules: &ModuleList,
    symbolizer: &Symbolizer,
    options: &WalkerOptions,
) -> CallStack {
    let mut first = StackFrame::new(context.clone(), FrameTrust::Context);
    let Some(unwinder) = unwinder(context.arch()) else {
        tracing::warn!("No unwinder for {}", context.arch().name());
        return CallStack {
            frames: vec![first],
            status: WalkStatus::UnsupportedArch,
        };
    };
    let walker = Walker {
        unwinder,
        stack: StackMemory::new(stack, context.pointer_width()),
        modules,
        symbolizer,
        options,
    };

    walker.resolve(&mut first);
    let mut frames = vec![first];
    let status = loop {
        if frames.len() >= options.max_frames.max(1) {
            break WalkStatus::FrameLimit;
        }
        let Some(callee) = frames.last() else {
            break WalkStatus::Complete;
        };
        match walker.caller(callee) {
            Ok(mut frame) => {
                walker.resolve(&mut frame);
                tracing::debug!(
                    "Frame {} at 0x{:x} by {}",
                    frames.len(),
                    frame.instruction(),
                    frame.trust.description()
                );
                frames.push(frame);
            }
            Err(status) => break status,
        }
    };

    CallStack { frames, status }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::Endian;
    use crate::symbols::StringSymbolSupplier;
    use std::collections::HashMap;

    const STACK_BASE: u64 = 0x7fff_0000;

    fn modules() -> ModuleList {
        ModuleList {
            modules: vec![MinidumpModule {
                base_address: 0x40_0000,
                size: 0x1_0000,
                name: "/bin/app".to_string(),
                debug_file: "app".to_string(),
                debug_identifier: "00000000000000000000000000000000".to_string(),
                ..Default::default()
            }],
        }
    }

    fn symbolizer(text: &str) -> Symbolizer {
        let mut map = HashMap::new();
        map.insert("/bin/app".to_string(), text.to_string());
        Symbolizer::new(StringSymbolSupplier::new(map))
    }

    fn stack(words: &[u64]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn amd64(rip: u64, rsp: u64, rbp: u64) -> CpuContext {
        let mut ctx = CpuContext::empty(CpuArch::Amd64).unwrap();
        ctx.set_register("rip", rip);
        ctx.set_register("rsp", rsp);
        ctx.set_register("rbp", rbp);
        ctx
    }

    #[test]
    fn cyclic_frame_pointers_terminate() {
        // Two frames whose saved frame pointers point at each other.
        let words = [
            0,
            0,
            STACK_BASE + 0x20, // [base+0x10] saved rbp
            0x40_1000,         // return address
            STACK_BASE + 0x10, // [base+0x20] saved rbp
            0x40_2000,
        ];
        let bytes = stack(&words);
        let region = MemoryRegion::new(STACK_BASE, &bytes, Endian::Little);
        let context = amd64(0x40_0100, STACK_BASE, STACK_BASE + 0x10);
        let options = WalkerOptions {
            max_frames: 16,
            ..Default::default()
        };

        let stack = walk_stack(&context, Some(&region), &modules(), &symbolizer(""), &options);
        assert!(stack.frames.len() <= 16);
        assert_eq!(stack.frames[1].instruction(), 0x40_1000);
        assert_eq!(stack.frames[1].trust, FrameTrust::FramePointer);
        assert_eq!(stack.frames[2].instruction(), 0x40_2000);
        let sps: Vec<u64> = stack.frames.iter().map(|f| f.context.stack_pointer()).collect();
        assert!(sps.windows(2).all(|w| w[0] < w[1]), "{sps:x?}");
    }

    #[test]
    fn frame_limit_is_reported() {
        let context = amd64(0x40_0100, STACK_BASE, 0);
        let options = WalkerOptions {
            max_frames: 1,
            ..Default::default()
        };
        let stack = walk_stack(&context, None, &modules(), &symbolizer(""), &options);
        assert_eq!(stack.frames.len(), 1);
        assert_eq!(stack.status, WalkStatus::FrameLimit);
    }

    #[test]
    fn cfi_is_preferred_inside_its_range() {
        // rbp points at a frame naming 0x402005 as caller, CFI says the
        // return address sits at rsp.
        let words = [0x40_3005, 0, STACK_BASE + 0x30, 0x40_2005, 0, 0];
        let bytes = stack(&words);
        let region = MemoryRegion::new(STACK_BASE, &bytes, Endian::Little);
        let symbols = symbolizer(
            "FUNC 100 100 0 callee\nFUNC 2000 10 0 fp_caller\nFUNC 3000 10 0 cfi_caller\n\
             STACK CFI INIT 100 80 .cfa: $rsp 8 + .ra: .cfa -8 + ^\n",
        );

        let inside = amd64(0x40_0110, STACK_BASE, STACK_BASE + 0x10);
        let stack = walk_stack(&inside, Some(&region), &modules(), &symbols, &WalkerOptions::default());
        assert_eq!(stack.frames[1].trust, FrameTrust::Cfi);
        assert_eq!(stack.frames[1].function_name(), Some("cfi_caller"));
        assert_eq!(stack.frames[1].context.stack_pointer(), STACK_BASE + 8);

        let outside = amd64(0x40_01a0, STACK_BASE, STACK_BASE + 0x10);
        let stack = walk_stack(&outside, Some(&region), &modules(), &symbols, &WalkerOptions::default());
        assert_eq!(stack.frames[1].trust, FrameTrust::FramePointer);
        assert_eq!(stack.frames[1].function_name(), Some("fp_caller"));
    }

    #[test]
    fn scanning_requires_known_code() {
        let words = [0x1234, 0x40_2005, 0x40_3005];
        let bytes = stack(&words);
        let region = MemoryRegion::new(STACK_BASE, &bytes, Endian::Little);
        // Only the second candidate lies inside a function.
        let symbols = symbolizer("FUNC 100 100 0 leaf\nFUNC 3000 10 0 caller\n");
        let context = amd64(0x40_0110, STACK_BASE, 0);

        let stack = walk_stack(&context, Some(&region), &modules(), &symbols, &WalkerOptions::default());
        assert_eq!(stack.frames.len(), 2);
        assert_eq!(stack.frames[1].trust, FrameTrust::Scan);
        assert_eq!(stack.frames[1].function_name(), Some("caller"));
        assert_eq!(stack.frames[1].context.stack_pointer(), STACK_BASE + 0x18);

        let no_scan = WalkerOptions {
            allow_scan: false,
            ..Default::default()
        };
        let stack = walk_stack(&context, Some(&region), &modules(), &symbols, &no_scan);
        assert_eq!(stack.frames.len(), 1);
        assert_eq!(stack.status, WalkStatus::Complete);
    }

    #[test]
    fn leaf_caller_comes_from_link_register() {
        let mut arm64 = CpuContext::empty(CpuArch::Arm64).unwrap();
        arm64.set_register("pc", 0x40_0110);
        arm64.set_register("sp", STACK_BASE);
        arm64.set_register("x30", 0x40_2004);

        let mut mips = CpuContext::empty(CpuArch::Mips).unwrap();
        mips.set_register("pc", 0x40_0110);
        mips.set_register("sp", STACK_BASE);
        mips.set_register("ra", 0x40_2004);

        for context in [arm64, mips] {
            let stack = walk_stack(&context, None, &modules(), &symbolizer(""), &WalkerOptions::default());
            assert_eq!(stack.frames.len(), 2, "{:?}", context.arch());
            assert_eq!(stack.frames[1].instruction(), 0x40_2004);
            assert_eq!(stack.frames[1].trust, FrameTrust::Scan);
            assert_eq!(stack.status, WalkStatus::Complete);
        }
    }

    #[test]
    fn overflowing_frame_pointer_ends_the_walk() {
        let top = u64::MAX - 7;
        let bytes = stack(&[0x40_2005]);
        let region = MemoryRegion::new(top, &bytes, Endian::Little);
        let context = amd64(0x40_0110, top, top);

        let stack = walk_stack(&context, Some(&region), &modules(), &symbolizer(""), &WalkerOptions::default());
        assert_eq!(stack.frames.len(), 1);
    }

    #[test]
    fn missing_stack_memory_stops_after_context_frame() {
        let mut context = amd64(0x40_0110, STACK_BASE, 0);
        let stack = walk_stack(&context, None, &modules(), &symbolizer(""), &WalkerOptions::default());
        assert_eq!(stack.frames.len(), 1);
        assert_eq!(stack.status, WalkStatus::Complete);

        context.set_register("rip", 0);
        let stack = walk_stack(&context, None, &modules(), &symbolizer(""), &WalkerOptions::default());
        assert_eq!(stack.frames[0].module, None);
    }
}
