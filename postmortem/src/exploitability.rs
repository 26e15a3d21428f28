// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Coarse, best-effort rating of how likely a crash is to be exploitable.
//!
//! The rating never fails: anything the rules cannot judge is `Unknown`.

use crate::format::MD_EXCEPTION_CODE_LIN_DUMP_REQUESTED;
use crate::processor::reason::{
    SIGABRT, SIGBUS, SIGFPE, SIGILL, SIGKILL, SIGSEGV, SIGSYS, SIGTERM, SIGTRAP,
};
use crate::reader::{MinidumpException, ModuleList};
use crate::stackwalker::{FrameTrust, StackFrame};
use serde::Serialize;

/// Innermost frames examined by the function name rules
const INNERMOST_FRAMES: usize = 10;

/// Functions reached when a stack or buffer overflow was detected
const OVERFLOW_DETECTORS: &[&str] = &[
    "__stack_chk_fail",
    "__stack_chk_fail_local",
    "__fortify_fail",
    "__chk_fail",
];

/// Functions through which a program deliberately terminates
const DELIBERATE_EXITS: &[&str] = &["abort", "__assert_fail", "__assert_fail_base", "raise"];

/// Coarse verdict
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The crash is a controlled termination or a null dereference
    NotExploitable,
    /// Memory corruption cannot be ruled out
    Possible,
    /// Control flow or a guard page shows corruption
    Probable,
    /// The rules could not judge the crash
    Unknown,
}

/// A verdict and the rule that produced it
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Exploitability {
    /// The verdict
    pub verdict: Verdict,
    /// Why the verdict was reached
    pub rationale: String,
}

impl Exploitability {
    fn new(verdict: Verdict, rationale: impl Into<String>) -> Self {
        Self {
            verdict,
            rationale: rationale.into(),
        }
    }
}

/// Tuning of the classification.
#[derive(Clone, Debug)]
pub struct ExploitabilityOptions {
    /// Frames recovered with less trust are not considered by the function
    /// name rules
    pub min_trust: FrameTrust,
    /// Faults below this address count as null dereferences
    pub null_page_size: u64,
}

impl Default for ExploitabilityOptions {
    fn default() -> Self {
        Self {
            min_trust: FrameTrust::FramePointer,
            null_page_size: 64 * 1024,
        }
    }
}

fn innermost_function<'a>(
    frames: &'a [StackFrame],
    options: &ExploitabilityOptions,
    names: &[&str],
) -> Option<&'a str> {
    frames
        .iter()
        .take(INNERMOST_FRAMES)
        .filter(|frame| frame.trust >= options.min_trust)
        .filter_map(|frame| frame.symbol.as_ref())
        .flat_map(|symbol| symbol.frames.iter())
        .map(|f| f.function.as_str())
        .find(|function| names.contains(function))
}

/// Rates the crash described by `exception`.
///
/// `frames` is the walked stack of the crashing thread, innermost first.
pub fn classify(
    exception: Option<&MinidumpException>,
    frames: &[StackFrame],
    modules: &ModuleList,
    options: &ExploitabilityOptions,
) -> Exploitability {
    let Some(exception) = exception else {
        return Exploitability::new(Verdict::Unknown, "no exception record");
    };
    if exception.code == MD_EXCEPTION_CODE_LIN_DUMP_REQUESTED {
        return Exploitability::new(Verdict::NotExploitable, "dump was requested, no crash");
    }

    if let Some(function) = innermost_function(frames, options, OVERFLOW_DETECTORS) {
        return Exploitability::new(
            Verdict::Probable,
            format!("buffer overflow detected by {function}"),
        );
    }

    if let Some(frame) = frames.first() {
        let pc = frame.instruction();
        if modules.module_at_address(pc).is_none() {
            return Exploitability::new(
                Verdict::Probable,
                format!("instruction pointer {pc:#x} is outside known code"),
            );
        }
    }

    match exception.code {
        SIGABRT => {
            let rationale = match innermost_function(frames, options, DELIBERATE_EXITS) {
                Some(function) => format!("program aborted through {function}"),
                None => "program aborted".to_string(),
            };
            Exploitability::new(Verdict::NotExploitable, rationale)
        }
        SIGSEGV | SIGBUS if exception.address < options.null_page_size => {
            Exploitability::new(
                Verdict::NotExploitable,
                format!("null pointer dereference at {:#x}", exception.address),
            )
        }
        SIGSEGV | SIGBUS => Exploitability::new(
            Verdict::Possible,
            format!("invalid memory access at {:#x}", exception.address),
        ),
        SIGILL => Exploitability::new(
            Verdict::Possible,
            "illegal instruction inside known code",
        ),
        SIGFPE | SIGTRAP | SIGKILL | SIGTERM | SIGSYS => Exploitability::new(
            Verdict::NotExploitable,
            "signal does not indicate memory corruption",
        ),
        _ => Exploitability::new(Verdict::Unknown, "unrecognized crash reason"),
    }
}
