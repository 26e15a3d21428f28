// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Names of Linux signals and their `si_code` values as recorded in the
//! exception stream.

use crate::format::MD_EXCEPTION_CODE_LIN_DUMP_REQUESTED;

// Generic Linux signal numbers. The dump may come from another host, so
// these are not taken from the analysing platform's headers.
pub(crate) const SIGILL: u32 = 4;
pub(crate) const SIGTRAP: u32 = 5;
pub(crate) const SIGABRT: u32 = 6;
pub(crate) const SIGBUS: u32 = 7;
pub(crate) const SIGFPE: u32 = 8;
pub(crate) const SIGKILL: u32 = 9;
pub(crate) const SIGSEGV: u32 = 11;
pub(crate) const SIGTERM: u32 = 15;
pub(crate) const SIGSYS: u32 = 31;

const SIGNALS: [&str; 31] = [
    "SIGHUP", "SIGINT", "SIGQUIT", "SIGILL", "SIGTRAP", "SIGABRT", "SIGBUS", "SIGFPE", "SIGKILL",
    "SIGUSR1", "SIGSEGV", "SIGUSR2", "SIGPIPE", "SIGALRM", "SIGTERM", "SIGSTKFLT", "SIGCHLD",
    "SIGCONT", "SIGSTOP", "SIGTSTP", "SIGTTIN", "SIGTTOU", "SIGURG", "SIGXCPU", "SIGXFSZ",
    "SIGVTALRM", "SIGPROF", "SIGWINCH", "SIGIO", "SIGPWR", "SIGSYS",
];

/// Name of a signal number, `None` for real-time or unknown signals.
pub fn signal_name(signal: u32) -> Option<&'static str> {
    let index = usize::try_from(signal).ok()?.checked_sub(1)?;
    SIGNALS.get(index).copied()
}

fn code_name(signal: u32, code: i32) -> Option<&'static str> {
    let name = match (signal, code) {
        (SIGILL, 1) => "ILL_ILLOPC",
        (SIGILL, 2) => "ILL_ILLOPN",
        (SIGILL, 3) => "ILL_ILLADR",
        (SIGILL, 4) => "ILL_ILLTRP",
        (SIGILL, 5) => "ILL_PRVOPC",
        (SIGILL, 6) => "ILL_PRVREG",
        (SIGILL, 7) => "ILL_COPROC",
        (SIGILL, 8) => "ILL_BADSTK",
        (SIGFPE, 1) => "FPE_INTDIV",
        (SIGFPE, 2) => "FPE_INTOVF",
        (SIGFPE, 3) => "FPE_FLTDIV",
        (SIGFPE, 4) => "FPE_FLTOVF",
        (SIGFPE, 5) => "FPE_FLTUND",
        (SIGFPE, 6) => "FPE_FLTRES",
        (SIGFPE, 7) => "FPE_FLTINV",
        (SIGFPE, 8) => "FPE_FLTSUB",
        (SIGSEGV, 1) => "SEGV_MAPERR",
        (SIGSEGV, 2) => "SEGV_ACCERR",
        (SIGSEGV, 3) => "SEGV_BNDERR",
        (SIGSEGV, 4) => "SEGV_PKUERR",
        (SIGBUS, 1) => "BUS_ADRALN",
        (SIGBUS, 2) => "BUS_ADRERR",
        (SIGBUS, 3) => "BUS_OBJERR",
        (SIGBUS, 4) => "BUS_MCEERR_AR",
        (SIGBUS, 5) => "BUS_MCEERR_AO",
        (SIGTRAP, 1) => "TRAP_BRKPT",
        (SIGTRAP, 2) => "TRAP_TRACE",
        (SIGSYS, 1) => "SYS_SECCOMP",
        (_, 0) => "SI_USER",
        (_, 0x80) => "SI_KERNEL",
        (_, -1) => "SI_QUEUE",
        (_, -2) => "SI_TIMER",
        (_, -6) => "SI_TKILL",
        _ => return None,
    };
    Some(name)
}

/// Describes an exception stream's code and flags, e.g.
/// `SIGSEGV /SEGV_MAPERR`.
pub fn crash_reason(code: u32, flags: u32) -> String {
    if code == MD_EXCEPTION_CODE_LIN_DUMP_REQUESTED {
        return "DUMP_REQUESTED".to_string();
    }
    let Some(signal) = signal_name(code) else {
        return format!("{code:#010x}");
    };
    match code_name(code, flags as i32) {
        Some(name) => format!("{signal} /{name}"),
        None => format!("{signal} /{flags:#010x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_signals_and_codes() {
        assert_eq!(crash_reason(SIGSEGV, 1), "SIGSEGV /SEGV_MAPERR");
        assert_eq!(crash_reason(SIGABRT, -6i32 as u32), "SIGABRT /SI_TKILL");
        assert_eq!(crash_reason(SIGFPE, 0x42), "SIGFPE /0x00000042");
        assert_eq!(crash_reason(0xffff_ffff, 0), "DUMP_REQUESTED");
        assert_eq!(crash_reason(40, 0), "0x00000028");
        assert_eq!(signal_name(0), None);
        assert_eq!(signal_name(31), Some("SIGSYS"));
    }
}
