// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory processes and core files shared by the integration tests.

#![allow(dead_code)]

use postmortem::{
    CoreError, CpuArch, CpuContext, CrashInfo, MemoryMapping, MemoryRange, ModuleMapping,
    ProcessInfoSource, ReadProcessMemory, SystemDescription, ThreadView, VaProtection,
};

pub const PID: i32 = 4242;
pub const APP_BASE: u64 = 0x40_0000;
pub const APP_SIZE: u64 = 0x1_0000;
pub const STACK_BASE: u64 = 0x7fff_0000;
pub const STACK_SIZE: u64 = 0x1000;

/// Functions of the synthetic application, main calling f calling g calling h
pub const APP_SYMBOLS: &str = "MODULE Linux x86_64 000000000000000000000000000000000 app
FILE 0 app.c
FUNC 1000 100 0 main
1000 100 10 0
FUNC 1100 100 0 f
1100 100 20 0
FUNC 1200 100 0 g
1200 100 30 0
FUNC 1300 100 0 h
1300 100 40 0
";

pub struct SyntheticProcess {
    pub threads: Vec<ThreadView>,
    pub mappings: Vec<MemoryMapping>,
    pub modules: Vec<ModuleMapping>,
    pub crash: Option<CrashInfo>,
    pub system: SystemDescription,
}

impl ProcessInfoSource for SyntheticProcess {
    fn pid(&self) -> i32 {
        PID
    }
    fn threads(&self) -> &[ThreadView] {
        &self.threads
    }
    fn mappings(&self) -> &[MemoryMapping] {
        &self.mappings
    }
    fn modules(&self) -> &[ModuleMapping] {
        &self.modules
    }
    fn crash_info(&self) -> Option<&CrashInfo> {
        self.crash.as_ref()
    }
    fn system_info(&self) -> &SystemDescription {
        &self.system
    }
    fn page_size(&self) -> usize {
        0x1000
    }
}

/// Memory made of disjoint byte blocks; anything else is unreadable.
#[derive(Clone, Default)]
pub struct SyntheticMemory {
    pub blocks: Vec<(u64, Vec<u8>)>,
}

impl ReadProcessMemory for SyntheticMemory {
    fn read_process_memory(&mut self, base: usize, buf: &mut [u8]) -> Result<usize, CoreError> {
        let address = base as u64;
        for (start, bytes) in &self.blocks {
            let end = start + bytes.len() as u64;
            if address >= *start && address < end {
                let offset = (address - start) as usize;
                let n = buf.len().min(bytes.len() - offset);
                buf[..n].copy_from_slice(&bytes[offset..offset + n]);
                return Ok(n);
            }
        }
        Err(CoreError::MemoryRead {
            address,
            len: buf.len(),
        })
    }
}

fn mapping(begin: u64, end: u64, execute: bool, name: &str) -> MemoryMapping {
    MemoryMapping {
        begin,
        end,
        offset: 0,
        protection: VaProtection {
            is_private: true,
            read: true,
            write: !execute,
            execute,
        },
        mapped_file_name: Some(name.to_string()),
    }
}

pub fn amd64_context(rip: u64, rsp: u64, rbp: u64) -> CpuContext {
    let mut context = CpuContext::empty(CpuArch::Amd64).unwrap();
    context.set_register("rip", rip);
    context.set_register("rsp", rsp);
    context.set_register("rbp", rbp);
    context
}

/// Stack of a thread stopped in h, called from g, f and main with frame
/// pointers intact.
pub fn fgh_stack() -> Vec<u8> {
    let mut words = vec![0_u64; (STACK_SIZE / 8) as usize];
    let frames = [
        (0x10, STACK_BASE + 0x30, APP_BASE + 0x1220),
        (0x30, STACK_BASE + 0x50, APP_BASE + 0x1120),
        (0x50, STACK_BASE + 0x70, APP_BASE + 0x1020),
        (0x70, 0, 0),
    ];
    for (offset, saved_rbp, return_address) in frames {
        words[offset / 8] = saved_rbp;
        words[offset / 8 + 1] = return_address;
    }
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// A process whose threads all stand in h, each on its own stack.
pub fn fgh_process(thread_count: usize) -> (SyntheticProcess, SyntheticMemory) {
    let mut threads = Vec::new();
    let mut memory = SyntheticMemory::default();
    let mut mappings = vec![mapping(APP_BASE, APP_BASE + APP_SIZE, true, "/usr/bin/app")];

    for i in 0..thread_count {
        let stack_base = STACK_BASE + (i as u64) * 0x10_0000;
        // Saved frame pointers are relative to the first stack.
        let stack: Vec<u8> = fgh_stack()
            .chunks(8)
            .map(|w| u64::from_le_bytes(w.try_into().unwrap()))
            .map(|w| match w {
                w if (STACK_BASE..STACK_BASE + STACK_SIZE).contains(&w) => w - STACK_BASE + stack_base,
                w => w,
            })
            .flat_map(|w| w.to_le_bytes())
            .collect();
        memory.blocks.push((stack_base, stack));
        mappings.push(mapping(stack_base, stack_base + STACK_SIZE, false, "[stack]"));
        threads.push(ThreadView {
            tid: PID + i as i32,
            ppid: 1,
            comm: "app".to_string(),
            context: amd64_context(APP_BASE + 0x1310, stack_base, stack_base + 0x10),
            stack: Some(MemoryRange::new(stack_base, STACK_SIZE)),
        });
    }

    let process = SyntheticProcess {
        threads,
        mappings,
        modules: vec![ModuleMapping {
            name: "/usr/bin/app".to_string(),
            begin: APP_BASE,
            size: APP_SIZE,
            build_id: (0..20).collect(),
        }],
        crash: None,
        system: SystemDescription::new(CpuArch::Amd64),
    };
    (process, memory)
}

/// Writes a minimal x86-64 ELF core: one `PT_NOTE` with a thread per entry
/// of `threads` (tid, rip, rsp) and one `PT_LOAD` holding `stack` at
/// `stack_base`. The first thread crashed with `signal`.
pub fn build_core(
    threads: &[(i32, u64, u64)],
    signal: u16,
    fault: u64,
    stack_base: u64,
    stack: &[u8],
) -> Vec<u8> {
    fn note(out: &mut Vec<u8>, ntype: u32, desc: &[u8]) {
        out.extend_from_slice(&5_u32.to_le_bytes());
        out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        out.extend_from_slice(&ntype.to_le_bytes());
        out.extend_from_slice(b"CORE\0\0\0\0");
        out.extend_from_slice(desc);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }

    let mut notes = Vec::new();
    for (index, (tid, rip, rsp)) in threads.iter().enumerate() {
        let mut prstatus = vec![0_u8; 336];
        if index == 0 {
            prstatus[12..14].copy_from_slice(&signal.to_le_bytes());
        }
        prstatus[32..36].copy_from_slice(&tid.to_le_bytes());
        prstatus[36..40].copy_from_slice(&1_i32.to_le_bytes());
        let regs = 112;
        prstatus[regs + 16 * 8..regs + 17 * 8].copy_from_slice(&rip.to_le_bytes());
        prstatus[regs + 19 * 8..regs + 20 * 8].copy_from_slice(&rsp.to_le_bytes());
        note(&mut notes, 1, &prstatus);
        if index == 0 {
            let mut siginfo = vec![0_u8; 128];
            siginfo[0..4].copy_from_slice(&u32::from(signal).to_le_bytes());
            siginfo[8..12].copy_from_slice(&1_u32.to_le_bytes());
            siginfo[16..24].copy_from_slice(&fault.to_le_bytes());
            note(&mut notes, 0x5349_4749, &siginfo);
        }
    }

    let phoff = 64_u64;
    let notes_offset = phoff + 2 * 56;
    let load_offset = notes_offset + notes.len() as u64;

    let mut out = Vec::new();
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1]);
    out.resize(16, 0);
    out.extend_from_slice(&4_u16.to_le_bytes()); // ET_CORE
    out.extend_from_slice(&62_u16.to_le_bytes()); // EM_X86_64
    out.extend_from_slice(&1_u32.to_le_bytes());
    out.extend_from_slice(&0_u64.to_le_bytes()); // entry
    out.extend_from_slice(&phoff.to_le_bytes());
    out.extend_from_slice(&0_u64.to_le_bytes()); // shoff
    out.extend_from_slice(&0_u32.to_le_bytes()); // flags
    out.extend_from_slice(&64_u16.to_le_bytes());
    out.extend_from_slice(&56_u16.to_le_bytes());
    out.extend_from_slice(&2_u16.to_le_bytes());
    out.extend_from_slice(&[0; 6]);

    let mut phdr = |p_type: u32, flags: u32, offset: u64, vaddr: u64, size: u64| {
        out.extend_from_slice(&p_type.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&vaddr.to_le_bytes());
        out.extend_from_slice(&0_u64.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&0x1000_u64.to_le_bytes());
    };
    phdr(4, 4, notes_offset, 0, notes.len() as u64);
    phdr(1, 6, load_offset, stack_base, stack.len() as u64);

    out.extend_from_slice(&notes);
    out.extend_from_slice(stack);
    out
}
