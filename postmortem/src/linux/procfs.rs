// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parsing of the proc file system and of mapped module images.

use crate::elf::{self, Elf64_Auxv, AT_SYSINFO_EHDR};
use crate::format::CpuArch;
use crate::snapshot::{MemoryMapping, ModuleMapping, SystemDescription, VaProtection};
use crate::{CoreError, ReadProcessMemory, SoftError};
use nix::unistd::{sysconf, SysconfVar};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use zerocopy::FromBytes;

/// Module name given to the vDSO, shared with other dump producers
pub(crate) const VDSO_MODULE_NAME: &str = "linux-gate.so";

const DELETED_SUFFIX: &str = " (deleted)";

/// Builds `<root>/<pid>/<node>`.
pub(crate) fn proc_path(root: &Path, pid: i32, node: &str) -> Result<PathBuf, CoreError> {
    if pid <= 0 || node.is_empty() {
        return Err(CoreError::InvalidProcPath {
            pid,
            node: node.to_string(),
        });
    }
    Ok(root.join(pid.to_string()).join(node))
}

/// Builds `<dir>/<node>` for a copy of a process directory.
pub(crate) fn copied_proc_path(dir: &Path, node: &str) -> Result<PathBuf, CoreError> {
    if node.is_empty() || dir.as_os_str().is_empty() {
        return Err(CoreError::InvalidProcPath {
            pid: 0,
            node: node.to_string(),
        });
    }
    Ok(dir.join(node))
}

/// Reads a file whose absence only degrades the dump.
pub(crate) fn read_optional(path: &Path, errors: &mut Vec<SoftError>) -> Option<Vec<u8>> {
    tracing::debug!("Reading {}", path.display());
    match std::fs::read(path) {
        Ok(data) => Some(data),
        Err(e) => {
            tracing::warn!("Cannot read {}: {e}", path.display());
            errors.push(SoftError::ProcFile {
                path: path.display().to_string(),
                reason: e.to_string(),
            });
            None
        }
    }
}

/// Parses the parent pid and command name out of a `stat` file.
pub(crate) fn parse_stat(stat: &str) -> Result<(i32, String), CoreError> {
    // The command name may contain spaces and parentheses, it spans from
    // the first '(' to the last ')'.
    let stat = stat.trim();
    let (Some(comm_start), Some(comm_end)) = (stat.find('('), stat.rfind(')')) else {
        tracing::error!(
            "Unsupported format of the procfs stat file, could not find command line: {}",
            stat
        );
        return Err(CoreError::ProcParsingError(stat.to_string()));
    };
    if comm_end < comm_start {
        return Err(CoreError::ProcParsingError(stat.to_string()));
    }
    let comm = stat[comm_start + 1..comm_end].to_string();

    // state, then ppid
    let ppid = stat[comm_end + 1..]
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| CoreError::ProcParsingError(stat.to_string()))?
        .parse::<i32>()?;

    Ok((ppid, comm))
}

/// Parses `/proc/<pid>/maps`.
///
/// Mappings keep their pseudo names (`[stack]`, `[vdso]`), file names lose
/// the `" (deleted)"` suffix. The result is ordered by start address.
pub(crate) fn parse_maps(text: &str) -> Result<Vec<MemoryMapping>, CoreError> {
    let mut maps = Vec::new();

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let bad_line = || CoreError::ProcParsingError(line.to_string());

        let mut fields = line.splitn(6, ' ');
        let range = fields.next().ok_or_else(bad_line)?;
        let perms = fields.next().ok_or_else(bad_line)?.as_bytes();
        let offset = fields.next().ok_or_else(bad_line)?;
        let _dev = fields.next().ok_or_else(bad_line)?;
        let _inode = fields.next().ok_or_else(bad_line)?;
        let name = fields.next().map(str::trim).filter(|n| !n.is_empty());

        let (begin, end) = range.split_once('-').ok_or_else(bad_line)?;
        let begin = u64::from_str_radix(begin, 16)?;
        let end = u64::from_str_radix(end, 16)?;
        let offset = u64::from_str_radix(offset, 16)?;
        if perms.len() < 4 || end < begin {
            return Err(bad_line());
        }

        let protection = VaProtection {
            read: perms[0] == b'r',
            write: perms[1] == b'w',
            execute: perms[2] == b'x',
            is_private: perms[3] == b'p',
        };

        let mapped_file_name = name.map(|n| n.strip_suffix(DELETED_SUFFIX).unwrap_or(n).to_string());

        tracing::debug!("Memory map [0x{begin:x}; 0x{end:x}] {mapped_file_name:?}");

        maps.push(MemoryMapping {
            begin,
            end,
            offset,
            protection,
            mapped_file_name,
        });
    }

    maps.sort_by_key(|m| m.begin);
    Ok(maps)
}

/// Splits the raw auxiliary vector into entries.
pub(crate) fn parse_auxv(data: &[u8]) -> Vec<Elf64_Auxv> {
    data.chunks_exact(std::mem::size_of::<Elf64_Auxv>())
        .filter_map(|chunk| Elf64_Auxv::read_from_bytes(chunk).ok())
        .take_while(|aux| aux.a_type != 0)
        .collect()
}

/// Address the vDSO is mapped at.
pub(crate) fn vdso_address(auxv: &[Elf64_Auxv]) -> Option<u64> {
    auxv.iter()
        .find(|aux| aux.a_type == AT_SYSINFO_EHDR)
        .map(|aux| aux.a_val)
        .filter(|addr| *addr != 0)
}

/// Adjacent mappings of one file, the shape of an image mapped by the loader
struct ModuleCandidate<'a> {
    name: &'a str,
    begin: u64,
    end: u64,
    executable: Option<&'a MemoryMapping>,
}

fn module_candidates(mappings: &[MemoryMapping], vdso: Option<u64>) -> Vec<ModuleCandidate<'_>> {
    let mut candidates: Vec<ModuleCandidate<'_>> = Vec::new();

    for mapping in mappings {
        let Some(name) = mapping.mapped_file_name.as_deref() else {
            continue;
        };
        let is_vdso = vdso == Some(mapping.begin) || name == "[vdso]";
        if !name.starts_with('/') && !is_vdso {
            continue;
        }
        if name.starts_with("/dev/") {
            // Reading device memory might have unintended side effects.
            tracing::info!("Skipping VA range mapped to device file {}", name);
            continue;
        }

        if let Some(last) = candidates.last_mut() {
            if last.name == name && last.end == mapping.begin {
                last.end = mapping.end;
                if last.executable.is_none() && mapping.protection.execute {
                    last.executable = Some(mapping);
                }
                continue;
            }
        }

        // An image starts with its ELF header at offset zero.
        if mapping.offset != 0 {
            continue;
        }
        candidates.push(ModuleCandidate {
            name: if is_vdso { VDSO_MODULE_NAME } else { name },
            begin: mapping.begin,
            end: mapping.end,
            executable: mapping.protection.execute.then_some(mapping),
        });
    }

    candidates.retain(|c| c.executable.is_some());
    candidates
}

fn build_id_from_file(path: &Path) -> Option<Vec<u8>> {
    let file = std::fs::File::open(path).ok()?;
    let mut read = |offset: u64, buf: &mut [u8]| file.read_exact_at(buf, offset).is_ok();
    elf::build_id_from_image(&mut read, 0, false)
}

/// Turns the memory map into the module list.
///
/// Each module is identified by the build id found in its loaded image,
/// then in its file under `mapped_root`, then by hashing its first page of
/// code.
pub(crate) fn identify_modules(
    mappings: &[MemoryMapping],
    vdso: Option<u64>,
    mapped_root: Option<&Path>,
    page_size: usize,
    reader: &mut dyn ReadProcessMemory,
    errors: &mut Vec<SoftError>,
) -> Vec<ModuleMapping> {
    let mut modules = Vec::new();

    for candidate in module_candidates(mappings, vdso) {
        let mut read = |address: u64, buf: &mut [u8]| reader.read_exact(address, buf).is_ok();
        let mut build_id = elf::build_id_from_image(&mut read, candidate.begin, true);

        if build_id.is_none() && candidate.name.starts_with('/') {
            let path = match mapped_root {
                Some(root) => root.join(candidate.name.trim_start_matches('/')),
                None => PathBuf::from(candidate.name),
            };
            tracing::debug!("Looking for a build id in {}", path.display());
            build_id = build_id_from_file(&path);
        }

        if build_id.is_none() {
            if let Some(text) = candidate.executable {
                let mut page = vec![0_u8; page_size.min(text.size() as usize)];
                if reader.read_exact(text.begin, &mut page).is_ok() {
                    tracing::debug!("Hashing the code of {}", candidate.name);
                    build_id = Some(elf::text_hash_identifier(&page));
                }
            }
        }

        let build_id = build_id.unwrap_or_else(|| {
            tracing::warn!("Cannot identify module {}", candidate.name);
            errors.push(SoftError::ModuleIdentifier(candidate.name.to_string()));
            Vec::new()
        });

        tracing::info!(
            "Module {} at [0x{:x}; 0x{:x}]",
            candidate.name,
            candidate.begin,
            candidate.end
        );
        modules.push(ModuleMapping {
            name: candidate.name.to_string(),
            begin: candidate.begin,
            size: candidate.end - candidate.begin,
            build_id,
        });
    }

    modules
}

/// Describes the capturing host: `uname` and the given `cpuinfo` text.
pub(crate) fn host_system_description(arch: CpuArch, cpuinfo: Option<&[u8]>) -> SystemDescription {
    let mut system = SystemDescription::new(arch);
    if let Some(cpuinfo) = cpuinfo {
        system.apply_cpuinfo(&String::from_utf8_lossy(cpuinfo));
    }
    match nix::sys::utsname::uname() {
        Ok(uts) => {
            let release = uts.release().to_string_lossy();
            system.apply_kernel_release(&release);
            system.csd_version = format!(
                "{} {} {} {}",
                uts.sysname().to_string_lossy(),
                release,
                uts.version().to_string_lossy(),
                uts.machine().to_string_lossy()
            );
        }
        Err(e) => tracing::warn!("uname failed: {e}"),
    }
    system
}

pub(crate) fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(s)) => s as usize,
        _ => 0x1000_usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a01000 r--p 00000000 08:01 1234 /usr/bin/app
55d0c0a01000-55d0c0a02000 r-xp 00001000 08:01 1234 /usr/bin/app
55d0c0a02000-55d0c0a03000 rw-p 00002000 08:01 1234 /usr/bin/app
7f0000000000-7f0000001000 rw-s 00000000 00:05 99   /dev/shm/buffer
7f0000010000-7f0000011000 r-xp 00000000 08:01 77   /tmp/my lib.so (deleted)
7ffd00000000-7ffd00021000 rw-p 00000000 00:00 0    [stack]
7ffd00030000-7ffd00032000 r-xp 00000000 00:00 0    [vdso]
";

    #[test]
    fn proc_paths() {
        let root = Path::new("/proc");
        assert_eq!(
            proc_path(root, 42, "maps").unwrap(),
            PathBuf::from("/proc/42/maps")
        );
        assert!(proc_path(root, 42, "").is_err());
        assert!(proc_path(root, 0, "maps").is_err());
        assert_eq!(
            copied_proc_path(Path::new("/tmp/copy"), "auxv").unwrap(),
            PathBuf::from("/tmp/copy/auxv")
        );
        assert!(copied_proc_path(Path::new("/tmp/copy"), "").is_err());
    }

    #[test]
    fn maps_lines() {
        let maps = parse_maps(MAPS).unwrap();
        assert_eq!(maps.len(), 7);
        assert_eq!(maps[1].begin, 0x55d0c0a01000);
        assert!(maps[1].protection.execute);
        assert!(!maps[1].protection.write);
        assert_eq!(maps[1].offset, 0x1000);
        assert!(!maps[3].protection.is_private);
        assert_eq!(maps[4].mapped_file_name.as_deref(), Some("/tmp/my lib.so"));
        assert_eq!(maps[5].mapped_file_name.as_deref(), Some("[stack]"));

        assert!(parse_maps("zzzz r-xp 0 0 0").is_err());
    }

    #[test]
    fn adjacent_mappings_become_one_module() {
        let maps = parse_maps(MAPS).unwrap();
        let candidates = module_candidates(&maps, Some(0x7ffd00030000));
        let names: Vec<&str> = candidates.iter().map(|c| c.name).collect();
        assert_eq!(names, ["/usr/bin/app", "/tmp/my lib.so", VDSO_MODULE_NAME]);
        assert_eq!(candidates[0].begin, 0x55d0c0a00000);
        assert_eq!(candidates[0].end, 0x55d0c0a03000);
        assert_eq!(candidates[0].executable.unwrap().begin, 0x55d0c0a01000);
    }

    #[test]
    fn stat_with_odd_command_name() {
        let (ppid, comm) = parse_stat("1234 (a (b) c) S 77 1234 1234 0 -1").unwrap();
        assert_eq!(ppid, 77);
        assert_eq!(comm, "a (b) c");
        assert!(parse_stat("garbage").is_err());
    }

    #[test]
    fn auxv_entries() {
        let mut raw = Vec::new();
        for (t, v) in [(6_u64, 4096_u64), (AT_SYSINFO_EHDR, 0x7fff_0000), (0, 0)] {
            raw.extend_from_slice(&t.to_ne_bytes());
            raw.extend_from_slice(&v.to_ne_bytes());
        }
        let auxv = parse_auxv(&raw);
        assert_eq!(auxv.len(), 2);
        assert_eq!(vdso_address(&auxv), Some(0x7fff_0000));
    }
}
