// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::buffer::DumpBuf;
use crate::bytes::Endian;
use crate::context::CpuContext;
use crate::format::{
    MDException, MDLocationDescriptor, MDMemoryDescriptor, MDRawBreakpadInfo,
    MDRawExceptionStream, MDRawMiscInfo, MDRawModule, MDRawSystemInfo, MDRawThread,
    MD_BREAKPAD_INFO_VALID_REQUESTING_THREAD_ID, MD_CVINFOELF_SIGNATURE,
    MD_EXCEPTION_MAXIMUM_PARAMETERS, MD_MISCINFO_FLAGS1_PROCESS_ID, MD_OS_LINUX,
};
use crate::snapshot::{ModuleMapping, SystemDescription};
use crate::CoreError;

/// Where the pieces of one thread ended up in the dump
pub(crate) struct ThreadRecord {
    pub tid: i32,
    pub stack: MDMemoryDescriptor,
    pub context: MDLocationDescriptor,
}

/// Contents of the exception stream
pub(crate) struct ExceptionRecord<'a> {
    pub tid: i32,
    pub code: u32,
    pub flags: u32,
    pub address: u64,
    pub parameters: &'a [u64],
    pub context: MDLocationDescriptor,
}

pub(crate) fn write_context(
    buf: &mut DumpBuf,
    context: &CpuContext,
    endian: Endian,
) -> Result<MDLocationDescriptor, CoreError> {
    buf.append(&context.to_bytes(endian))
}

pub(crate) fn write_thread_list(
    buf: &mut DumpBuf,
    threads: &[ThreadRecord],
) -> Result<MDLocationDescriptor, CoreError> {
    let raw: Vec<MDRawThread> = threads
        .iter()
        .map(|thread| MDRawThread {
            thread_id: thread.tid as u32,
            stack: thread.stack,
            thread_context: thread.context,
            ..Default::default()
        })
        .collect();

    tracing::info!(
        "Writing thread list of {} threads at offset 0x{:x}",
        raw.len(),
        buf.position()
    );
    buf.append_list(&raw)
}

fn write_cv_record(buf: &mut DumpBuf, build_id: &[u8]) -> Result<MDLocationDescriptor, CoreError> {
    let mut record = Vec::with_capacity(4 + build_id.len());
    record.extend_from_slice(&MD_CVINFOELF_SIGNATURE.to_ne_bytes());
    record.extend_from_slice(build_id);
    buf.append(&record)
}

pub(crate) fn write_module_list(
    buf: &mut DumpBuf,
    modules: &[&ModuleMapping],
) -> Result<MDLocationDescriptor, CoreError> {
    let mut raw = Vec::with_capacity(modules.len());
    for module in modules {
        tracing::debug!(
            "Module {} at 0x{:x}, size 0x{:x}, id {}",
            module.name,
            module.begin,
            module.size,
            module.debug_identifier()
        );
        let module_name_rva = buf.append_string(&module.name)?;
        let cv_record = write_cv_record(buf, &module.build_id)?;
        raw.push(MDRawModule {
            base_of_image: module.begin,
            size_of_image: u32::try_from(module.size).unwrap_or(u32::MAX),
            module_name_rva,
            cv_record,
            ..Default::default()
        });
    }

    tracing::info!(
        "Writing module list of {} modules at offset 0x{:x}",
        raw.len(),
        buf.position()
    );
    buf.append_list(&raw)
}

pub(crate) fn write_memory_list(
    buf: &mut DumpBuf,
    descriptors: &[MDMemoryDescriptor],
) -> Result<MDLocationDescriptor, CoreError> {
    tracing::info!(
        "Writing memory list of {} ranges at offset 0x{:x}",
        descriptors.len(),
        buf.position()
    );
    buf.append_list(descriptors)
}

pub(crate) fn write_exception(
    buf: &mut DumpBuf,
    exception: &ExceptionRecord<'_>,
) -> Result<MDLocationDescriptor, CoreError> {
    let mut information = [0_u64; MD_EXCEPTION_MAXIMUM_PARAMETERS];
    let count = exception.parameters.len().min(MD_EXCEPTION_MAXIMUM_PARAMETERS);
    information[..count].copy_from_slice(&exception.parameters[..count]);

    let stream = MDRawExceptionStream {
        thread_id: exception.tid as u32,
        exception_record: MDException {
            exception_code: exception.code,
            exception_flags: exception.flags,
            exception_address: exception.address,
            number_parameters: count as u32,
            exception_information: information,
            ..Default::default()
        },
        thread_context: exception.context,
        ..Default::default()
    };

    tracing::info!(
        "Writing exception 0x{:x} of thread {} at offset 0x{:x}",
        exception.code,
        exception.tid,
        buf.position()
    );
    buf.append_struct(&stream)
}

pub(crate) fn write_system_info(
    buf: &mut DumpBuf,
    system: &SystemDescription,
) -> Result<MDLocationDescriptor, CoreError> {
    let csd_version_rva = buf.append_string(&system.csd_version)?;
    let mut cpu = [0_u8; 24];
    if let Some(vendor) = &system.cpu_vendor {
        cpu[..vendor.len()].copy_from_slice(vendor);
    }

    let info = MDRawSystemInfo {
        processor_architecture: system.arch.to_raw(),
        processor_level: system.processor_level,
        processor_revision: system.processor_revision,
        number_of_processors: system.cpu_count,
        major_version: system.major_version,
        minor_version: system.minor_version,
        build_number: system.build_number,
        platform_id: MD_OS_LINUX,
        csd_version_rva,
        cpu,
        ..Default::default()
    };
    buf.append_struct(&info)
}

pub(crate) fn write_misc_info(buf: &mut DumpBuf, pid: i32) -> Result<MDLocationDescriptor, CoreError> {
    let info = MDRawMiscInfo {
        size_of_info: std::mem::size_of::<MDRawMiscInfo>() as u32,
        flags1: MD_MISCINFO_FLAGS1_PROCESS_ID,
        process_id: pid as u32,
        ..Default::default()
    };
    buf.append_struct(&info)
}

pub(crate) fn write_breakpad_info(
    buf: &mut DumpBuf,
    requesting_tid: i32,
) -> Result<MDLocationDescriptor, CoreError> {
    let info = MDRawBreakpadInfo {
        validity: MD_BREAKPAD_INFO_VALID_REQUESTING_THREAD_ID,
        dump_thread_id: 0,
        requesting_thread_id: requesting_tid as u32,
    };
    buf.append_struct(&info)
}
