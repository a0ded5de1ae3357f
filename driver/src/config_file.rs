//! Reads `config.ini` from the driver's directory under the system root.

use {
    crate::device::wide,
    alloc::vec,
    hypervisor::config::Config,
    wdk_sys::{
        ntddk::{RtlInitUnicodeString, ZwClose, ZwCreateFile, ZwReadFile},
        FILE_ATTRIBUTE_NORMAL, FILE_NON_DIRECTORY_FILE, FILE_OPEN, FILE_SHARE_READ, FILE_SYNCHRONOUS_IO_NONALERT, GENERIC_READ, HANDLE,
        IO_STATUS_BLOCK, NT_SUCCESS, OBJECT_ATTRIBUTES, OBJ_CASE_INSENSITIVE, OBJ_KERNEL_HANDLE, UNICODE_STRING,
    },
};

const CONFIG_PATH: &[u16] = wide!("\\SystemRoot\\hyperdbg\\config.ini");

/// Larger files are truncated.
const MAX_CONFIG_SIZE: usize = 0x4000;

/// Loads the configuration. A missing or unreadable file yields the defaults.
pub fn load() -> Config {
    let Some(bytes) = read_file() else {
        log::info!("No config.ini, using defaults");
        return Config::default();
    };

    match core::str::from_utf8(&bytes) {
        Ok(text) => Config::parse(text),
        Err(error) => {
            log::warn!("config.ini is not valid UTF-8 ({}), using defaults", error);
            Config::default()
        }
    }
}

fn read_file() -> Option<alloc::vec::Vec<u8>> {
    let mut path: UNICODE_STRING = unsafe { core::mem::zeroed() };
    unsafe { RtlInitUnicodeString(&mut path, CONFIG_PATH.as_ptr()) };

    let mut attributes: OBJECT_ATTRIBUTES = unsafe { core::mem::zeroed() };
    attributes.Length = core::mem::size_of::<OBJECT_ATTRIBUTES>() as u32;
    attributes.ObjectName = &mut path;
    attributes.Attributes = OBJ_CASE_INSENSITIVE | OBJ_KERNEL_HANDLE;

    let mut handle: HANDLE = core::ptr::null_mut();
    let mut io_status: IO_STATUS_BLOCK = unsafe { core::mem::zeroed() };

    let status = unsafe {
        ZwCreateFile(
            &mut handle,
            GENERIC_READ,
            &mut attributes,
            &mut io_status,
            core::ptr::null_mut(),
            FILE_ATTRIBUTE_NORMAL,
            FILE_SHARE_READ,
            FILE_OPEN,
            FILE_SYNCHRONOUS_IO_NONALERT | FILE_NON_DIRECTORY_FILE,
            core::ptr::null_mut(),
            0,
        )
    };
    if !NT_SUCCESS(status) {
        return None;
    }

    let mut buffer = vec![0u8; MAX_CONFIG_SIZE];
    let status = unsafe {
        ZwReadFile(
            handle,
            core::ptr::null_mut(),
            None,
            core::ptr::null_mut(),
            &mut io_status,
            buffer.as_mut_ptr().cast(),
            buffer.len() as u32,
            core::ptr::null_mut(),
            core::ptr::null_mut(),
        )
    };
    unsafe { ZwClose(handle) };

    if !NT_SUCCESS(status) {
        log::warn!("Reading config.ini failed: {:#x}", status);
        return None;
    }

    buffer.truncate(io_status.Information as usize);
    Some(buffer)
}
