//! The device a local client opens to send I/O control requests.

use {
    hypervisor::{debugger::ioctl, error::HypervisorError, platform::native},
    wdk_sys::{
        ntddk::{IoCreateDevice, IoCreateSymbolicLink, IoDeleteDevice, IoDeleteSymbolicLink, IofCompleteRequest, RtlInitUnicodeString},
        DEVICE_OBJECT, DRIVER_OBJECT, FILE_DEVICE_SECURE_OPEN, FILE_DEVICE_UNKNOWN, IO_NO_INCREMENT, IRP, IRP_MJ_CLOSE, IRP_MJ_CREATE,
        IRP_MJ_DEVICE_CONTROL, NTSTATUS, NT_SUCCESS, STATUS_BUFFER_TOO_SMALL, STATUS_INVALID_DEVICE_REQUEST, STATUS_SUCCESS, STATUS_UNSUCCESSFUL,
        UNICODE_STRING,
    },
};

/// Builds a NUL-terminated UTF-16 string from an ASCII literal.
macro_rules! wide {
    ($text:literal) => {{
        const TEXT: &str = concat!($text, "\0");
        const WIDE: [u16; TEXT.len()] = {
            let bytes = TEXT.as_bytes();
            let mut wide = [0u16; TEXT.len()];
            let mut index = 0;
            while index < bytes.len() {
                wide[index] = bytes[index] as u16;
                index += 1;
            }
            wide
        };
        &WIDE
    }};
}

pub(crate) use wide;

const DEVICE_NAME: &[u16] = wide!("\\Device\\HyperDbgDebuggerDevice");
const SYMBOLIC_LINK: &[u16] = wide!("\\DosDevices\\HyperDbgDebuggerDevice");

static mut DEVICE: *mut DEVICE_OBJECT = core::ptr::null_mut();

fn unicode_string(text: &'static [u16]) -> UNICODE_STRING {
    let mut string: UNICODE_STRING = unsafe { core::mem::zeroed() };
    unsafe { RtlInitUnicodeString(&mut string, text.as_ptr()) };
    string
}

/// Creates the device and its `\\.\HyperDbgDebuggerDevice` link and installs the dispatch
/// routines.
pub fn create(driver: &mut DRIVER_OBJECT) -> Result<(), NTSTATUS> {
    let mut device_name = unicode_string(DEVICE_NAME);
    let mut symbolic_link = unicode_string(SYMBOLIC_LINK);
    let mut device: *mut DEVICE_OBJECT = core::ptr::null_mut();

    let status = unsafe { IoCreateDevice(driver, 0, &mut device_name, FILE_DEVICE_UNKNOWN, FILE_DEVICE_SECURE_OPEN, 0, &mut device) };
    if !NT_SUCCESS(status) {
        return Err(status);
    }

    let status = unsafe { IoCreateSymbolicLink(&mut symbolic_link, &mut device_name) };
    if !NT_SUCCESS(status) {
        unsafe { IoDeleteDevice(device) };
        return Err(status);
    }

    driver.MajorFunction[IRP_MJ_CREATE as usize] = Some(dispatch_create_close);
    driver.MajorFunction[IRP_MJ_CLOSE as usize] = Some(dispatch_create_close);
    driver.MajorFunction[IRP_MJ_DEVICE_CONTROL as usize] = Some(dispatch_device_control);

    unsafe { DEVICE = device };
    log::info!("Device created");
    Ok(())
}

pub fn delete(driver: *mut DRIVER_OBJECT) {
    let device = unsafe { core::mem::replace(&mut DEVICE, core::ptr::null_mut()) };
    if device.is_null() {
        return;
    }

    if let Some(driver) = unsafe { driver.as_mut() } {
        driver.MajorFunction[IRP_MJ_DEVICE_CONTROL as usize] = None;
    }

    let mut symbolic_link = unicode_string(SYMBOLIC_LINK);
    unsafe {
        IoDeleteSymbolicLink(&mut symbolic_link);
        IoDeleteDevice(device);
    }
}

fn complete(irp: *mut IRP, status: NTSTATUS, information: u64) -> NTSTATUS {
    unsafe {
        (*irp).IoStatus.__bindgen_anon_1.Status = status;
        (*irp).IoStatus.Information = information;
        IofCompleteRequest(irp, IO_NO_INCREMENT as i8);
    }
    status
}

unsafe extern "C" fn dispatch_create_close(_device: *mut DEVICE_OBJECT, irp: *mut IRP) -> NTSTATUS {
    complete(irp, STATUS_SUCCESS, 0)
}

/// Runs one buffered I/O control request through the engine.
unsafe extern "C" fn dispatch_device_control(_device: *mut DEVICE_OBJECT, irp: *mut IRP) -> NTSTATUS {
    let stack = unsafe { (*irp).Tail.Overlay.__bindgen_anon_2.__bindgen_anon_1.CurrentStackLocation };
    let parameters = unsafe { (*stack).Parameters.DeviceIoControl };
    let buffer = unsafe { (*irp).AssociatedIrp.SystemBuffer } as *mut u8;

    let (Some(platform), Some(state)) = (native::platform(), hypervisor::core_state()) else {
        return complete(irp, STATUS_UNSUCCESSFUL, 0);
    };

    let input = match buffer.is_null() {
        true => &[][..],
        false => unsafe { core::slice::from_raw_parts(buffer, parameters.InputBufferLength as usize) },
    };

    let output = match ioctl::dispatch(platform, state, parameters.IoControlCode, input) {
        Ok(output) => output,
        Err(HypervisorError::ProtocolMismatch) => return complete(irp, STATUS_INVALID_DEVICE_REQUEST, 0),
        Err(error) => {
            log::warn!("IOCTL {:#x} failed: {}", parameters.IoControlCode, error);
            return complete(irp, STATUS_UNSUCCESSFUL, 0);
        }
    };

    if output.len() > parameters.OutputBufferLength as usize || (buffer.is_null() && !output.is_empty()) {
        return complete(irp, STATUS_BUFFER_TOO_SMALL, 0);
    }

    if !output.is_empty() {
        unsafe { core::ptr::copy_nonoverlapping(output.as_ptr(), buffer, output.len()) };
    }
    complete(irp, STATUS_SUCCESS, output.len() as u64)
}
