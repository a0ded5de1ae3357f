//! The debugger's kernel driver.
//!
//! Loading the driver builds the engine state, virtualizes every processor and exposes the device
//! a local client talks to. When a debugger is configured on a serial port, it is attached before
//! the processors are virtualized so the first halt can already reach it.

#![no_std]

extern crate alloc;

// Set up a panic handler for non-test configurations.
#[cfg(not(test))]
extern crate wdk_panic;

#[cfg(not(test))]
use wdk_alloc::WDKAllocator;

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: WDKAllocator = WDKAllocator;

mod config_file;
mod device;

use {
    alloc::{boxed::Box, sync::Arc},
    hypervisor::{
        debugger::{
            kd::{transport::Uart16550, KdDebugger},
            session::HaltHandler,
        },
        error::HypervisorError,
        intel::vmm::Vmm,
        platform::native::NativePlatform,
        CoreState,
    },
    log::LevelFilter,
    wdk_sys::{
        DRIVER_OBJECT, NTSTATUS, PUNICODE_STRING, STATUS_INSUFFICIENT_RESOURCES, STATUS_NOT_SUPPORTED, STATUS_SUCCESS, STATUS_UNSUCCESSFUL,
    },
};

/// COM2, where the log goes.
const LOG_PORT: u16 = 0x2f8;

/// The processors' VMX resources while the driver is loaded.
static mut VMM: Option<Vmm> = None;

/// The main entry point for the driver.
///
/// # Parameters
///
/// * `driver`: Reference to the system's DRIVER_OBJECT for this driver.
/// * `_registry_path`: Unused. Path to the driver's registry key.
///
/// # Returns
///
/// * `STATUS_SUCCESS` if the processors run virtualized and the device exists.
/// * An error status otherwise, with everything undone.
///
/// Reference: WDF expects a symbol with the name DriverEntry.
#[export_name = "DriverEntry"]
pub unsafe extern "system" fn driver_entry(driver: &mut DRIVER_OBJECT, _registry_path: PUNICODE_STRING) -> NTSTATUS {
    init_logger();
    log::info!("Driver Entry called");

    driver.DriverUnload = Some(driver_unload);

    match load(driver) {
        Ok(()) => STATUS_SUCCESS,
        Err(error) => {
            log::error!("Failed to load the debugger: {}", error);
            status_of(error)
        }
    }
}

/// Logs go to COM2 so they keep flowing once the processors run under VMX.
#[cfg(not(feature = "dbgprint"))]
fn init_logger() {
    com_logger::builder().base(LOG_PORT).filter(LevelFilter::Info).setup();
}

/// Logs go to the kernel debugger. Only usable until VMLAUNCH.
#[cfg(feature = "dbgprint")]
fn init_logger() {
    // Installing fails only when a logger is already set, and that one reports it.
    if let Err(error) = kernel_log::KernelLogger::init(LevelFilter::Info) {
        log::warn!("Kernel debugger logger not installed: {}", error);
    }
}

fn load(driver: &mut DRIVER_OBJECT) -> Result<(), HypervisorError> {
    let config = config_file::load();
    let platform = NativePlatform::initialize()?;
    let state = match hypervisor::initialize(platform, config) {
        Ok(state) => state,
        Err(error) => {
            platform.release();
            return Err(error);
        }
    };

    let debugger = attach_debugger(platform, state);

    let mut vmm = match Vmm::new(platform) {
        Ok(vmm) => vmm,
        Err(error) => {
            release(platform, state);
            return Err(error);
        }
    };

    if let Err(error) = vmm.virtualize_system(platform, state) {
        shutdown(platform, state, vmm);
        return Err(error);
    }
    log::info!("Successfully virtualized system!");

    if let Some(debugger) = debugger {
        if let Err(error) = debugger.start(platform) {
            log::warn!("Debugger did not acknowledge the start: {}", error);
        }
    }

    if let Err(status) = device::create(driver) {
        log::error!("Failed to create the device: {:#x}", status);
        shutdown(platform, state, vmm);
        return Err(HypervisorError::NotInitialized);
    }

    unsafe { VMM = Some(vmm) };
    Ok(())
}

/// Connects the serial debugger named by the configuration.
fn attach_debugger(platform: &NativePlatform, state: &CoreState) -> Option<Arc<KdDebugger>> {
    let config = &state.config;
    if config.serial_port == LOG_PORT {
        log::warn!("Serial port {:#x} carries the log, no debugger attached", config.serial_port);
        return None;
    }

    let uart = Uart16550::new(config.serial_port, config.serial_baud, config.serial_byte_timeout);
    uart.initialize(platform);

    let debugger = Arc::new(KdDebugger::new(Box::new(uart), config.base64_transport));
    state.session.set_handler(Some(debugger.clone() as Arc<dyn HaltHandler>));
    log::info!("Debugger attached on port {:#x}", config.serial_port);
    Some(debugger)
}

/// Leaves VMX on every processor and frees everything [`load`] built.
fn shutdown(platform: &NativePlatform, state: &CoreState, mut vmm: Vmm) {
    if let Err(error) = vmm.devirtualize_system(platform) {
        // A processor still in VMX operation keeps using its regions.
        log::error!("Failed to devirtualize system: {}", error);
        return;
    }
    vmm.free(platform);
    release(platform, state);
}

fn release(platform: &NativePlatform, state: &CoreState) {
    state.teardown(platform);
    platform.release();
}

/// The unload callback for the driver.
///
/// Note: Remove if manually mapping the kernel driver
pub extern "C" fn driver_unload(driver: *mut DRIVER_OBJECT) {
    device::delete(driver);

    let vmm = unsafe { VMM.take() };
    if let (Some(vmm), Some(platform), Some(state)) = (vmm, hypervisor::platform::native::platform(), hypervisor::core_state()) {
        shutdown(platform, state, vmm);
    }

    log::info!("Driver unloaded successfully!");
}

fn status_of(error: HypervisorError) -> NTSTATUS {
    match error {
        HypervisorError::UnsupportedProcessor => STATUS_NOT_SUPPORTED,
        HypervisorError::OutOfPool => STATUS_INSUFFICIENT_RESOURCES,
        _ => STATUS_UNSUCCESSFUL,
    }
}
