//! Thin wrappers over the VMX instructions.
//!
//! Failures are reported through [`HypervisorError`]; `vmread` and `vmwrite` failures are logged
//! instead, as they only happen on an unsupported field.

use crate::error::HypervisorError;

/// Enters VMX operation with the VMXON region at `vmxon_region`.
pub fn vmxon(vmxon_region: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmxon(vmxon_region) }.map_err(|_| HypervisorError::VmxonFailed)
}

pub fn vmxoff() -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmxoff() }.map_err(|_| HypervisorError::VmxoffFailed)
}

/// Initializes the VMCS at `vmcs_region` and marks it inactive.
pub fn vmclear(vmcs_region: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmclear(vmcs_region) }.map_err(|_| HypervisorError::VmclearFailed)
}

/// Makes the VMCS at `vmcs_region` current.
pub fn vmptrld(vmcs_region: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmptrld(vmcs_region) }.map_err(|_| HypervisorError::VmptrldFailed)
}

/// Reads a field of the current VMCS, or 0 if the field does not exist.
pub fn vmread(field: u32) -> u64 {
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
}

pub fn vmwrite(field: u32, value: u64) {
    if unsafe { x86::bits64::vmx::vmwrite(field, value) }.is_err() {
        log::warn!("VMWRITE of {:#x} to field {:#x} failed", value, field);
    }
}
