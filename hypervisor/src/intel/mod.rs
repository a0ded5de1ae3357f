//! Intel VT-x: the VMCS, extended page tables, event injection and the VM-exit handlers.
//!
//! Everything that executes VMX instructions directly only exists in Windows kernel builds. The
//! remaining modules reach the processor through [`crate::platform::Platform`].

pub mod bitmap;
pub mod controls;
pub mod descriptor;
pub mod ept;
pub mod events;
pub mod idt;
pub mod invept;
pub mod registers;
pub mod segmentation;
pub mod vcpu;
pub mod vmerror;
pub mod vmcs;
pub mod vmexit;
pub mod vmm;
pub mod vmx;

#[cfg(windows)]
pub mod support;
#[cfg(windows)]
pub mod vmlaunch;
